//! # SQLite persistence
//!
//! Embedded local storage, always available offline:
//!
//! - [`SqliteHeatStore`]: the [`HeatStore`] for aggregated heat cells
//! - [`SyncQueue`]: durable queue of completed sessions awaiting upload
//!
//! Each type owns its own connection; both can point at the same file.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::aggregator::{HeatCell, HeatCellRecord, HeatKey};
use crate::error::{HeatlineError, Result};
use crate::session::CompletedSession;
use crate::store::HeatStore;
use crate::GpsPoint;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| HeatlineError::persistence("database connection lock poisoned"))
}

// ============================================================================
// Heat store
// ============================================================================

/// Heat cells in SQLite. Profiles are stored as a MessagePack blob.
pub struct SqliteHeatStore {
    conn: Mutex<Connection>,
}

impl SqliteHeatStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = open(db_path)?;
        Self::init_schema(&conn)?;
        info!("[HeatStore] Opened {}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One row per (venue, grid cell or path edge)
            CREATE TABLE IF NOT EXISTS heat_cells (
                venue_id TEXT NOT NULL,
                cell_key TEXT NOT NULL,
                count INTEGER NOT NULL,
                profiles BLOB NOT NULL,
                cumulative_distance REAL NOT NULL,
                avg_speed REAL NOT NULL,
                speed_samples INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                start_lat REAL NOT NULL,
                start_lng REAL NOT NULL,
                end_lat REAL NOT NULL,
                end_lng REAL NOT NULL,
                PRIMARY KEY (venue_id, cell_key)
            );
        "#,
        )?;
        Ok(())
    }
}

impl HeatStore for SqliteHeatStore {
    fn save_cells(&self, records: &[HeatCellRecord]) -> Result<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO heat_cells
                 (venue_id, cell_key, count, profiles, cumulative_distance, avg_speed,
                  speed_samples, last_seen, start_lat, start_lng, end_lat, end_lng)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for record in records {
                let cell = &record.cell;
                let profiles = rmp_serde::to_vec(&cell.profiles)?;
                stmt.execute(params![
                    record.venue_id,
                    record.key.to_string(),
                    cell.count as i64,
                    profiles,
                    cell.cumulative_distance_m,
                    cell.rolling_avg_speed,
                    cell.speed_samples as i64,
                    cell.last_seen,
                    cell.start.latitude,
                    cell.start.longitude,
                    cell.end.latitude,
                    cell.end.longitude,
                ])?;
            }
        }
        tx.commit()?;
        debug!("[HeatStore] Saved {} cells", records.len());
        Ok(())
    }

    fn load_cells(&self, venue_id: &str) -> Result<Vec<(HeatKey, HeatCell)>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT cell_key, count, profiles, cumulative_distance, avg_speed, speed_samples,
                    last_seen, start_lat, start_lng, end_lat, end_lng
             FROM heat_cells WHERE venue_id = ?",
        )?;

        let rows = stmt
            .query_map(params![venue_id], |row| {
                let key: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let profiles: Vec<u8> = row.get(2)?;
                let speed_samples: i64 = row.get(5)?;
                let cell = HeatCell {
                    count: count.max(0) as u64,
                    profiles: Default::default(),
                    cumulative_distance_m: row.get(3)?,
                    rolling_avg_speed: row.get(4)?,
                    speed_samples: speed_samples.max(0) as u64,
                    last_seen: row.get(6)?,
                    start: GpsPoint::new(row.get(7)?, row.get(8)?),
                    end: GpsPoint::new(row.get(9)?, row.get(10)?),
                };
                Ok((key, profiles, cell))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut cells = Vec::with_capacity(rows.len());
        for (key, profiles, mut cell) in rows {
            let key: HeatKey = match key.parse() {
                Ok(k) => k,
                Err(e) => {
                    warn!("[HeatStore] Skipping cell of {}: {}", venue_id, e);
                    continue;
                }
            };
            cell.profiles = rmp_serde::from_slice(&profiles)?;
            cells.push((key, cell));
        }
        cells.sort_by_key(|(key, _)| *key);
        Ok(cells)
    }

    fn clear_venue(&self, venue_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM heat_cells WHERE venue_id = ?", params![venue_id])?;
        info!("[HeatStore] Cleared {} ({} cells)", venue_id, removed);
        Ok(())
    }
}

// ============================================================================
// Sync queue
// ============================================================================

/// A completed session waiting for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSession {
    /// Queue row id
    pub id: i64,
    pub session_id: String,
    /// Session serialized as JSON, ready to POST
    pub payload: String,
    /// Failed upload attempts so far
    pub attempts: u32,
    /// Unix ms before which no retry happens
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

/// Durable local queue joining recording to background upload.
pub struct SyncQueue {
    conn: Mutex<Connection>,
}

impl SyncQueue {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = open(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_due ON sync_queue(next_attempt_at);
        "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory queue (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    /// Queue a session for upload, due immediately.
    ///
    /// Re-queueing the same session id keeps the existing entry.
    pub fn enqueue(&self, session: &CompletedSession, now_ms: i64) -> Result<i64> {
        let payload = serde_json::to_string(session)?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO sync_queue (session_id, payload, attempts, next_attempt_at, created_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![session.session_id, payload, now_ms],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM sync_queue WHERE session_id = ?",
            params![session.session_id],
            |row| row.get(0),
        )?;
        debug!("[SyncQueue] Queued session {} as #{}", session.session_id, id);
        Ok(id)
    }

    /// Entries whose retry time has passed and that have attempts left, oldest first.
    pub fn due(&self, now_ms: i64, max_attempts: u32, limit: usize) -> Result<Vec<QueuedSession>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, payload, attempts, next_attempt_at, last_error
             FROM sync_queue
             WHERE next_attempt_at <= ?1 AND attempts < ?2
             ORDER BY next_attempt_at, id
             LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(params![now_ms, max_attempts, limit as i64], |row| {
                Ok(QueuedSession {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    payload: row.get(2)?,
                    attempts: row.get(3)?,
                    next_attempt_at: row.get(4)?,
                    last_error: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Remove an uploaded entry.
    pub fn mark_uploaded(&self, id: i64) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Record a failed attempt and when to try again.
    pub fn mark_failed(&self, id: i64, error: &str, next_attempt_at: i64) -> Result<()> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            "UPDATE sync_queue
             SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
             WHERE id = ?1",
            params![id, error, next_attempt_at],
        )?;
        if updated == 0 {
            warn!("[SyncQueue] mark_failed on missing entry #{}", id);
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<QueuedSession>> {
        let conn = lock(&self.conn)?;
        let entry = conn
            .query_row(
                "SELECT id, session_id, payload, attempts, next_attempt_at, last_error
                 FROM sync_queue WHERE id = ?",
                params![id],
                |row| {
                    Ok(QueuedSession {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        payload: row.get(2)?,
                        attempts: row.get(3)?,
                        next_attempt_at: row.get(4)?,
                        last_error: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Total queued entries, including exhausted ones.
    pub fn len(&self) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries that ran out of attempts and are kept for inspection.
    pub fn exhausted(&self, max_attempts: u32) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE attempts >= ?",
            params![max_attempts],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
