//! Write-behind flusher.
//!
//! The recording path hands changed cells to a background thread over an
//! mpsc channel and returns immediately. The thread coalesces snapshots
//! (latest per key wins) and writes them to the [`HeatStore`]. Failed writes
//! stay pending and are retried with exponential backoff; nothing is dropped
//! while the flusher is alive.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::aggregator::{HeatCell, HeatCellRecord, HeatKey};
use crate::config::PersistenceConfig;
use crate::error::{HeatlineError, Result};
use crate::store::HeatStore;

enum Command {
    Write(Vec<HeatCellRecord>),
    ClearVenue(String),
    Flush(mpsc::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the background flusher thread.
///
/// Dropping the handle makes a final write attempt and joins the thread.
pub struct WriteBehind {
    sender: mpsc::Sender<Command>,
    handle: Option<thread::JoinHandle<()>>,
    failed_attempts: Arc<AtomicU64>,
}

impl WriteBehind {
    pub fn spawn(store: Arc<dyn HeatStore>, config: PersistenceConfig) -> Self {
        let (sender, receiver) = mpsc::channel();
        let failed_attempts = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            store,
            base_delay: Duration::from_millis(config.retry_base_ms.max(1)),
            max_delay: Duration::from_millis(config.retry_max_ms.max(config.retry_base_ms)),
            pending: BTreeMap::new(),
            pending_clears: Vec::new(),
            consecutive_failures: 0,
            retry_at: Instant::now(),
            failed_attempts: Arc::clone(&failed_attempts),
        };

        let handle = thread::Builder::new()
            .name("heatline-write-behind".to_string())
            .spawn(move || worker.run(receiver));

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                error!("[WriteBehind] Failed to spawn flusher thread: {}", e);
                None
            }
        };

        Self {
            sender,
            handle,
            failed_attempts,
        }
    }

    /// Queue cell snapshots for writing. Never blocks.
    pub fn submit(&self, records: Vec<HeatCellRecord>) {
        if records.is_empty() {
            return;
        }
        if self.sender.send(Command::Write(records)).is_err() {
            warn!("[WriteBehind] Flusher stopped, snapshot kept in memory only");
        }
    }

    /// Queue removal of all stored cells of a venue.
    pub fn clear_venue(&self, venue_id: &str) {
        if self
            .sender
            .send(Command::ClearVenue(venue_id.to_string()))
            .is_err()
        {
            warn!("[WriteBehind] Flusher stopped, clear of {} not persisted", venue_id);
        }
    }

    /// Write everything queued so far, ignoring any pending backoff.
    ///
    /// Blocks until the attempt completes. On failure the cells stay queued
    /// and background retries continue.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.sender
            .send(Command::Flush(ack_tx))
            .map_err(|_| HeatlineError::persistence("write-behind flusher is not running"))?;
        ack_rx
            .recv()
            .map_err(|_| HeatlineError::persistence("write-behind flusher stopped during flush"))?
    }

    /// Total failed store writes since start.
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[WriteBehind] Flusher thread panicked");
            }
        }
    }
}

struct Worker {
    store: Arc<dyn HeatStore>,
    base_delay: Duration,
    max_delay: Duration,
    pending: BTreeMap<(String, HeatKey), HeatCell>,
    /// Venues to clear before the pending writes are applied
    pending_clears: Vec<String>,
    consecutive_failures: u32,
    retry_at: Instant,
    failed_attempts: Arc<AtomicU64>,
}

impl Worker {
    fn run(mut self, receiver: mpsc::Receiver<Command>) {
        debug!("[WriteBehind] Flusher started");

        loop {
            let received = if self.has_pending() {
                let wait = self.retry_at.saturating_duration_since(Instant::now());
                receiver.recv_timeout(wait)
            } else {
                receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };

            let mut shutdown = false;
            match received {
                Ok(command) => {
                    shutdown = self.handle(command);
                    // Coalesce whatever else is already queued
                    while !shutdown {
                        match receiver.try_recv() {
                            Ok(command) => shutdown = self.handle(command),
                            Err(_) => break,
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => shutdown = true,
            }

            if shutdown {
                self.final_attempt();
                break;
            }

            if self.has_pending() && Instant::now() >= self.retry_at {
                let _ = self.attempt();
            }
        }

        debug!("[WriteBehind] Flusher stopped");
    }

    /// Apply one command. Returns true on shutdown.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Write(records) => {
                for record in records {
                    self.pending.insert((record.venue_id, record.key), record.cell);
                }
                false
            }
            Command::ClearVenue(venue_id) => {
                self.pending.retain(|(venue, _), _| venue != &venue_id);
                if !self.pending_clears.contains(&venue_id) {
                    self.pending_clears.push(venue_id);
                }
                false
            }
            Command::Flush(ack) => {
                let result = if self.has_pending() {
                    self.attempt()
                } else {
                    Ok(())
                };
                let _ = ack.send(result);
                false
            }
            Command::Shutdown => true,
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.pending_clears.is_empty()
    }

    fn attempt(&mut self) -> Result<()> {
        match self.write_pending() {
            Ok(written) => {
                if self.consecutive_failures > 0 {
                    info!(
                        "[WriteBehind] Store recovered after {} failed attempts",
                        self.consecutive_failures
                    );
                }
                debug!("[WriteBehind] Wrote {} cells", written);
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                let delay = self.backoff();
                self.retry_at = Instant::now() + delay;
                warn!(
                    "[WriteBehind] Write of {} cells failed (attempt {}), retrying in {:?}: {}",
                    self.pending.len(),
                    self.consecutive_failures,
                    delay,
                    e
                );
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> Result<usize> {
        while let Some(venue_id) = self.pending_clears.first() {
            self.store.clear_venue(venue_id)?;
            self.pending_clears.remove(0);
        }

        if self.pending.is_empty() {
            return Ok(0);
        }

        let records: Vec<HeatCellRecord> = self
            .pending
            .iter()
            .map(|((venue_id, key), cell)| HeatCellRecord {
                venue_id: venue_id.clone(),
                key: *key,
                cell: cell.clone(),
            })
            .collect();
        self.store.save_cells(&records)?;
        self.pending.clear();
        Ok(records.len())
    }

    fn backoff(&self) -> Duration {
        let shift = self.consecutive_failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    fn final_attempt(&mut self) {
        if !self.has_pending() {
            return;
        }
        if let Err(e) = self.write_pending() {
            let venues: HashSet<&str> = self.pending.keys().map(|(v, _)| v.as_str()).collect();
            error!(
                "[WriteBehind] Shutdown with {} unsaved cells across {} venues: {}",
                self.pending.len(),
                venues.len(),
                e
            );
        }
    }
}
