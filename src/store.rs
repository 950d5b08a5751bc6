//! Durable storage contract for heat cells.
//!
//! Key = (venue id, [`HeatKey`]) → [`HeatCell`]. Any key-value or document
//! store satisfies it. Saves are upserts of full cell snapshots, so replaying
//! a save is harmless.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::aggregator::{HeatCell, HeatCellRecord, HeatKey};
use crate::error::{HeatlineError, Result};

/// Storage backend for aggregated heat.
pub trait HeatStore: Send + Sync {
    /// Upsert cell snapshots. Either all records are stored or an error is returned.
    fn save_cells(&self, records: &[HeatCellRecord]) -> Result<()>;

    /// All cells persisted for a venue, in key order.
    fn load_cells(&self, venue_id: &str) -> Result<Vec<(HeatKey, HeatCell)>>;

    /// Remove every cell of a venue.
    fn clear_venue(&self, venue_id: &str) -> Result<()>;
}

/// In-process store for tests and offline use.
#[derive(Debug, Default)]
pub struct MemoryHeatStore {
    venues: Mutex<HashMap<String, BTreeMap<HeatKey, HeatCell>>>,
}

impl MemoryHeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cells for a venue.
    pub fn cell_count(&self, venue_id: &str) -> usize {
        self.venues
            .lock()
            .map(|venues| venues.get(venue_id).map_or(0, |cells| cells.len()))
            .unwrap_or(0)
    }
}

impl HeatStore for MemoryHeatStore {
    fn save_cells(&self, records: &[HeatCellRecord]) -> Result<()> {
        let mut venues = self
            .venues
            .lock()
            .map_err(|_| HeatlineError::persistence("memory store lock poisoned"))?;
        for record in records {
            venues
                .entry(record.venue_id.clone())
                .or_default()
                .insert(record.key, record.cell.clone());
        }
        Ok(())
    }

    fn load_cells(&self, venue_id: &str) -> Result<Vec<(HeatKey, HeatCell)>> {
        let venues = self
            .venues
            .lock()
            .map_err(|_| HeatlineError::persistence("memory store lock poisoned"))?;
        Ok(venues
            .get(venue_id)
            .map(|cells| cells.iter().map(|(k, c)| (*k, c.clone())).collect())
            .unwrap_or_default())
    }

    fn clear_venue(&self, venue_id: &str) -> Result<()> {
        let mut venues = self
            .venues
            .lock()
            .map_err(|_| HeatlineError::persistence("memory store lock poisoned"))?;
        venues.remove(venue_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::GridKey;
    use crate::GpsPoint;

    fn record(venue: &str, row: i64, count: u64) -> HeatCellRecord {
        let mut cell = HeatCell::new(GpsPoint::new(51.5, -0.12), GpsPoint::new(51.5001, -0.12));
        cell.count = count;
        HeatCellRecord {
            venue_id: venue.to_string(),
            key: HeatKey::Grid(GridKey { row, col: 0 }),
            cell,
        }
    }

    #[test]
    fn test_latest_snapshot_wins() {
        let store = MemoryHeatStore::new();
        store.save_cells(&[record("park", 1, 1)]).unwrap();
        store.save_cells(&[record("park", 1, 4)]).unwrap();

        let cells = store.load_cells("park").unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].1.count, 4);
    }

    #[test]
    fn test_venues_are_isolated() {
        let store = MemoryHeatStore::new();
        store
            .save_cells(&[record("park", 1, 1), record("zoo", 1, 2), record("zoo", 2, 2)])
            .unwrap();
        assert_eq!(store.cell_count("park"), 1);
        assert_eq!(store.cell_count("zoo"), 2);

        store.clear_venue("zoo").unwrap();
        assert!(store.load_cells("zoo").unwrap().is_empty());
        assert_eq!(store.cell_count("park"), 1);
    }
}
