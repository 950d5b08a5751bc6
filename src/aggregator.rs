//! # Segment Heat Aggregator
//!
//! Durable per-venue heat state. Every consecutive point pair of a visitor's
//! path is corrected, boundary-filtered and upserted into:
//!
//! - the integer grid cell containing the segment midpoint, and
//! - in snap-to-network mode, each distinct path edge its endpoints snap to.
//!
//! Each venue's cells sit behind their own mutex, so concurrent recording
//! into one venue is serialized while different venues proceed in parallel.
//! Changed cells are handed to the write-behind flusher; the recording path
//! never waits on storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::classify::{normalized_heat, HeatSegment};
use crate::config::{AggregatorConfig, PersistenceConfig};
use crate::error::{HeatlineError, OptionExt, Result};
use crate::geo_utils::{haversine_distance, midpoint, METERS_PER_DEGREE};
use crate::snapping::PathNetwork;
use crate::store::HeatStore;
use crate::transform::CoordinateTransform;
use crate::venue::{EdgeId, Venue, VenueDefinition};
use crate::writer::WriteBehind;
use crate::{GpsPoint, TrajectoryPoint};

// ============================================================================
// Keys
// ============================================================================

/// Integer grid cell index: `floor(coord / cell_degrees)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridKey {
    pub row: i64,
    pub col: i64,
}

impl GridKey {
    /// Quantize a corrected point. Same point and resolution, same key.
    pub fn from_point(point: &GpsPoint, cell_degrees: f64) -> Self {
        Self {
            row: (point.latitude / cell_degrees).floor() as i64,
            col: (point.longitude / cell_degrees).floor() as i64,
        }
    }
}

/// Identity of a heat cell within a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeatKey {
    Grid(GridKey),
    Edge(EdgeId),
}

impl fmt::Display for HeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeatKey::Grid(g) => write!(f, "grid:{}:{}", g.row, g.col),
            HeatKey::Edge(e) => write!(f, "edge:{}", e.0),
        }
    }
}

impl FromStr for HeatKey {
    type Err = HeatlineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HeatlineError::Serialization {
            message: format!("invalid heat key '{}'", s),
        };

        let mut parts = s.split(':');
        let key = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("grid"), Some(row), Some(col), None) => HeatKey::Grid(GridKey {
                row: row.parse().map_err(|_| invalid())?,
                col: col.parse().map_err(|_| invalid())?,
            }),
            (Some("edge"), Some(id), None, None) => {
                HeatKey::Edge(EdgeId(id.parse().map_err(|_| invalid())?))
            }
            _ => return Err(invalid()),
        };
        Ok(key)
    }
}

impl Serialize for HeatKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HeatKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Cells
// ============================================================================

/// Aggregated traffic for one grid cell or path edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatCell {
    /// Segments recorded; only grows until the venue is reset
    pub count: u64,
    /// Distinct mobility profiles that contributed
    pub profiles: BTreeSet<String>,
    pub cumulative_distance_m: f64,
    /// Mean of the speed samples seen so far, m/s
    pub rolling_avg_speed: f64,
    pub speed_samples: u64,
    /// Latest contributing timestamp (unix ms)
    pub last_seen: i64,
    /// Representative geometry: the edge itself, or the first segment seen in a grid cell
    pub start: GpsPoint,
    pub end: GpsPoint,
}

impl HeatCell {
    pub fn new(start: GpsPoint, end: GpsPoint) -> Self {
        Self {
            count: 0,
            profiles: BTreeSet::new(),
            cumulative_distance_m: 0.0,
            rolling_avg_speed: 0.0,
            speed_samples: 0,
            last_seen: 0,
            start,
            end,
        }
    }

    fn record(&mut self, profile: &str, distance_m: f64, speed: Option<f64>, timestamp: i64) {
        self.count += 1;
        if !self.profiles.contains(profile) {
            self.profiles.insert(profile.to_string());
        }
        self.cumulative_distance_m += distance_m;
        if let Some(speed) = speed {
            self.speed_samples += 1;
            self.rolling_avg_speed += (speed - self.rolling_avg_speed) / self.speed_samples as f64;
        }
        self.last_seen = self.last_seen.max(timestamp);
    }
}

/// A cell snapshot addressed for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatCellRecord {
    pub venue_id: String,
    pub key: HeatKey,
    pub cell: HeatCell,
}

/// What happened to one submitted segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    /// Upserted into the grid cell and any matched edges (possibly none)
    Recorded { grid: GridKey, edges: Vec<EdgeId> },
    /// An endpoint's accuracy radius exceeds the configured maximum
    LowAccuracy,
    /// An endpoint has non-finite or out-of-range coordinates
    InvalidPoint,
    /// An endpoint fails the boundary filter
    OutOfBounds,
}

impl SegmentOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, SegmentOutcome::Recorded { .. })
    }
}

/// Per-venue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VenueStats {
    pub recorded: u64,
    pub low_accuracy: u64,
    pub invalid: u64,
    pub out_of_bounds: u64,
    /// Recorded segments that matched no path edge
    pub unmatched: u64,
    pub grid_cells: usize,
    pub edge_cells: usize,
}

// ============================================================================
// Aggregator
// ============================================================================

struct VenueHeat {
    venue: Arc<Venue>,
    network: PathNetwork,
    cells: BTreeMap<HeatKey, HeatCell>,
    stats: VenueStats,
}

impl VenueHeat {
    fn new(venue: Venue) -> Self {
        let network = PathNetwork::new(venue.edges.clone());
        Self {
            venue: Arc::new(venue),
            network,
            cells: BTreeMap::new(),
            stats: VenueStats::default(),
        }
    }

    fn upsert(
        &mut self,
        key: HeatKey,
        geometry: (GpsPoint, GpsPoint),
        profile: &str,
        distance_m: f64,
        speed: Option<f64>,
        timestamp: i64,
    ) -> HeatCell {
        let cell = self
            .cells
            .entry(key)
            .or_insert_with(|| HeatCell::new(geometry.0, geometry.1));
        cell.record(profile, distance_m, speed, timestamp);
        cell.clone()
    }

    /// Take over cells recorded against a possibly different path network.
    ///
    /// Edge ids are positional, so an edge cell is matched to the current
    /// network by its endpoints. Returns `(moved, dropped)` edge cell counts.
    fn adopt_cells(&mut self, cells: impl IntoIterator<Item = (HeatKey, HeatCell)>) -> (usize, usize) {
        let (mut moved, mut dropped) = (0, 0);
        for (key, cell) in cells {
            let key = match key {
                HeatKey::Grid(_) => key,
                HeatKey::Edge(id) => match self.edge_with_geometry(&cell) {
                    Some(current) if current == id => key,
                    Some(current) => {
                        moved += 1;
                        HeatKey::Edge(current)
                    }
                    None => {
                        dropped += 1;
                        continue;
                    }
                },
            };
            if self.cells.insert(key, cell).is_some() {
                dropped += 1;
            }
        }
        (moved, dropped)
    }

    fn edge_with_geometry(&self, cell: &HeatCell) -> Option<EdgeId> {
        self.network
            .edges()
            .iter()
            .find(|e| e.start == cell.start && e.end == cell.end)
            .map(|e| e.id)
    }
}

/// Incremental heat aggregation for any number of venues.
///
/// An explicit instance owned by the caller; there is no process-wide state.
pub struct SegmentHeatAggregator {
    config: AggregatorConfig,
    transformer: Arc<dyn CoordinateTransform>,
    venues: RwLock<HashMap<String, Arc<Mutex<VenueHeat>>>>,
    store: Option<Arc<dyn HeatStore>>,
    writer: Option<WriteBehind>,
}

impl SegmentHeatAggregator {
    /// In-memory aggregator without durable storage.
    pub fn new(config: AggregatorConfig, transformer: Arc<dyn CoordinateTransform>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transformer,
            venues: RwLock::new(HashMap::new()),
            store: None,
            writer: None,
        })
    }

    /// Aggregator backed by `store` through a write-behind flusher.
    pub fn with_store(
        config: AggregatorConfig,
        transformer: Arc<dyn CoordinateTransform>,
        store: Arc<dyn HeatStore>,
        persistence: PersistenceConfig,
    ) -> Result<Self> {
        config.validate()?;
        persistence.validate()?;
        let writer = WriteBehind::spawn(Arc::clone(&store), persistence);
        Ok(Self {
            config,
            transformer,
            venues: RwLock::new(HashMap::new()),
            store: Some(store),
            writer: Some(writer),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn transformer(&self) -> &Arc<dyn CoordinateTransform> {
        &self.transformer
    }

    fn cell_degrees(&self) -> f64 {
        self.config.grid_cell_meters / METERS_PER_DEGREE
    }

    // ========================================================================
    // Venue registry
    // ========================================================================

    /// Load, validate and register a venue, restoring any persisted cells.
    pub fn register_venue(&self, definition: &VenueDefinition) -> Result<Arc<Venue>> {
        let venue = Venue::from_definition(definition, self.transformer.as_ref())?;
        let id = venue.id.clone();

        if self.read_venues()?.contains_key(&id) {
            return Err(HeatlineError::DuplicateVenue { venue_id: id });
        }

        let mut heat = VenueHeat::new(venue);
        self.restore_cells(&mut heat)?;
        let venue = Arc::clone(&heat.venue);

        let mut venues = self.write_venues()?;
        if venues.contains_key(&id) {
            return Err(HeatlineError::DuplicateVenue { venue_id: id });
        }
        venues.insert(id, Arc::new(Mutex::new(heat)));
        Ok(venue)
    }

    /// Swap a registered venue's geometry.
    ///
    /// Grid cells are kept. Edge cells follow their geometry: a cell moves to
    /// the new edge with the same endpoints and is discarded when no such
    /// edge remains.
    pub fn replace_venue(&self, definition: &VenueDefinition) -> Result<Arc<Venue>> {
        let venue = Venue::from_definition(definition, self.transformer.as_ref())?;
        let entry = self.venue_entry(&venue.id)?;
        let mut heat = lock(&entry)?;

        let mut replacement = VenueHeat::new(venue);
        let cells = std::mem::take(&mut heat.cells);
        let (moved, dropped) = replacement.adopt_cells(cells);
        replacement.stats = heat.stats.clone();

        if moved + dropped > 0 {
            warn!(
                "[Aggregator] {}: geometry change moved {} and discarded {} edge cells",
                replacement.venue.id, moved, dropped
            );
            if let Some(writer) = &self.writer {
                writer.clear_venue(&replacement.venue.id);
                writer.submit(records_for(&replacement.venue.id, &replacement.cells));
            }
        }

        *heat = replacement;
        info!("[Aggregator] Replaced geometry of {}", heat.venue.id);
        Ok(Arc::clone(&heat.venue))
    }

    fn restore_cells(&self, heat: &mut VenueHeat) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let (moved, dropped) = heat.adopt_cells(store.load_cells(&heat.venue.id)?);
        if moved + dropped > 0 {
            warn!(
                "[Aggregator] {}: stored edge cells out of date, {} moved and {} ignored",
                heat.venue.id, moved, dropped
            );
            if let Some(writer) = &self.writer {
                writer.clear_venue(&heat.venue.id);
                writer.submit(records_for(&heat.venue.id, &heat.cells));
            }
        }
        info!(
            "[Aggregator] {}: restored {} cells from storage",
            heat.venue.id,
            heat.cells.len()
        );
        Ok(())
    }

    /// Registered venue geometry.
    pub fn venue(&self, venue_id: &str) -> Result<Arc<Venue>> {
        let entry = self.venue_entry(venue_id)?;
        let heat = lock(&entry)?;
        Ok(Arc::clone(&heat.venue))
    }

    /// Registered venue ids, sorted.
    pub fn venue_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.read_venues()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Aggregate one consecutive point pair from a visitor's path.
    ///
    /// Filtered samples are reported through [`SegmentOutcome`], never as
    /// errors. Errors are limited to unknown venues and poisoned state.
    pub fn record_segment(
        &self,
        venue_id: &str,
        profile: &str,
        a: &TrajectoryPoint,
        b: &TrajectoryPoint,
    ) -> Result<SegmentOutcome> {
        let entry = self.venue_entry(venue_id)?;
        let mut heat = lock(&entry)?;

        if !a.is_valid() || !b.is_valid() {
            heat.stats.invalid += 1;
            return Ok(SegmentOutcome::InvalidPoint);
        }
        if a.accuracy > self.config.max_accuracy_m || b.accuracy > self.config.max_accuracy_m {
            heat.stats.low_accuracy += 1;
            return Ok(SegmentOutcome::LowAccuracy);
        }

        let a = self.transformer.to_local(a);
        let b = self.transformer.to_local(b);
        let (pa, pb) = (a.position(), b.position());

        if !heat.venue.boundary.contains(&pa) || !heat.venue.boundary.contains(&pb) {
            heat.stats.out_of_bounds += 1;
            return Ok(SegmentOutcome::OutOfBounds);
        }

        let distance_m = haversine_distance(&pa, &pb);
        let speed = segment_speed(&a, &b, distance_m);
        let timestamp = a.timestamp.max(b.timestamp);

        let grid = GridKey::from_point(&midpoint(&pa, &pb), self.cell_degrees());
        let mut changed = Vec::with_capacity(3);
        let cell = heat.upsert(HeatKey::Grid(grid), (pa, pb), profile, distance_m, speed, timestamp);
        changed.push((HeatKey::Grid(grid), cell));

        let mut edges: Vec<EdgeId> = Vec::new();
        if self.config.snap_to_network && !heat.network.is_empty() {
            let max_snap = self.config.max_snap_distance_m;
            edges = [pa, pb]
                .iter()
                .filter_map(|p| heat.network.nearest_edge(p, max_snap))
                .map(|m| m.edge_id)
                .collect();
            edges.sort_unstable();
            edges.dedup();

            if edges.is_empty() {
                heat.stats.unmatched += 1;
            }

            let share = distance_m / edges.len().max(1) as f64;
            for id in &edges {
                let Some(edge) = heat.network.edge(*id).copied() else {
                    continue;
                };
                let key = HeatKey::Edge(*id);
                let cell = heat.upsert(key, (edge.start, edge.end), profile, share, speed, timestamp);
                changed.push((key, cell));
            }
        }

        heat.stats.recorded += 1;

        // Submitted under the venue lock so snapshots reach the flusher in order
        if let Some(writer) = &self.writer {
            writer.submit(
                changed
                    .into_iter()
                    .map(|(key, cell)| HeatCellRecord {
                        venue_id: venue_id.to_string(),
                        key,
                        cell,
                    })
                    .collect(),
            );
        }

        Ok(SegmentOutcome::Recorded { grid, edges })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Renderable heat lines for a venue, sorted by key.
    ///
    /// With a path network and snapping enabled there is one segment per
    /// edge, unvisited edges at zero heat. Otherwise each grid cell is drawn
    /// from its representative point pair.
    pub fn generate_heat_segments(&self, venue_id: &str) -> Result<Vec<HeatSegment>> {
        let entry = self.venue_entry(venue_id)?;
        let heat = lock(&entry)?;

        let segments = if self.config.snap_to_network && !heat.network.is_empty() {
            let counts: Vec<(HeatKey, [[f64; 2]; 2], u64)> = heat
                .network
                .edges()
                .iter()
                .map(|edge| {
                    let key = HeatKey::Edge(edge.id);
                    let count = heat.cells.get(&key).map_or(0, |c| c.count);
                    (key, [edge.start.lon_lat(), edge.end.lon_lat()], count)
                })
                .collect();
            self.normalize(counts)
        } else {
            let counts: Vec<(HeatKey, [[f64; 2]; 2], u64)> = heat
                .cells
                .iter()
                .filter(|(key, _)| matches!(key, HeatKey::Grid(_)))
                .map(|(key, cell)| (*key, [cell.start.lon_lat(), cell.end.lon_lat()], cell.count))
                .collect();
            self.normalize(counts)
        };

        Ok(segments)
    }

    fn normalize(&self, mut counts: Vec<(HeatKey, [[f64; 2]; 2], u64)>) -> Vec<HeatSegment> {
        counts.sort_by_key(|(key, _, _)| *key);
        let ceiling = match self.config.count_ceiling {
            Some(c) => c,
            None => counts.iter().map(|(_, _, c)| *c).max().unwrap_or(0),
        };

        counts
            .into_iter()
            .map(|(key, coordinates, count)| {
                HeatSegment::new(key, coordinates, normalized_heat(count, ceiling))
            })
            .collect()
    }

    pub fn cell(&self, venue_id: &str, key: &HeatKey) -> Result<Option<HeatCell>> {
        let entry = self.venue_entry(venue_id)?;
        let heat = lock(&entry)?;
        Ok(heat.cells.get(key).cloned())
    }

    /// All cells of a venue in key order.
    pub fn cells(&self, venue_id: &str) -> Result<Vec<(HeatKey, HeatCell)>> {
        let entry = self.venue_entry(venue_id)?;
        let heat = lock(&entry)?;
        Ok(heat.cells.iter().map(|(k, c)| (*k, c.clone())).collect())
    }

    pub fn venue_stats(&self, venue_id: &str) -> Result<VenueStats> {
        let entry = self.venue_entry(venue_id)?;
        let heat = lock(&entry)?;
        let mut stats = heat.stats.clone();
        stats.grid_cells = heat
            .cells
            .keys()
            .filter(|k| matches!(k, HeatKey::Grid(_)))
            .count();
        stats.edge_cells = heat.cells.len() - stats.grid_cells;
        Ok(stats)
    }

    /// Explicitly drop all heat for a venue, in memory and in storage.
    pub fn reset_venue(&self, venue_id: &str) -> Result<()> {
        let entry = self.venue_entry(venue_id)?;
        let mut heat = lock(&entry)?;
        let removed = heat.cells.len();
        heat.cells.clear();
        heat.stats = VenueStats::default();
        if let Some(writer) = &self.writer {
            writer.clear_venue(venue_id);
        }
        info!("[Aggregator] Reset {} ({} cells removed)", venue_id, removed);
        Ok(())
    }

    /// Block until every change so far has been written. No-op without storage.
    pub fn flush(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Failed background writes since start.
    pub fn failed_writes(&self) -> u64 {
        self.writer.as_ref().map_or(0, |w| w.failed_attempts())
    }

    // ========================================================================
    // Locking helpers
    // ========================================================================

    fn venue_entry(&self, venue_id: &str) -> Result<Arc<Mutex<VenueHeat>>> {
        self.read_venues()?
            .get(venue_id)
            .cloned()
            .ok_or_unknown_venue(venue_id)
    }

    fn read_venues(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<VenueHeat>>>>> {
        self.venues
            .read()
            .map_err(|_| HeatlineError::Internal {
                message: "venue registry lock poisoned".to_string(),
            })
    }

    fn write_venues(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<VenueHeat>>>>> {
        self.venues
            .write()
            .map_err(|_| HeatlineError::Internal {
                message: "venue registry lock poisoned".to_string(),
            })
    }
}

fn lock(entry: &Mutex<VenueHeat>) -> Result<MutexGuard<'_, VenueHeat>> {
    entry.lock().map_err(|_| HeatlineError::Internal {
        message: "venue state lock poisoned".to_string(),
    })
}

fn records_for(venue_id: &str, cells: &BTreeMap<HeatKey, HeatCell>) -> Vec<HeatCellRecord> {
    cells
        .iter()
        .map(|(key, cell)| HeatCellRecord {
            venue_id: venue_id.to_string(),
            key: *key,
            cell: cell.clone(),
        })
        .collect()
}

/// Speed over the segment: travelled distance over elapsed time, falling
/// back to the mean device-reported speed when the timestamps don't advance.
fn segment_speed(a: &TrajectoryPoint, b: &TrajectoryPoint, distance_m: f64) -> Option<f64> {
    let elapsed_ms = (b.timestamp - a.timestamp).abs();
    if elapsed_ms > 0 {
        return Some(distance_m / (elapsed_ms as f64 / 1000.0));
    }
    match (a.speed, b.speed) {
        (Some(sa), Some(sb)) => Some((sa + sb) / 2.0),
        (Some(s), None) | (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryHeatStore;
    use crate::transform::IdentityTransform;
    use crate::venue::{LonLat, PathEdgeDefinition};

    fn square_park(with_edges: bool) -> VenueDefinition {
        let path_edges = if with_edges {
            vec![PathEdgeDefinition {
                vertices: vec![
                    LonLat::new(-0.128, 51.502),
                    LonLat::new(-0.122, 51.502),
                    LonLat::new(-0.122, 51.508),
                ],
            }]
        } else {
            vec![]
        };
        VenueDefinition {
            id: "park".to_string(),
            boundary: vec![
                LonLat::new(-0.130, 51.500),
                LonLat::new(-0.120, 51.500),
                LonLat::new(-0.120, 51.510),
                LonLat::new(-0.130, 51.510),
            ],
            path_edges,
        }
    }

    fn aggregator(config: AggregatorConfig) -> SegmentHeatAggregator {
        SegmentHeatAggregator::new(config, Arc::new(IdentityTransform)).unwrap()
    }

    fn pt(lat: f64, lng: f64, ts: i64) -> TrajectoryPoint {
        TrajectoryPoint::new(lat, lng, ts).with_accuracy(5.0)
    }

    #[test]
    fn test_heat_key_text_round_trip() {
        for key in [
            HeatKey::Grid(GridKey { row: 463_512, col: -1_153 }),
            HeatKey::Edge(EdgeId(7)),
        ] {
            assert_eq!(key.to_string().parse::<HeatKey>().unwrap(), key);
        }
        assert!("grid:1".parse::<HeatKey>().is_err());
        assert!("edge:x".parse::<HeatKey>().is_err());
        assert!("tile:1:2".parse::<HeatKey>().is_err());
    }

    #[test]
    fn test_grid_key_floors_negative_coordinates() {
        let cell = 10.0 / METERS_PER_DEGREE;
        let key = GridKey::from_point(&GpsPoint::new(-0.00001, -0.00001), cell);
        assert_eq!(key, GridKey { row: -1, col: -1 });

        let p = GpsPoint::new(51.505, -0.125);
        assert_eq!(GridKey::from_point(&p, cell), GridKey::from_point(&p, cell));
    }

    #[test]
    fn test_unknown_and_duplicate_venue() {
        let agg = aggregator(AggregatorConfig::default());
        let err = agg
            .record_segment("nowhere", "walker", &pt(51.5, -0.12, 0), &pt(51.5, -0.12, 1))
            .unwrap_err();
        assert!(matches!(err, HeatlineError::UnknownVenue { .. }));

        agg.register_venue(&square_park(false)).unwrap();
        assert!(matches!(
            agg.register_venue(&square_park(false)),
            Err(HeatlineError::DuplicateVenue { .. })
        ));
    }

    #[test]
    fn test_filtered_samples_are_outcomes() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(false)).unwrap();

        let good = pt(51.505, -0.125, 0);
        let sloppy = pt(51.5051, -0.125, 1_000).with_accuracy(80.0);
        let outside = pt(51.520, -0.125, 1_000);
        let broken = pt(f64::NAN, -0.125, 1_000);

        assert_eq!(
            agg.record_segment("park", "walker", &good, &sloppy).unwrap(),
            SegmentOutcome::LowAccuracy
        );
        assert_eq!(
            agg.record_segment("park", "walker", &good, &outside).unwrap(),
            SegmentOutcome::OutOfBounds
        );
        assert_eq!(
            agg.record_segment("park", "walker", &good, &broken).unwrap(),
            SegmentOutcome::InvalidPoint
        );

        let stats = agg.venue_stats("park").unwrap();
        assert_eq!(stats.recorded, 0);
        assert_eq!(stats.low_accuracy, 1);
        assert_eq!(stats.out_of_bounds, 1);
        assert_eq!(stats.invalid, 1);
        assert!(agg.cells("park").unwrap().is_empty());
    }

    #[test]
    fn test_cell_tracks_profiles_distance_and_speed() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(false)).unwrap();

        let a = pt(51.50500, -0.12500, 0);
        let b = pt(51.50502, -0.12500, 2_000);
        agg.record_segment("park", "wheelchair", &a, &b).unwrap();
        agg.record_segment("park", "stroller", &a, &b).unwrap();
        agg.record_segment("park", "wheelchair", &a, &b).unwrap();

        let cells = agg.cells("park").unwrap();
        assert_eq!(cells.len(), 1);
        let cell = &cells[0].1;
        assert_eq!(cell.count, 3);
        assert_eq!(cell.profiles.len(), 2);
        assert!((cell.cumulative_distance_m - 3.0 * 2.2239).abs() < 0.01);
        assert!((cell.rolling_avg_speed - 1.1120).abs() < 0.01);
        assert_eq!(cell.speed_samples, 3);
        assert_eq!(cell.last_seen, 2_000);
    }

    #[test]
    fn test_snap_to_network_assigns_edges() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(true)).unwrap();

        let outcome = agg
            .record_segment(
                "park",
                "walker",
                &pt(51.50201, -0.1270, 0),
                &pt(51.50201, -0.1269, 5_000),
            )
            .unwrap();
        match outcome {
            SegmentOutcome::Recorded { edges, .. } => assert_eq!(edges, vec![EdgeId(0)]),
            other => panic!("unexpected outcome {:?}", other),
        }

        // Far from both edges: grid only
        let outcome = agg
            .record_segment(
                "park",
                "walker",
                &pt(51.5080, -0.1280, 0),
                &pt(51.5081, -0.1280, 5_000),
            )
            .unwrap();
        assert!(matches!(outcome, SegmentOutcome::Recorded { ref edges, .. } if edges.is_empty()));
        assert_eq!(agg.venue_stats("park").unwrap().unmatched, 1);
    }

    #[test]
    fn test_segment_across_two_edges_shares_distance() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(true)).unwrap();

        // Around the corner at (51.502, -0.122)
        let a = pt(51.50201, -0.1222, 0);
        let b = pt(51.5022, -0.12201, 5_000);
        let outcome = agg.record_segment("park", "walker", &a, &b).unwrap();
        assert_eq!(
            outcome,
            SegmentOutcome::Recorded {
                grid: GridKey::from_point(
                    &midpoint(&a.position(), &b.position()),
                    10.0 / METERS_PER_DEGREE
                ),
                edges: vec![EdgeId(0), EdgeId(1)],
            }
        );

        let e0 = agg.cell("park", &HeatKey::Edge(EdgeId(0))).unwrap().unwrap();
        let e1 = agg.cell("park", &HeatKey::Edge(EdgeId(1))).unwrap().unwrap();
        let total = haversine_distance(&a.position(), &b.position());
        assert!((e0.cumulative_distance_m + e1.cumulative_distance_m - total).abs() < 1e-9);
    }

    #[test]
    fn test_replay_doubles_counts() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(true)).unwrap();

        let path: Vec<TrajectoryPoint> = (0..20)
            .map(|i| pt(51.50201, -0.1275 + i as f64 * 0.0002, i * 1_000))
            .collect();

        for pair in path.windows(2) {
            agg.record_segment("park", "walker", &pair[0], &pair[1]).unwrap();
        }
        let first = agg.cells("park").unwrap();

        for pair in path.windows(2) {
            agg.record_segment("park", "walker", &pair[0], &pair[1]).unwrap();
        }
        let second = agg.cells("park").unwrap();

        assert_eq!(first.len(), second.len());
        for ((k1, c1), (k2, c2)) in first.iter().zip(second.iter()) {
            assert_eq!(k1, k2);
            assert_eq!(c2.count, c1.count * 2);
        }
    }

    #[test]
    fn test_generation_is_idempotent_and_covers_every_edge() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(true)).unwrap();
        agg.record_segment(
            "park",
            "walker",
            &pt(51.50201, -0.1270, 0),
            &pt(51.50201, -0.1269, 5_000),
        )
        .unwrap();

        let first = agg.generate_heat_segments("park").unwrap();
        let second = agg.generate_heat_segments("park").unwrap();
        assert_eq!(first, second);

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].key, HeatKey::Edge(EdgeId(0)));
        assert!((first[0].normalized_heat - 0.05).abs() < 1e-12);
        assert_eq!(first[1].normalized_heat, 0.0);
        assert_eq!(first[1].coordinates, [[-0.122, 51.502], [-0.122, 51.508]]);
    }

    #[test]
    fn test_fallback_renders_grid_cells() {
        let agg = aggregator(AggregatorConfig {
            count_ceiling: None,
            ..AggregatorConfig::default()
        });
        agg.register_venue(&square_park(false)).unwrap();

        let a = pt(51.5050, -0.1250, 0);
        let b = pt(51.5051, -0.1250, 1_000);
        let c = pt(51.5070, -0.1280, 0);
        let d = pt(51.5071, -0.1280, 1_000);
        agg.record_segment("park", "walker", &a, &b).unwrap();
        agg.record_segment("park", "walker", &a, &b).unwrap();
        agg.record_segment("park", "walker", &c, &d).unwrap();

        let segments = agg.generate_heat_segments("park").unwrap();
        assert_eq!(segments.len(), 2);
        let heats: Vec<f64> = segments.iter().map(|s| s.normalized_heat).collect();
        assert!(heats.contains(&1.0));
        assert!(heats.contains(&0.5));
        assert!(segments.iter().all(|s| matches!(s.key, HeatKey::Grid(_))));
    }

    #[test]
    fn test_reset_clears_state() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(false)).unwrap();
        agg.record_segment("park", "walker", &pt(51.505, -0.125, 0), &pt(51.5051, -0.125, 1_000))
            .unwrap();

        agg.reset_venue("park").unwrap();
        assert!(agg.cells("park").unwrap().is_empty());
        assert_eq!(agg.venue_stats("park").unwrap(), VenueStats::default());
    }

    #[test]
    fn test_cells_restored_from_store() {
        let store: Arc<MemoryHeatStore> = Arc::new(MemoryHeatStore::new());
        let expected = {
            let agg = SegmentHeatAggregator::with_store(
                AggregatorConfig::default(),
                Arc::new(IdentityTransform),
                store.clone(),
                PersistenceConfig::default(),
            )
            .unwrap();
            agg.register_venue(&square_park(true)).unwrap();
            agg.record_segment(
                "park",
                "walker",
                &pt(51.50201, -0.1270, 0),
                &pt(51.50201, -0.1269, 5_000),
            )
            .unwrap();
            agg.flush().unwrap();
            agg.cells("park").unwrap()
        };

        let agg = SegmentHeatAggregator::with_store(
            AggregatorConfig::default(),
            Arc::new(IdentityTransform),
            store,
            PersistenceConfig::default(),
        )
        .unwrap();
        agg.register_venue(&square_park(true)).unwrap();
        assert_eq!(agg.cells("park").unwrap(), expected);
    }

    #[test]
    fn test_replace_venue_drops_removed_edges() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&square_park(true)).unwrap();
        agg.record_segment(
            "park",
            "walker",
            &pt(51.5050, -0.12201, 0),
            &pt(51.5051, -0.12201, 5_000),
        )
        .unwrap();
        assert!(agg.cell("park", &HeatKey::Edge(EdgeId(1))).unwrap().is_some());

        let mut shorter = square_park(true);
        shorter.path_edges[0].vertices.truncate(2);
        agg.replace_venue(&shorter).unwrap();

        assert!(agg.cell("park", &HeatKey::Edge(EdgeId(1))).unwrap().is_none());
        assert_eq!(agg.venue_stats("park").unwrap().grid_cells, 1);
    }

    fn two_path_park(paths: &[f64]) -> VenueDefinition {
        let mut def = square_park(false);
        def.path_edges = paths
            .iter()
            .map(|&lat| {
                PathEdgeDefinition::segment(LonLat::new(-0.128, lat), LonLat::new(-0.122, lat))
            })
            .collect();
        def
    }

    fn walk_north_path(agg: &SegmentHeatAggregator) {
        for i in 0..10 {
            let lon = -0.127 + i as f64 * 0.0001;
            agg.record_segment(
                "park",
                "walker",
                &pt(51.508, lon, i * 1_000),
                &pt(51.508, lon + 0.0001, i * 1_000 + 500),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_replace_venue_keeps_heat_on_its_path() {
        let agg = aggregator(AggregatorConfig::default());
        agg.register_venue(&two_path_park(&[51.508])).unwrap();
        walk_north_path(&agg);

        // A new path listed ahead of the walked one shifts every edge id
        agg.replace_venue(&two_path_park(&[51.502, 51.508])).unwrap();

        let segments = agg.generate_heat_segments("park").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].coordinates[0][1], 51.502);
        assert_eq!(segments[0].normalized_heat, 0.0);
        assert_eq!(segments[1].coordinates[0][1], 51.508);
        assert_eq!(segments[1].normalized_heat, 0.5);
        assert!(agg.cell("park", &HeatKey::Edge(EdgeId(0))).unwrap().is_none());
    }

    #[test]
    fn test_restore_matches_stored_edges_by_geometry() {
        let store: Arc<MemoryHeatStore> = Arc::new(MemoryHeatStore::new());
        let with_store = || {
            SegmentHeatAggregator::with_store(
                AggregatorConfig::default(),
                Arc::new(IdentityTransform),
                store.clone(),
                PersistenceConfig::default(),
            )
            .unwrap()
        };

        {
            let agg = with_store();
            agg.register_venue(&two_path_park(&[51.508, 51.505])).unwrap();
            walk_north_path(&agg);
            agg.flush().unwrap();
        }

        // North path moved to id 1, middle path removed
        let agg = with_store();
        agg.register_venue(&two_path_park(&[51.502, 51.508])).unwrap();
        let north = agg.cell("park", &HeatKey::Edge(EdgeId(1))).unwrap().unwrap();
        assert_eq!(north.count, 10);
        assert!(agg.cell("park", &HeatKey::Edge(EdgeId(0))).unwrap().is_none());

        agg.flush().unwrap();
        let stored: Vec<HeatKey> = store.load_cells("park").unwrap().into_iter().map(|(k, _)| k).collect();
        assert!(stored.contains(&HeatKey::Edge(EdgeId(1))));
        assert!(!stored.contains(&HeatKey::Edge(EdgeId(0))));
    }
}
