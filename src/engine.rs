//! # Heatline Engine
//!
//! Tracking context owning everything one app needs: the aggregator, the
//! mask builder, the clusterer and (with persistence) the sync queue. Create
//! one per process or per test; nothing is global.
//!
//! The `*_json` methods return strings ready for the rendering layer and
//! fall back to an empty value, logging the cause, when the query fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::aggregator::SegmentHeatAggregator;
use crate::classify::HeatSegment;
use crate::clustering::{ClusterResult, TrajectoryClusterer};
use crate::config::HeatlineConfig;
use crate::error::Result;
use crate::mask::{MaskPolygon, MaskPolygonBuilder};
use crate::session::{CompletedSession, LocationSource, TrackingSession};
use crate::store::HeatStore;
use crate::venue::{Venue, VenueDefinition};
use crate::TrajectoryPoint;

#[cfg(feature = "persistence")]
use crate::persistence::{SqliteHeatStore, SyncQueue};
#[cfg(feature = "persistence")]
use crate::session::now_millis;

#[cfg(feature = "http")]
use crate::sync::{SessionUploader, SyncReport};

/// Engine statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub venue_count: usize,
    pub grid_cells: usize,
    pub edge_cells: usize,
    pub recorded_segments: u64,
    pub sessions_completed: u64,
    /// Sessions waiting for upload (0 without a sync queue)
    pub queued_sessions: usize,
    pub failed_writes: u64,
    pub masks_built: u64,
}

pub struct HeatlineEngine {
    config: HeatlineConfig,
    aggregator: Arc<SegmentHeatAggregator>,
    masks: MaskPolygonBuilder,
    clusterer: TrajectoryClusterer,
    #[cfg(feature = "persistence")]
    sync_queue: Option<SyncQueue>,
    sessions_completed: AtomicU64,
}

impl HeatlineEngine {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Engine without durable storage.
    pub fn in_memory(config: HeatlineConfig) -> Result<Self> {
        config.validate()?;
        let aggregator =
            SegmentHeatAggregator::new(config.aggregator.clone(), config.transform.build())?;
        Self::assemble(config, aggregator)
    }

    /// Engine persisting heat to a caller-supplied store.
    pub fn with_store(config: HeatlineConfig, store: Arc<dyn HeatStore>) -> Result<Self> {
        config.validate()?;
        let aggregator = SegmentHeatAggregator::with_store(
            config.aggregator.clone(),
            config.transform.build(),
            store,
            config.persistence.clone(),
        )?;
        Self::assemble(config, aggregator)
    }

    /// Engine backed by a SQLite file holding both heat cells and the sync queue.
    #[cfg(feature = "persistence")]
    pub fn open(config: HeatlineConfig, db_path: &str) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteHeatStore::new(db_path)?);
        let queue = SyncQueue::new(db_path)?;
        let aggregator = SegmentHeatAggregator::with_store(
            config.aggregator.clone(),
            config.transform.build(),
            store,
            config.persistence.clone(),
        )?;
        let mut engine = Self::assemble(config, aggregator)?;
        engine.sync_queue = Some(queue);
        log::info!("[Engine] Opened {}", db_path);
        Ok(engine)
    }

    fn assemble(config: HeatlineConfig, aggregator: SegmentHeatAggregator) -> Result<Self> {
        let masks = MaskPolygonBuilder::new(config.mask.clone())?;
        let clusterer = TrajectoryClusterer::new(config.cluster.clone())?;
        Ok(Self {
            config,
            aggregator: Arc::new(aggregator),
            masks,
            clusterer,
            #[cfg(feature = "persistence")]
            sync_queue: None,
            sessions_completed: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &HeatlineConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<SegmentHeatAggregator> {
        &self.aggregator
    }

    #[cfg(feature = "persistence")]
    pub fn sync_queue(&self) -> Option<&SyncQueue> {
        self.sync_queue.as_ref()
    }

    // ========================================================================
    // Venues
    // ========================================================================

    pub fn register_venue(&self, definition: &VenueDefinition) -> Result<Arc<Venue>> {
        self.aggregator.register_venue(definition)
    }

    /// Register a venue from its JSON definition.
    pub fn register_venue_json(&self, json: &str) -> Result<Arc<Venue>> {
        let definition = VenueDefinition::from_json_str(json)?;
        self.register_venue(&definition)
    }

    /// Update a venue's geometry. The mask is rebuilt on next request.
    pub fn replace_venue(&self, definition: &VenueDefinition) -> Result<Arc<Venue>> {
        self.aggregator.replace_venue(definition)
    }

    pub fn venue_ids(&self) -> Result<Vec<String>> {
        self.aggregator.venue_ids()
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn start_session(
        &self,
        source: &dyn LocationSource,
        venue_id: &str,
        user_id: &str,
        profile: &str,
    ) -> Result<TrackingSession> {
        TrackingSession::start(source, Arc::clone(&self.aggregator), venue_id, user_id, profile)
    }

    /// End a session and queue it for upload when a sync queue exists.
    ///
    /// A failure to queue is logged; the heat it produced is already recorded.
    pub fn end_session(&self, session: TrackingSession) -> Result<CompletedSession> {
        let completed = session.end()?;
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.queue_for_sync(&completed);
        Ok(completed)
    }

    #[cfg(feature = "persistence")]
    fn queue_for_sync(&self, completed: &CompletedSession) {
        let Some(queue) = &self.sync_queue else {
            return;
        };
        if let Err(e) = queue.enqueue(completed, now_millis()) {
            log::error!(
                "[Engine] Failed to queue session {} for sync: {}",
                completed.session_id, e
            );
        }
    }

    #[cfg(not(feature = "persistence"))]
    fn queue_for_sync(&self, _completed: &CompletedSession) {}

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn heat_segments(&self, venue_id: &str) -> Result<Vec<HeatSegment>> {
        self.aggregator.generate_heat_segments(venue_id)
    }

    /// Heat segments as a JSON array (`[]` on error).
    pub fn heat_segments_json(&self, venue_id: &str) -> String {
        match self.heat_segments(venue_id) {
            Ok(segments) => serde_json::to_string(&segments).unwrap_or_else(|_| "[]".to_string()),
            Err(e) => {
                warn!("[Engine] No heat segments for {}: {}", venue_id, e);
                "[]".to_string()
            }
        }
    }

    pub fn mask(&self, venue_id: &str) -> Result<Arc<MaskPolygon>> {
        let venue = self.aggregator.venue(venue_id)?;
        self.masks.mask_for(venue_id, &venue.boundary)
    }

    /// Mask polygon as a JSON object (`{}` on error).
    pub fn mask_json(&self, venue_id: &str) -> String {
        match self.mask(venue_id) {
            Ok(mask) => serde_json::to_string(mask.as_ref()).unwrap_or_else(|_| "{}".to_string()),
            Err(e) => {
                warn!("[Engine] No mask for {}: {}", venue_id, e);
                "{}".to_string()
            }
        }
    }

    /// Correct, boundary-filter and cluster a batch of raw points.
    ///
    /// Assignments align with `points`; points outside the venue are
    /// unassigned and counted as discarded.
    pub fn cluster_points(&self, venue_id: &str, points: &[TrajectoryPoint]) -> Result<ClusterResult> {
        let venue = self.aggregator.venue(venue_id)?;
        let transformer = self.aggregator.transformer();

        let mut kept_index = Vec::with_capacity(points.len());
        let mut kept = Vec::with_capacity(points.len());
        for (i, point) in points.iter().enumerate() {
            let local = transformer.to_local(point);
            if venue.boundary.contains(&local.position()) {
                kept_index.push(i);
                kept.push(local);
            }
        }
        let outside = points.len() - kept.len();

        let mut result = self.clusterer.cluster(&kept)?;
        let mut assignments = vec![None; points.len()];
        for (k, assignment) in result.assignments.iter().enumerate() {
            assignments[kept_index[k]] = *assignment;
        }
        result.assignments = assignments;
        result.discarded += outside;
        Ok(result)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop all heat for a venue and its cached mask.
    pub fn reset_venue(&self, venue_id: &str) -> Result<()> {
        self.aggregator.reset_venue(venue_id)?;
        self.masks.invalidate(venue_id);
        Ok(())
    }

    /// Block until recorded heat is written to storage.
    pub fn flush(&self) -> Result<()> {
        self.aggregator.flush()
    }

    /// Upload due sessions from the sync queue.
    #[cfg(feature = "http")]
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        let Some(queue) = &self.sync_queue else {
            return Ok(SyncReport::default());
        };
        let uploader = SessionUploader::new(self.config.sync.clone())?;
        uploader.upload_due(queue).await
    }

    /// Blocking variant of [`sync_pending`](Self::sync_pending).
    #[cfg(feature = "http")]
    pub fn sync_pending_blocking(&self) -> Result<SyncReport> {
        match &self.sync_queue {
            Some(queue) => crate::sync::upload_due_sync(self.config.sync.clone(), queue),
            None => Ok(SyncReport::default()),
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<EngineStats> {
        let mut stats = EngineStats {
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            queued_sessions: self.queued_sessions()?,
            failed_writes: self.aggregator.failed_writes(),
            masks_built: self.masks.build_count(),
            ..EngineStats::default()
        };

        for venue_id in self.aggregator.venue_ids()? {
            let venue = self.aggregator.venue_stats(&venue_id)?;
            stats.venue_count += 1;
            stats.grid_cells += venue.grid_cells;
            stats.edge_cells += venue.edge_cells;
            stats.recorded_segments += venue.recorded;
        }

        Ok(stats)
    }

    #[cfg(feature = "persistence")]
    fn queued_sessions(&self) -> Result<usize> {
        match &self.sync_queue {
            Some(queue) => queue.len(),
            None => Ok(0),
        }
    }

    #[cfg(not(feature = "persistence"))]
    fn queued_sessions(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformKind;
    use crate::venue::{LonLat, PathEdgeDefinition};

    fn config() -> HeatlineConfig {
        HeatlineConfig {
            transform: TransformKind::Identity,
            ..HeatlineConfig::default()
        }
    }

    const PARK_JSON: &str = r#"{
        "id": "park",
        "boundary": [
            {"lon": -0.130, "lat": 51.500},
            {"lon": -0.120, "lat": 51.500},
            {"lon": -0.120, "lat": 51.510},
            {"lon": -0.130, "lat": 51.510}
        ],
        "path_edges": [
            {"vertices": [{"lon": -0.128, "lat": 51.502}, {"lon": -0.122, "lat": 51.502}]}
        ]
    }"#;

    #[test]
    fn test_register_and_query_json() {
        let engine = HeatlineEngine::in_memory(config()).unwrap();
        engine.register_venue_json(PARK_JSON).unwrap();

        let segments: serde_json::Value =
            serde_json::from_str(&engine.heat_segments_json("park")).unwrap();
        assert_eq!(segments.as_array().unwrap().len(), 1);
        assert_eq!(segments[0]["normalizedHeat"], 0.0);

        let mask: serde_json::Value = serde_json::from_str(&engine.mask_json("park")).unwrap();
        assert_eq!(mask["innerRing"].as_array().unwrap().len(), 5);

        assert_eq!(engine.heat_segments_json("zoo"), "[]");
        assert_eq!(engine.mask_json("zoo"), "{}");
    }

    #[test]
    fn test_cluster_points_filters_to_venue() {
        let engine = HeatlineEngine::in_memory(config()).unwrap();
        engine.register_venue_json(PARK_JSON).unwrap();

        let mut points: Vec<TrajectoryPoint> = (0..5)
            .map(|i| TrajectoryPoint::new(51.505 + i as f64 * 0.00001, -0.125, i))
            .collect();
        // Dense but outside the park
        points.splice(
            0..0,
            (0..5).map(|i| TrajectoryPoint::new(51.520 + i as f64 * 0.00001, -0.125, i)),
        );

        let result = engine.cluster_points("park", &points).unwrap();
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.discarded, 5);
        assert_eq!(result.assignments.len(), 10);
        assert!(result.assignments[..5].iter().all(|a| a.is_none()));
        assert!(result.assignments[5..].iter().all(|a| *a == Some(0)));
    }

    #[test]
    fn test_mask_rebuilt_after_geometry_change() {
        let engine = HeatlineEngine::in_memory(config()).unwrap();
        let mut def = VenueDefinition::from_json_str(PARK_JSON).unwrap();
        engine.register_venue(&def).unwrap();

        let first = engine.mask("park").unwrap();
        engine.mask("park").unwrap();
        assert_eq!(engine.stats().unwrap().masks_built, 1);

        def.boundary[2] = LonLat::new(-0.119, 51.511);
        def.path_edges.push(PathEdgeDefinition::segment(
            LonLat::new(-0.122, 51.502),
            LonLat::new(-0.122, 51.508),
        ));
        engine.replace_venue(&def).unwrap();

        let second = engine.mask("park").unwrap();
        assert_ne!(first.inner_ring, second.inner_ring);
        assert_eq!(engine.stats().unwrap().masks_built, 2);
        assert_eq!(engine.heat_segments("park").unwrap().len(), 2);
    }

    #[test]
    fn test_stats_aggregate_venues() {
        let engine = HeatlineEngine::in_memory(config()).unwrap();
        engine.register_venue_json(PARK_JSON).unwrap();
        engine
            .aggregator()
            .record_segment(
                "park",
                "walker",
                &TrajectoryPoint::new(51.50201, -0.1270, 0),
                &TrajectoryPoint::new(51.50201, -0.1269, 5_000),
            )
            .unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.venue_count, 1);
        assert_eq!(stats.recorded_segments, 1);
        assert_eq!(stats.grid_cells, 1);
        assert_eq!(stats.edge_cells, 1);
        assert_eq!(stats.queued_sessions, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.mask.cache_capacity = 0;
        assert!(HeatlineEngine::in_memory(bad).is_err());
    }
}
