//! # Heatline
//!
//! Accessibility heatlines for bounded venues (parks, zoos, attractions).
//!
//! Visitor GPS trajectories are corrected into the venue's rendering frame,
//! filtered to the venue boundary, aggregated onto the static path network and
//! normalized into discrete heat buckets. Segments that many visitors have
//! traversed are a proxy for "known passable".
//!
//! This library provides:
//! - Coordinate-frame correction (WGS-84 → GCJ-02)
//! - Ray-casting boundary filtering
//! - DBSCAN trajectory clustering
//! - Incremental per-venue heat aggregation with snap-to-network
//! - Heat bucket classification and the venue mask polygon
//! - Tracking sessions, write-behind persistence and background sync
//!
//! ## Features
//!
//! - **`persistence`** (default) - SQLite heat store and sync queue
//! - **`parallel`** - Parallel DBSCAN neighborhood computation with rayon
//! - **`http`** - HTTP uploader for completed sessions
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use heatline::{
//!     AggregatorConfig, IdentityTransform, LonLat, SegmentHeatAggregator, TrajectoryPoint,
//!     VenueDefinition,
//! };
//! use std::sync::Arc;
//!
//! let venue = VenueDefinition {
//!     id: "park".to_string(),
//!     boundary: vec![
//!         LonLat::new(-0.130, 51.500),
//!         LonLat::new(-0.120, 51.500),
//!         LonLat::new(-0.120, 51.510),
//!         LonLat::new(-0.130, 51.510),
//!     ],
//!     path_edges: vec![],
//! };
//!
//! let aggregator =
//!     SegmentHeatAggregator::new(AggregatorConfig::default(), Arc::new(IdentityTransform)).unwrap();
//! aggregator.register_venue(&venue).unwrap();
//!
//! let a = TrajectoryPoint::new(51.5050, -0.1250, 1_000);
//! let b = TrajectoryPoint::new(51.5051, -0.1250, 2_000);
//! aggregator.record_segment("park", "wheelchair", &a, &b).unwrap();
//!
//! let segments = aggregator.generate_heat_segments("park").unwrap();
//! assert_eq!(segments.len(), 1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{HeatlineError, OptionExt, Result};

// Configuration structs with documented defaults
pub mod config;
pub use config::{
    AggregatorConfig, ClusterConfig, HeatlineConfig, MaskConfig, MaskPadding, NeighborIndex,
    PersistenceConfig, SyncConfig, TransformKind,
};

// Geographic utilities (distance, bounds, projection helpers)
pub mod geo_utils;

// Coordinate-frame correction
pub mod transform;
pub use transform::{transform, CoordinateTransform, Gcj02Transform, IdentityTransform};

// Point-in-polygon filtering
pub mod boundary;
pub use boundary::inside;

// Venue geometry loading and validation
pub mod venue;
pub use venue::{EdgeId, LonLat, PathEdge, PathEdgeDefinition, Venue, VenueBoundary, VenueDefinition};

// Nearest-edge lookup on the static path network
pub mod snapping;
pub use snapping::{PathNetwork, SnapMatch};

// DBSCAN trajectory clustering
pub mod clustering;
pub use clustering::{
    dbscan, dbscan_with_index, Cluster, ClusterResult, LinearScan, NeighborSearch, RTreeSearch,
    TrajectoryClusterer,
};

// Heat bucket classification
pub mod classify;
pub use classify::{classify, clamp_heat, normalized_heat, HeatBucket, HeatSegment, BUCKET_COUNT};

// Per-venue heat aggregation
pub mod aggregator;
pub use aggregator::{
    GridKey, HeatCell, HeatCellRecord, HeatKey, SegmentHeatAggregator, SegmentOutcome, VenueStats,
};

// Mask polygon for venue overlay
pub mod mask;
pub use mask::{MaskPolygon, MaskPolygonBuilder};

// Durable storage contract and in-memory store
pub mod store;
pub use store::{HeatStore, MemoryHeatStore};

// Background write-behind flusher
pub mod writer;
pub use writer::WriteBehind;

// SQLite persistence (heat cells, sync queue)
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::{QueuedSession, SqliteHeatStore, SyncQueue};

// Tracking sessions fed by a location source
pub mod session;
pub use session::{
    CompletedSession, LocationCallback, LocationEvent, LocationSource, LocationSubscription,
    SessionStats, TrackingSession,
};

// Background upload of completed sessions
#[cfg(feature = "http")]
pub mod sync;
#[cfg(feature = "http")]
pub use sync::{upload_due_sync, SessionUploader, SyncReport};

// Tracking context owning the aggregator, mask builder and sync queue
pub mod engine;
pub use engine::{EngineStats, HeatlineEngine};

// Algorithm toolbox - standalone access to the pure functions
pub mod algorithms;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use heatline::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// `[lon, lat]` pair, the order used by the rendering layer.
    pub fn lon_lat(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

/// Bounding box for a set of points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Closed-interval containment test.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }

    /// Grow the box by `dlat` / `dlng` degrees on every side.
    pub fn expanded(&self, dlat: f64, dlng: f64) -> Self {
        Self {
            min_lat: self.min_lat - dlat,
            max_lat: self.max_lat + dlat,
            min_lng: self.min_lng - dlng,
            max_lng: self.max_lng + dlng,
        }
    }
}

/// Coordinate frame a point is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateFrame {
    /// Raw satellite frame as delivered by the device
    #[default]
    Satellite,
    /// Corrected rendering frame; all distance and containment math happens here
    Local,
}

/// A single trajectory sample.
///
/// Produced by device sampling and consumed once per pipeline pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Horizontal accuracy radius in meters (0.0 when unknown)
    #[serde(default)]
    pub accuracy: f64,
    /// Device-reported speed in m/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Heading in degrees clockwise from north
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default)]
    pub frame: CoordinateFrame,
}

impl TrajectoryPoint {
    /// Create a satellite-frame sample with unknown accuracy, speed and heading.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            accuracy: 0.0,
            speed: None,
            heading: None,
            frame: CoordinateFrame::Satellite,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Mark the coordinates as already corrected.
    pub fn in_local_frame(mut self) -> Self {
        self.frame = CoordinateFrame::Local;
        self
    }

    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Check if the coordinates and timestamp are usable.
    pub fn is_valid(&self) -> bool {
        self.position().is_valid() && self.accuracy.is_finite() && self.accuracy >= 0.0
    }
}

/// Raw payload delivered by the device location callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl From<LocationUpdate> for TrajectoryPoint {
    fn from(update: LocationUpdate) -> Self {
        // Devices report unknown speed/heading as negative values
        Self {
            latitude: update.latitude,
            longitude: update.longitude,
            timestamp: update.timestamp,
            accuracy: update.accuracy,
            speed: update.speed.filter(|s| s.is_finite() && *s >= 0.0),
            heading: update.heading.filter(|h| h.is_finite() && *h >= 0.0),
            frame: CoordinateFrame::Satellite,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_from_points() {
        let points = vec![
            GpsPoint::new(51.50, -0.13),
            GpsPoint::new(51.51, -0.12),
            GpsPoint::new(51.505, -0.125),
        ];
        let bounds = Bounds::from_points(&points).unwrap();
        assert_eq!(bounds.min_lat, 51.50);
        assert_eq!(bounds.max_lng, -0.12);
        assert!(bounds.contains(&GpsPoint::new(51.505, -0.125)));
        assert!(!bounds.contains(&GpsPoint::new(51.52, -0.125)));
        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn test_location_update_conversion() {
        let update = LocationUpdate {
            latitude: 51.5,
            longitude: -0.12,
            accuracy: 8.0,
            speed: Some(-1.0),
            heading: Some(90.0),
            timestamp: 1_700_000_000_000,
        };
        let point = TrajectoryPoint::from(update);
        assert_eq!(point.speed, None);
        assert_eq!(point.heading, Some(90.0));
        assert_eq!(point.frame, CoordinateFrame::Satellite);
        assert!(point.is_valid());
    }
}
