//! # Algorithm Toolbox
//!
//! Direct access to the pure heatline algorithms, for callers that want a
//! single step without the aggregator or the engine.
//!
//! ## Core Algorithms
//!
//! - **Coordinate Correction**: WGS-84 → GCJ-02
//! - **Boundary Filtering**: ray-casting point-in-polygon
//! - **Trajectory Clustering**: DBSCAN with linear or R-tree neighbor search
//! - **Heat Classification**: normalized heat → color and width bucket
//!
//! ## Geographic Utilities
//!
//! - **Haversine Distance**: great-circle distance between GPS points
//! - **Point-to-Segment Distance**: used for snapping samples to path edges
//! - **Bounds Computation**: bounding box for a set of points
//!
//! # Example
//!
//! ```rust
//! use heatline::algorithms::{classify, haversine_distance, inside, GpsPoint};
//!
//! let square = vec![
//!     GpsPoint::new(0.0, 0.0),
//!     GpsPoint::new(0.0, 1.0),
//!     GpsPoint::new(1.0, 1.0),
//!     GpsPoint::new(1.0, 0.0),
//! ];
//! assert!(inside(&GpsPoint::new(0.5, 0.5), &square));
//!
//! let d = haversine_distance(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(0.0, 1.0));
//! assert!((d - 111_195.0).abs() < 100.0);
//!
//! assert_eq!(classify(1.0).index, 5);
//! ```

// =============================================================================
// Core Types (re-exported from lib)
// =============================================================================

pub use crate::{Bounds, CoordinateFrame, GpsPoint, TrajectoryPoint};

// =============================================================================
// Geographic Utilities
// =============================================================================

pub use crate::geo_utils::{
    compute_bounds, compute_center, haversine_distance, meters_to_degrees, midpoint,
    point_to_segment_distance, polyline_length,
};

// =============================================================================
// Coordinate Correction
// =============================================================================

/// Correct a WGS-84 `(lon, lat)` into GCJ-02.
///
/// Identity outside the distorted region. Deterministic and forward only.
pub use crate::transform::transform;

/// True when a coordinate lies outside the region GCJ-02 applies to.
pub use crate::transform::out_of_region;

// =============================================================================
// Boundary Filtering
// =============================================================================

/// Ray-casting point-in-polygon test. Points on an edge count as outside.
pub use crate::boundary::inside;

// =============================================================================
// Trajectory Clustering
// =============================================================================

/// DBSCAN over a point batch with a linear neighbor scan.
///
/// Output does not depend on input order: points are processed in a
/// canonical order and cluster ids follow it.
pub use crate::clustering::dbscan;

/// DBSCAN with an explicit neighbor search strategy.
pub use crate::clustering::dbscan_with_index;

pub use crate::clustering::{Cluster, ClusterResult, LinearScan, NeighborSearch, RTreeSearch};
pub use crate::config::NeighborIndex;

// =============================================================================
// Heat Classification
// =============================================================================

/// Map a normalized heat value in `[0, 1]` to its display bucket.
pub use crate::classify::classify;

pub use crate::classify::{clamp_heat, normalized_heat, HeatBucket, BUCKET_COUNT};

/// Grid cell containing a point, for cells of `cell_meters` edge length.
pub fn grid_cell(point: &GpsPoint, cell_meters: f64) -> crate::aggregator::GridKey {
    crate::aggregator::GridKey::from_point(
        point,
        cell_meters / crate::geo_utils::METERS_PER_DEGREE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_cell_matches_aggregator_sizing() {
        let a = grid_cell(&GpsPoint::new(51.50003, -0.12503), 10.0);
        let b = grid_cell(&GpsPoint::new(51.50004, -0.12504), 10.0);
        assert_eq!(a, b);

        let far = grid_cell(&GpsPoint::new(51.50103, -0.12503), 10.0);
        assert_ne!(a, far);
    }
}
