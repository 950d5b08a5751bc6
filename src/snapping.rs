//! Snap-to-network: nearest path edge lookup.
//!
//! Edges are indexed by their bounding boxes in an R-tree. A query expands
//! the point by the snap radius, collects intersecting candidates and keeps
//! the one with the smallest point-to-segment distance.

use rstar::{RTree, RTreeObject, AABB};

use crate::geo_utils::{meters_to_degrees, point_to_segment_distance};
use crate::venue::{EdgeId, PathEdge};
use crate::GpsPoint;

/// Bounds wrapper for R-tree spatial indexing.
#[derive(Debug, Clone)]
struct EdgeEnvelope {
    index: usize,
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

impl RTreeObject for EdgeEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// Result of snapping a point onto the network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapMatch {
    pub edge_id: EdgeId,
    /// Point-to-edge distance in meters
    pub distance_m: f64,
}

/// R-tree indexed path network of one venue.
#[derive(Debug)]
pub struct PathNetwork {
    edges: Vec<PathEdge>,
    index: RTree<EdgeEnvelope>,
}

impl PathNetwork {
    pub fn new(edges: Vec<PathEdge>) -> Self {
        let envelopes: Vec<EdgeEnvelope> = edges
            .iter()
            .enumerate()
            .map(|(index, e)| EdgeEnvelope {
                index,
                min_lat: e.start.latitude.min(e.end.latitude),
                max_lat: e.start.latitude.max(e.end.latitude),
                min_lng: e.start.longitude.min(e.end.longitude),
                max_lng: e.start.longitude.max(e.end.longitude),
            })
            .collect();

        Self {
            edges,
            index: RTree::bulk_load(envelopes),
        }
    }

    pub fn edges(&self) -> &[PathEdge] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edge(&self, id: EdgeId) -> Option<&PathEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Nearest edge within `max_distance_m`. Ties go to the lower edge id.
    pub fn nearest_edge(&self, point: &GpsPoint, max_distance_m: f64) -> Option<SnapMatch> {
        if !point.is_valid() {
            return None;
        }

        let (dlat, dlng) = meters_to_degrees(max_distance_m, point.latitude);
        let search = AABB::from_corners(
            [point.longitude - dlng, point.latitude - dlat],
            [point.longitude + dlng, point.latitude + dlat],
        );

        let mut best: Option<SnapMatch> = None;
        for candidate in self.index.locate_in_envelope_intersecting(&search) {
            let edge = &self.edges[candidate.index];
            let distance_m = point_to_segment_distance(point, &edge.start, &edge.end);
            if distance_m > max_distance_m {
                continue;
            }

            let better = match best {
                None => true,
                Some(b) => {
                    distance_m < b.distance_m || (distance_m == b.distance_m && edge.id < b.edge_id)
                }
            };
            if better {
                best = Some(SnapMatch {
                    edge_id: edge.id,
                    distance_m,
                });
            }
        }
        best
    }
}
