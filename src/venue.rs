//! Venue geometry: boundary polygon and static path network.
//!
//! Geometry arrives as ordered `{lon, lat}` vertex lists in the satellite
//! frame. Loading corrects every vertex, validates structure and fails fast
//! with [`HeatlineError::MalformedGeometry`] on anything unusable. Path edges
//! with an endpoint outside the boundary are dropped here, so nothing
//! downstream ever aggregates onto them.

use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::boundary::{inside, open_ring};
use crate::error::{HeatlineError, Result};
use crate::transform::CoordinateTransform;
use crate::{Bounds, GpsPoint};

/// A `{lon, lat}` vertex as supplied by venue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    fn to_point(self) -> GpsPoint {
        GpsPoint::new(self.lat, self.lon)
    }
}

/// One walkable path, given as an ordered polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEdgeDefinition {
    pub vertices: Vec<LonLat>,
}

impl PathEdgeDefinition {
    pub fn segment(start: LonLat, end: LonLat) -> Self {
        Self {
            vertices: vec![start, end],
        }
    }
}

/// Static venue geometry in the satellite frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueDefinition {
    pub id: String,
    pub boundary: Vec<LonLat>,
    #[serde(default)]
    pub path_edges: Vec<PathEdgeDefinition>,
}

impl VenueDefinition {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Identifier of a path edge, unique within its venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub u32);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A straight walkable segment of the path network, in the corrected frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathEdge {
    pub id: EdgeId,
    pub start: GpsPoint,
    pub end: GpsPoint,
}

/// Closed venue polygon in the corrected frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueBoundary {
    /// Closed ring: first vertex repeated at the end
    vertices: Vec<GpsPoint>,
    bounds: Bounds,
}

impl VenueBoundary {
    /// Validate and close a boundary ring.
    ///
    /// Requires finite coordinates, at least 3 distinct vertices and a
    /// non-zero enclosed area.
    pub fn new(venue_id: &str, vertices: Vec<GpsPoint>) -> Result<Self> {
        if let Some(bad) = vertices.iter().find(|p| !p.is_valid()) {
            return Err(HeatlineError::malformed(
                venue_id,
                format!("boundary vertex {:?} is not a valid coordinate", bad),
            ));
        }

        let mut ring: Vec<GpsPoint> = Vec::with_capacity(vertices.len() + 1);
        for v in vertices {
            if ring.last() != Some(&v) {
                ring.push(v);
            }
        }
        let open_len = open_ring(&ring).len();
        ring.truncate(open_len);

        if ring.len() < 3 {
            return Err(HeatlineError::malformed(
                venue_id,
                format!("boundary has {} distinct vertices, minimum 3 required", ring.len()),
            ));
        }
        if signed_area(&ring) == 0.0 {
            return Err(HeatlineError::malformed(venue_id, "boundary encloses no area"));
        }

        let bounds = Bounds::from_points(&ring).ok_or_else(|| {
            HeatlineError::malformed(venue_id, "boundary has no vertices")
        })?;
        ring.push(ring[0]);

        Ok(Self {
            vertices: ring,
            bounds,
        })
    }

    /// Closed ring (first vertex repeated at the end).
    pub fn vertices(&self) -> &[GpsPoint] {
        &self.vertices
    }

    /// Ring without the closing vertex.
    pub fn open_vertices(&self) -> &[GpsPoint] {
        &self.vertices[..self.vertices.len() - 1]
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Strict containment; on-boundary points are outside.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        self.bounds.contains(point) && inside(point, &self.vertices)
    }

    /// Positive for counter-clockwise rings (x = lon, y = lat).
    pub fn signed_area(&self) -> f64 {
        signed_area(self.open_vertices())
    }
}

/// Shoelace signed area in square degrees.
pub(crate) fn signed_area(ring: &[GpsPoint]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    for i in 0..n {
        let a = &ring[i];
        let b = &ring[(i + 1) % n];
        twice_area += a.longitude * b.latitude - b.longitude * a.latitude;
    }
    twice_area / 2.0
}

/// A registered venue: corrected boundary plus the in-bounds path edges.
#[derive(Debug, Clone)]
pub struct Venue {
    pub id: String,
    pub boundary: VenueBoundary,
    pub edges: Vec<PathEdge>,
    /// Edges discarded because an endpoint failed the boundary filter
    pub dropped_edges: usize,
}

impl Venue {
    /// Correct, validate and filter a venue definition.
    pub fn from_definition(
        definition: &VenueDefinition,
        transformer: &dyn CoordinateTransform,
    ) -> Result<Self> {
        let id = definition.id.as_str();
        if id.is_empty() {
            return Err(HeatlineError::malformed(id, "venue id is empty"));
        }

        let corrected: Vec<GpsPoint> = definition
            .boundary
            .iter()
            .map(|v| transformer.transform_point(&v.to_point()))
            .collect();
        let boundary = VenueBoundary::new(id, corrected)?;

        let mut edges = Vec::new();
        let mut dropped_edges = 0;
        let mut next_id = 0u32;

        for (path_idx, path) in definition.path_edges.iter().enumerate() {
            if path.vertices.len() < 2 {
                return Err(HeatlineError::malformed(
                    id,
                    format!(
                        "path {} has {} vertices, minimum 2 required",
                        path_idx,
                        path.vertices.len()
                    ),
                ));
            }

            for pair in path.vertices.windows(2) {
                let start = transformer.transform_point(&pair[0].to_point());
                let end = transformer.transform_point(&pair[1].to_point());

                if !start.is_valid() || !end.is_valid() {
                    return Err(HeatlineError::malformed(
                        id,
                        format!("path {} has an invalid coordinate", path_idx),
                    ));
                }
                if start == end {
                    return Err(HeatlineError::malformed(
                        id,
                        format!("path {} has a zero-length segment", path_idx),
                    ));
                }

                let edge_id = EdgeId(next_id);
                next_id += 1;

                if boundary.contains(&start) && boundary.contains(&end) {
                    edges.push(PathEdge {
                        id: edge_id,
                        start,
                        end,
                    });
                } else {
                    warn!(
                        "[Venue] {}: dropping edge {} with an endpoint outside the boundary",
                        id, edge_id
                    );
                    dropped_edges += 1;
                }
            }
        }

        info!(
            "[Venue] Loaded {} ({} boundary vertices, {} edges, {} dropped)",
            id,
            boundary.open_vertices().len(),
            edges.len(),
            dropped_edges
        );

        Ok(Self {
            id: id.to_string(),
            boundary,
            edges,
            dropped_edges,
        })
    }

    pub fn has_path_network(&self) -> bool {
        !self.edges.is_empty()
    }
}
