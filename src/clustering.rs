//! DBSCAN clustering of trajectory samples.
//!
//! Distance is Euclidean in corrected `(lon, lat)` degrees, which is a
//! venue-scale stand-in for geodesic distance. Points are processed in a
//! canonical order (sorted by lon, lat, timestamp) so cluster membership and
//! numbering do not depend on the order the caller supplied them in.
//!
//! Expansion uses an explicit work queue; dense clusters never recurse.

use std::cmp::Ordering;
use std::collections::VecDeque;

use log::debug;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::Serialize;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::{ClusterConfig, NeighborIndex};
use crate::error::{HeatlineError, Result};
use crate::geo_utils::compute_center;
use crate::{Bounds, GpsPoint, TrajectoryPoint};

/// A set of mutually density-reachable points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    /// Cluster number, assigned in canonical processing order
    pub id: usize,
    /// Members in canonical order
    pub points: Vec<TrajectoryPoint>,
    pub centroid: GpsPoint,
    pub bounds: Bounds,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Output of one clustering pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterResult {
    pub clusters: Vec<Cluster>,
    /// Points that belong to no cluster, in canonical order
    pub noise: Vec<TrajectoryPoint>,
    /// Cluster id per input point, aligned with the caller's order
    pub assignments: Vec<Option<usize>>,
    /// Non-finite points skipped before clustering
    pub discarded: usize,
}

/// Radius query over a fixed point set.
pub trait NeighborSearch: Sync {
    /// Indices within `eps` of point `idx` (inclusive, itself included), ascending.
    fn neighbors(&self, idx: usize, eps: f64) -> Vec<usize>;
}

/// Naive O(n) scan per query.
pub struct LinearScan<'a> {
    coords: &'a [[f64; 2]],
}

impl<'a> LinearScan<'a> {
    pub fn new(coords: &'a [[f64; 2]]) -> Self {
        Self { coords }
    }
}

impl NeighborSearch for LinearScan<'_> {
    fn neighbors(&self, idx: usize, eps: f64) -> Vec<usize> {
        let p = self.coords[idx];
        let eps_sq = eps * eps;
        self.coords
            .iter()
            .enumerate()
            .filter(|(_, q)| distance_sq(&p, q) <= eps_sq)
            .map(|(i, _)| i)
            .collect()
    }
}

/// R-tree backed radius queries.
pub struct RTreeSearch {
    coords: Vec<[f64; 2]>,
    tree: RTree<GeomWithData<[f64; 2], usize>>,
}

impl RTreeSearch {
    pub fn new(coords: &[[f64; 2]]) -> Self {
        let entries: Vec<GeomWithData<[f64; 2], usize>> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| GeomWithData::new(*c, i))
            .collect();
        Self {
            coords: coords.to_vec(),
            tree: RTree::bulk_load(entries),
        }
    }
}

impl NeighborSearch for RTreeSearch {
    fn neighbors(&self, idx: usize, eps: f64) -> Vec<usize> {
        let p = self.coords[idx];
        let eps_sq = eps * eps;
        let mut found: Vec<usize> = self
            .tree
            .locate_within_distance(p, eps_sq)
            .map(|entry| entry.data)
            .filter(|&i| distance_sq(&p, &self.coords[i]) <= eps_sq)
            .collect();
        found.sort_unstable();
        found
    }
}

fn distance_sq(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

fn canonical_cmp(a: &TrajectoryPoint, b: &TrajectoryPoint) -> Ordering {
    a.longitude
        .total_cmp(&b.longitude)
        .then(a.latitude.total_cmp(&b.latitude))
        .then(a.timestamp.cmp(&b.timestamp))
        .then(a.accuracy.total_cmp(&b.accuracy))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Label {
    Unvisited,
    Noise,
    Member(usize),
}

/// Run DBSCAN over `points` with a linear-scan neighbor search.
///
/// Points should already be in the corrected frame and boundary-filtered.
///
/// # Example
/// ```
/// use heatline::{dbscan, TrajectoryPoint};
///
/// let points: Vec<TrajectoryPoint> = (0..4)
///     .map(|i| TrajectoryPoint::new(51.5 + i as f64 * 0.00001, -0.12, i))
///     .chain(std::iter::once(TrajectoryPoint::new(51.6, -0.12, 9)))
///     .collect();
///
/// let result = dbscan(&points, 0.0001, 3);
/// assert_eq!(result.clusters.len(), 1);
/// assert_eq!(result.noise.len(), 1);
/// ```
pub fn dbscan(points: &[TrajectoryPoint], eps: f64, min_points: usize) -> ClusterResult {
    dbscan_with_index(points, eps, min_points, NeighborIndex::Linear)
}

/// Run DBSCAN with the chosen neighbor search strategy.
pub fn dbscan_with_index(
    points: &[TrajectoryPoint],
    eps: f64,
    min_points: usize,
    index: NeighborIndex,
) -> ClusterResult {
    // Canonical order over valid points; `order[k]` is the caller's index
    let mut order: Vec<usize> = (0..points.len())
        .filter(|&i| points[i].position().is_valid())
        .collect();
    let discarded = points.len() - order.len();
    order.sort_by(|&a, &b| canonical_cmp(&points[a], &points[b]).then(a.cmp(&b)));

    let coords: Vec<[f64; 2]> = order
        .iter()
        .map(|&i| [points[i].longitude, points[i].latitude])
        .collect();

    let labels = match index {
        NeighborIndex::Linear => expand_clusters(&LinearScan::new(&coords), coords.len(), eps, min_points),
        NeighborIndex::RTree => expand_clusters(&RTreeSearch::new(&coords), coords.len(), eps, min_points),
    };

    let cluster_count = labels
        .iter()
        .filter_map(|l| match l {
            Label::Member(c) => Some(c + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    let mut members: Vec<Vec<TrajectoryPoint>> = vec![Vec::new(); cluster_count];
    let mut noise = Vec::new();
    let mut assignments = vec![None; points.len()];

    for (k, label) in labels.iter().enumerate() {
        let original = order[k];
        match label {
            Label::Member(c) => {
                members[*c].push(points[original]);
                assignments[original] = Some(*c);
            }
            _ => noise.push(points[original]),
        }
    }

    let clusters: Vec<Cluster> = members
        .into_iter()
        .enumerate()
        .filter_map(|(id, points)| {
            let positions: Vec<GpsPoint> = points.iter().map(|p| p.position()).collect();
            let bounds = Bounds::from_points(&positions)?;
            Some(Cluster {
                id,
                centroid: compute_center(&positions),
                bounds,
                points,
            })
        })
        .collect();

    debug!(
        "[Clustering] {} points -> {} clusters, {} noise, {} discarded",
        points.len(),
        clusters.len(),
        noise.len(),
        discarded
    );

    ClusterResult {
        clusters,
        noise,
        assignments,
        discarded,
    }
}

#[cfg(feature = "parallel")]
fn neighborhoods<S: NeighborSearch>(search: &S, n: usize, eps: f64) -> Vec<Vec<usize>> {
    (0..n).into_par_iter().map(|i| search.neighbors(i, eps)).collect()
}

#[cfg(not(feature = "parallel"))]
fn neighborhoods<S: NeighborSearch>(search: &S, n: usize, eps: f64) -> Vec<Vec<usize>> {
    (0..n).map(|i| search.neighbors(i, eps)).collect()
}

fn expand_clusters<S: NeighborSearch>(
    search: &S,
    n: usize,
    eps: f64,
    min_points: usize,
) -> Vec<Label> {
    let neighborhoods = neighborhoods(search, n, eps);
    let mut labels = vec![Label::Unvisited; n];
    let mut next_cluster = 0;

    for i in 0..n {
        if labels[i] != Label::Unvisited {
            continue;
        }
        if neighborhoods[i].len() < min_points {
            // Provisional: may still be claimed as a border point later
            labels[i] = Label::Noise;
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Label::Member(cluster);

        let mut queue: VecDeque<usize> = neighborhoods[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Label::Member(_) => continue,
                Label::Noise => {
                    labels[j] = Label::Member(cluster);
                    continue;
                }
                Label::Unvisited => {
                    labels[j] = Label::Member(cluster);
                }
            }
            if neighborhoods[j].len() >= min_points {
                queue.extend(
                    neighborhoods[j]
                        .iter()
                        .copied()
                        .filter(|&k| !matches!(labels[k], Label::Member(_))),
                );
            }
        }
    }

    labels
}

/// Configured DBSCAN front end with batch-size and parameter validation.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryClusterer {
    config: ClusterConfig,
}

impl TrajectoryClusterer {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Cluster a batch of corrected, boundary-filtered points.
    pub fn cluster(&self, points: &[TrajectoryPoint]) -> Result<ClusterResult> {
        if let Some(maximum) = self.config.max_batch_points {
            if points.len() > maximum {
                return Err(HeatlineError::BatchTooLarge {
                    size: points.len(),
                    maximum,
                });
            }
        }
        Ok(dbscan_with_index(
            points,
            self.config.eps_degrees,
            self.config.min_points,
            self.config.index,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(lat: f64, lng: f64, start_ts: i64) -> Vec<TrajectoryPoint> {
        (0..5)
            .map(|i| {
                TrajectoryPoint::new(lat + i as f64 * 0.00001, lng + i as f64 * 0.00001, start_ts + i)
                    .in_local_frame()
            })
            .collect()
    }

    #[test]
    fn test_border_point_joins_cluster() {
        // Two core points in the middle, one border point at each end
        let points: Vec<TrajectoryPoint> = [0.0, 0.00006, 0.00012, 0.0002]
            .iter()
            .enumerate()
            .map(|(i, d)| TrajectoryPoint::new(51.5 + d, -0.12, i as i64))
            .collect();
        let result = dbscan(&points, 0.0001, 3);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].len(), 4);
        assert!(result.noise.is_empty());
    }

    #[test]
    fn test_all_noise_when_sparse() {
        let points: Vec<TrajectoryPoint> = (0..5)
            .map(|i| TrajectoryPoint::new(51.5 + i as f64 * 0.01, -0.12, i))
            .collect();
        let result = dbscan(&points, 0.0001, 2);
        assert!(result.clusters.is_empty());
        assert_eq!(result.noise.len(), 5);
        assert!(result.assignments.iter().all(|a| a.is_none()));
    }

    #[test]
    fn test_min_points_one_makes_every_point_core() {
        let points: Vec<TrajectoryPoint> = (0..3)
            .map(|i| TrajectoryPoint::new(51.5 + i as f64 * 0.01, -0.12, i))
            .collect();
        let result = dbscan(&points, 0.0001, 1);
        assert_eq!(result.clusters.len(), 3);
    }

    #[test]
    fn test_invalid_points_discarded() {
        let mut points = blob(51.5, -0.12, 0);
        points.push(TrajectoryPoint::new(f64::NAN, -0.12, 99));
        let result = dbscan(&points, 0.0001, 3);
        assert_eq!(result.discarded, 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.assignments[5], None);
    }

    #[test]
    fn test_assignments_align_with_input() {
        let mut points = blob(51.5, -0.12, 0);
        points.extend(blob(51.6, -0.12, 10));
        let result = dbscan(&points, 0.0001, 3);
        assert_eq!(result.clusters.len(), 2);
        let first = result.assignments[0].unwrap();
        assert!(result.assignments[..5].iter().all(|a| *a == Some(first)));
        assert!(result.assignments[5..].iter().all(|a| *a == Some(1 - first)));
    }

    #[test]
    fn test_rtree_matches_linear() {
        let mut points = blob(51.5, -0.12, 0);
        points.extend(blob(51.5005, -0.1195, 10));
        points.push(TrajectoryPoint::new(51.52, -0.10, 50));

        let linear = dbscan_with_index(&points, 0.0001, 3, NeighborIndex::Linear);
        let rtree = dbscan_with_index(&points, 0.0001, 3, NeighborIndex::RTree);
        assert_eq!(linear, rtree);
    }

    #[test]
    fn test_clusterer_rejects_large_batch() {
        let clusterer = TrajectoryClusterer::new(ClusterConfig {
            max_batch_points: Some(3),
            ..ClusterConfig::default()
        })
        .unwrap();
        let err = clusterer.cluster(&blob(51.5, -0.12, 0)).unwrap_err();
        assert!(matches!(err, HeatlineError::BatchTooLarge { size: 5, maximum: 3 }));
    }

    #[test]
    fn test_clusterer_rejects_bad_config() {
        let bad = ClusterConfig {
            min_points: 0,
            ..ClusterConfig::default()
        };
        assert!(TrajectoryClusterer::new(bad).is_err());
    }
}
