//! Geographic utilities.
//!
//! Distances are venue-scale approximations: haversine for point pairs and a
//! local equirectangular projection for point-to-segment distance. Neither
//! is geodesically exact, both are well within GPS error over a few km.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance between two points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Total length of a polyline in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

/// Convert a distance in meters to `(latitude, longitude)` degree spans at `ref_lat`.
pub fn meters_to_degrees(meters: f64, ref_lat: f64) -> (f64, f64) {
    let dlat = meters / METERS_PER_DEGREE;
    let cos_lat = ref_lat.to_radians().cos().abs().max(1e-6);
    let dlng = meters / (METERS_PER_DEGREE * cos_lat);
    (dlat, dlng)
}

/// Project `point` onto a local tangent plane centered at `origin` (meters, x east, y north).
pub fn local_projection(origin: &GpsPoint, point: &GpsPoint) -> (f64, f64) {
    let cos_lat = origin.latitude.to_radians().cos();
    let x = (point.longitude - origin.longitude) * METERS_PER_DEGREE * cos_lat;
    let y = (point.latitude - origin.latitude) * METERS_PER_DEGREE;
    (x, y)
}

/// Minimum distance in meters from `point` to the segment `start`-`end`.
pub fn point_to_segment_distance(point: &GpsPoint, start: &GpsPoint, end: &GpsPoint) -> f64 {
    let (bx, by) = local_projection(start, end);
    let (px, py) = local_projection(start, point);

    let len_sq = bx * bx + by * by;
    if len_sq == 0.0 {
        return (px * px + py * py).sqrt();
    }

    let t = ((px * bx + py * by) / len_sq).clamp(0.0, 1.0);
    let dx = px - t * bx;
    let dy = py - t * by;
    (dx * dx + dy * dy).sqrt()
}

/// Midpoint of two nearby points (plain coordinate average).
pub fn midpoint(a: &GpsPoint, b: &GpsPoint) -> GpsPoint {
    GpsPoint::new(
        (a.latitude + b.latitude) / 2.0,
        (a.longitude + b.longitude) / 2.0,
    )
}

/// Compute bounding box of a track. Empty tracks yield an all-zero box.
pub fn compute_bounds(points: &[GpsPoint]) -> Bounds {
    Bounds::from_points(points).unwrap_or(Bounds {
        min_lat: 0.0,
        max_lat: 0.0,
        min_lng: 0.0,
        max_lng: 0.0,
    })
}

/// Arithmetic mean of the points. Empty input yields (0, 0).
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.latitude).sum::<f64>() / n;
    let lng = points.iter().map(|p| p.longitude).sum::<f64>() / n;
    GpsPoint::new(lat, lng)
}
