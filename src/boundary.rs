//! Point-in-polygon filtering by ray casting.
//!
//! Convention: a point lying on an edge or vertex of the polygon is
//! **outside**. Segments touching the boundary are therefore never
//! aggregated, and the mask hole does not include its own rim.

use crate::GpsPoint;

/// Distance (in degrees) within which a point counts as lying on an edge.
pub const ON_EDGE_EPSILON: f64 = 1e-12;

/// Test whether `point` lies strictly inside `polygon`.
///
/// The polygon is an ordered vertex list in the corrected frame; a repeated
/// closing vertex is optional. Polygons with fewer than 3 vertices contain
/// nothing.
///
/// # Example
/// ```
/// use heatline::{inside, GpsPoint};
///
/// let square = vec![
///     GpsPoint::new(0.0, 0.0),
///     GpsPoint::new(0.0, 1.0),
///     GpsPoint::new(1.0, 1.0),
///     GpsPoint::new(1.0, 0.0),
/// ];
/// assert!(inside(&GpsPoint::new(0.5, 0.5), &square));
/// assert!(!inside(&GpsPoint::new(2.0, 2.0), &square));
/// assert!(!inside(&GpsPoint::new(0.0, 0.5), &square)); // on edge
/// ```
pub fn inside(point: &GpsPoint, polygon: &[GpsPoint]) -> bool {
    let ring = open_ring(polygon);
    if ring.len() < 3 || !point.latitude.is_finite() || !point.longitude.is_finite() {
        return false;
    }

    let x = point.longitude;
    let y = point.latitude;
    let n = ring.len();

    let mut crossings = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].longitude, ring[i].latitude);
        let (xj, yj) = (ring[j].longitude, ring[j].latitude);

        if on_segment(x, y, xj, yj, xi, yi) {
            return false;
        }

        if (yi > y) != (yj > y) {
            let intersect_x = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < intersect_x {
                crossings = !crossings;
            }
        }
        j = i;
    }

    crossings
}

/// Strip an explicit closing vertex so every edge is visited exactly once.
pub(crate) fn open_ring(polygon: &[GpsPoint]) -> &[GpsPoint] {
    match (polygon.first(), polygon.last()) {
        (Some(first), Some(last)) if polygon.len() > 1 && first == last => {
            &polygon[..polygon.len() - 1]
        }
        _ => polygon,
    }
}

fn on_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let dx = bx - ax;
    let dy = by - ay;
    let len = (dx * dx + dy * dy).sqrt();

    if len == 0.0 {
        return (px - ax).abs() <= ON_EDGE_EPSILON && (py - ay).abs() <= ON_EDGE_EPSILON;
    }

    let cross = dx * (py - ay) - dy * (px - ax);
    if cross.abs() > ON_EDGE_EPSILON * len {
        return false;
    }

    px >= ax.min(bx) - ON_EDGE_EPSILON
        && px <= ax.max(bx) + ON_EDGE_EPSILON
        && py >= ay.min(by) - ON_EDGE_EPSILON
        && py <= ay.max(by) + ON_EDGE_EPSILON
}
