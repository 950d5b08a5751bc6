//! Coordinate-frame correction.
//!
//! Device GPS reports WGS-84. Map tiles for the venue are drawn in GCJ-02, a
//! deliberately distorted frame offset by up to several hundred meters. All
//! geometry (boundaries, path edges, trajectory samples) must be corrected
//! once, forward only, before any distance or containment comparison.

use std::f64::consts::PI;
use std::sync::Arc;

use crate::config::TransformKind;
use crate::{CoordinateFrame, GpsPoint, TrajectoryPoint};

/// Krasovsky 1940 semi-major axis.
const SEMI_MAJOR_AXIS: f64 = 6_378_245.0;
/// Krasovsky 1940 first eccentricity squared.
const ECCENTRICITY_SQ: f64 = 0.006_693_421_622_965_943;

/// A forward-only, deterministic coordinate correction.
pub trait CoordinateTransform: Send + Sync {
    /// Correct `(lon, lat)` into the rendering frame.
    fn transform(&self, lon: f64, lat: f64) -> (f64, f64);

    fn transform_point(&self, point: &GpsPoint) -> GpsPoint {
        let (lon, lat) = self.transform(point.longitude, point.latitude);
        GpsPoint::new(lat, lon)
    }

    /// Correct a trajectory sample unless it is already in the local frame.
    fn to_local(&self, point: &TrajectoryPoint) -> TrajectoryPoint {
        match point.frame {
            CoordinateFrame::Local => *point,
            CoordinateFrame::Satellite => {
                let (lon, lat) = self.transform(point.longitude, point.latitude);
                TrajectoryPoint {
                    latitude: lat,
                    longitude: lon,
                    frame: CoordinateFrame::Local,
                    ..*point
                }
            }
        }
    }
}

/// WGS-84 → GCJ-02. Identity outside the distorted region.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gcj02Transform;

impl CoordinateTransform for Gcj02Transform {
    fn transform(&self, lon: f64, lat: f64) -> (f64, f64) {
        transform(lon, lat)
    }
}

/// Pass-through for venues whose tiles already use the satellite frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl CoordinateTransform for IdentityTransform {
    fn transform(&self, lon: f64, lat: f64) -> (f64, f64) {
        (lon, lat)
    }
}

impl TransformKind {
    pub fn build(self) -> Arc<dyn CoordinateTransform> {
        match self {
            TransformKind::Gcj02 => Arc::new(Gcj02Transform),
            TransformKind::Identity => Arc::new(IdentityTransform),
        }
    }
}

/// True when the point lies outside the region where GCJ-02 applies.
pub fn out_of_region(lon: f64, lat: f64) -> bool {
    !(72.004..=137.8347).contains(&lon) || !(0.8293..=55.8271).contains(&lat)
}

/// Correct a WGS-84 `(lon, lat)` into GCJ-02.
///
/// Non-finite input and points outside the region are returned unchanged.
///
/// # Example
/// ```
/// use heatline::transform;
///
/// let (lon, lat) = transform(116.397428, 39.90923);
/// assert!((lon - 116.397428).abs() > 0.001);
/// assert_eq!(transform(-0.1278, 51.5074), (-0.1278, 51.5074));
/// ```
pub fn transform(lon: f64, lat: f64) -> (f64, f64) {
    if !lon.is_finite() || !lat.is_finite() || out_of_region(lon, lat) {
        return (lon, lat);
    }

    let mut dlat = delta_lat(lon - 105.0, lat - 35.0);
    let mut dlon = delta_lon(lon - 105.0, lat - 35.0);

    let radlat = lat / 180.0 * PI;
    let mut magic = radlat.sin();
    magic = 1.0 - ECCENTRICITY_SQ * magic * magic;
    let sqrt_magic = magic.sqrt();

    dlat = (dlat * 180.0) / ((SEMI_MAJOR_AXIS * (1.0 - ECCENTRICITY_SQ)) / (magic * sqrt_magic) * PI);
    dlon = (dlon * 180.0) / (SEMI_MAJOR_AXIS / sqrt_magic * radlat.cos() * PI);

    (lon + dlon, lat + dlat)
}

fn delta_lat(x: f64, y: f64) -> f64 {
    let mut ret = -100.0 + 2.0 * x + 3.0 * y + 0.2 * y * y + 0.1 * x * y + 0.2 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (y * PI).sin() + 40.0 * (y / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (160.0 * (y / 12.0 * PI).sin() + 320.0 * (y * PI / 30.0).sin()) * 2.0 / 3.0;
    ret
}

fn delta_lon(x: f64, y: f64) -> f64 {
    let mut ret = 300.0 + x + 2.0 * y + 0.1 * x * x + 0.1 * x * y + 0.1 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (x * PI).sin() + 40.0 * (x / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (150.0 * (x / 12.0 * PI).sin() + 300.0 * (x / 30.0 * PI).sin()) * 2.0 / 3.0;
    ret
}
