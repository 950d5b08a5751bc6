//! Venue mask: a polygon with a hole that greys out everything outside the
//! venue.
//!
//! The outer ring is the boundary's bounding box grown by the configured
//! padding. The inner ring is the boundary in reversed order. The outer ring
//! always winds opposite to the inner ring, so the hole renders under both
//! even-odd and nonzero fill rules.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use geo::{LineString, Winding};
use log::debug;
use lru::LruCache;
use serde::Serialize;

use crate::config::{MaskConfig, MaskPadding};
use crate::error::{HeatlineError, Result};
use crate::venue::VenueBoundary;
use crate::GpsPoint;

/// Polygon-with-hole handed to the rendering layer. Both rings are closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskPolygon {
    /// `[lon, lat]` vertices of the padded bounding box
    pub outer_ring: Vec<[f64; 2]>,
    /// `[lon, lat]` vertices of the venue boundary, reversed
    pub inner_ring: Vec<[f64; 2]>,
}

struct CachedMask {
    /// Boundary the mask was built from
    source: Vec<GpsPoint>,
    mask: Arc<MaskPolygon>,
}

/// Builds venue masks and caches them per venue id.
pub struct MaskPolygonBuilder {
    config: MaskConfig,
    cache: Mutex<LruCache<String, CachedMask>>,
    builds: AtomicU64,
}

impl MaskPolygonBuilder {
    pub fn new(config: MaskConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.cache_capacity)
            .ok_or_else(|| HeatlineError::config("cache_capacity must be at least 1"))?;
        Ok(Self {
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            builds: AtomicU64::new(0),
        })
    }

    /// Build a mask without touching the cache.
    pub fn build(&self, boundary: &VenueBoundary) -> MaskPolygon {
        self.builds.fetch_add(1, Ordering::Relaxed);

        let bounds = boundary.bounds();
        let (dlat, dlng) = match self.config.padding {
            MaskPadding::Ratio(r) => (
                (bounds.max_lat - bounds.min_lat) * r,
                (bounds.max_lng - bounds.min_lng) * r,
            ),
            MaskPadding::Absolute(d) => (d, d),
        };
        let padded = bounds.expanded(dlat, dlng);

        let inner: LineString<f64> = boundary
            .vertices()
            .iter()
            .rev()
            .map(|p| p.lon_lat())
            .collect::<Vec<_>>()
            .into();

        let mut outer: LineString<f64> = vec![
            [padded.min_lng, padded.min_lat],
            [padded.max_lng, padded.min_lat],
            [padded.max_lng, padded.max_lat],
            [padded.min_lng, padded.max_lat],
        ]
        .into();
        outer.close();

        if inner.is_ccw() {
            outer.make_cw_winding();
        } else {
            outer.make_ccw_winding();
        }

        MaskPolygon {
            outer_ring: ring_coords(&outer),
            inner_ring: ring_coords(&inner),
        }
    }

    /// Cached mask for a venue, rebuilt only when its boundary changed.
    pub fn mask_for(&self, venue_id: &str, boundary: &VenueBoundary) -> Result<Arc<MaskPolygon>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| HeatlineError::Internal {
                message: "mask cache lock poisoned".to_string(),
            })?;

        if let Some(cached) = cache.get(venue_id) {
            if cached.source.as_slice() == boundary.vertices() {
                return Ok(Arc::clone(&cached.mask));
            }
            debug!("[Mask] Boundary of {} changed, rebuilding", venue_id);
        }

        let mask = Arc::new(self.build(boundary));
        cache.put(
            venue_id.to_string(),
            CachedMask {
                source: boundary.vertices().to_vec(),
                mask: Arc::clone(&mask),
            },
        );
        Ok(mask)
    }

    /// Drop a venue's cached mask.
    pub fn invalidate(&self, venue_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(venue_id);
        }
    }

    /// Masks built so far, cached or not.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}

fn ring_coords(ring: &LineString<f64>) -> Vec<[f64; 2]> {
    ring.coords().map(|c| [c.x, c.y]).collect()
}
