#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use heatline::{
    HeatlineConfig, HeatlineError, LocationCallback, LocationEvent, LocationSource,
    LocationSubscription, LocationUpdate, LonLat, PathEdgeDefinition, Result, TransformKind,
    VenueDefinition,
};

/// Square park at lat 51.50..51.51, lon -0.13..-0.12 with an L-shaped path:
/// a west-east leg along lat 51.502 and a south-north leg along lon -0.122.
pub fn l_park() -> VenueDefinition {
    VenueDefinition {
        id: "park".to_string(),
        boundary: vec![
            LonLat::new(-0.130, 51.500),
            LonLat::new(-0.120, 51.500),
            LonLat::new(-0.120, 51.510),
            LonLat::new(-0.130, 51.510),
        ],
        path_edges: vec![PathEdgeDefinition {
            vertices: vec![
                LonLat::new(-0.128, 51.502),
                LonLat::new(-0.122, 51.502),
                LonLat::new(-0.122, 51.508),
            ],
        }],
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn identity_config() -> HeatlineConfig {
    HeatlineConfig {
        transform: TransformKind::Identity,
        ..HeatlineConfig::default()
    }
}

/// 100 samples walking the L path, one per second.
pub fn l_walk(start_ts: i64) -> Vec<LocationUpdate> {
    let mut walk = Vec::with_capacity(100);
    for i in 0..50 {
        let lon = -0.128 + 0.006 * i as f64 / 49.0;
        walk.push(update(51.502, lon, start_ts + i as i64 * 1_000));
    }
    for i in 1..=50 {
        let lat = 51.502 + 0.006 * i as f64 / 50.0;
        walk.push(update(lat, -0.122, start_ts + (49 + i) as i64 * 1_000));
    }
    walk
}

pub fn update(lat: f64, lon: f64, timestamp: i64) -> LocationUpdate {
    LocationUpdate {
        latitude: lat,
        longitude: lon,
        accuracy: 5.0,
        speed: Some(1.2),
        heading: None,
        timestamp,
    }
}

type Slot = Arc<Mutex<Option<LocationCallback>>>;

/// Location source driven by the test.
#[derive(Default)]
pub struct ManualSource {
    slot: Slot,
    pub refuse: bool,
}

struct ManualSubscription {
    slot: Slot,
}

impl LocationSubscription for ManualSubscription {
    fn cancel(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

impl LocationSource for ManualSource {
    fn subscribe(&self, callback: LocationCallback) -> Result<Box<dyn LocationSubscription>> {
        if self.refuse {
            return Err(HeatlineError::LocationUnavailable {
                reason: "permission denied".to_string(),
            });
        }
        *self.slot.lock().unwrap() = Some(callback);
        Ok(Box::new(ManualSubscription {
            slot: Arc::clone(&self.slot),
        }))
    }
}

impl ManualSource {
    /// A source whose permission request is denied.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn emit(&self, update: LocationUpdate) {
        self.emit_event(LocationEvent::Update(update));
    }

    pub fn emit_event(&self, event: LocationEvent) {
        let callback = self.slot.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}
