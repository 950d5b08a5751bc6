//! Tracking sessions.
//!
//! A [`TrackingSession`] binds one visitor's location stream to a venue in a
//! [`SegmentHeatAggregator`]. Each accepted update is paired with the previous
//! accepted one and recorded as a segment. Ending the session releases the
//! location subscription and flushes pending writes; dropping it without
//! ending still releases the subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::aggregator::{SegmentHeatAggregator, SegmentOutcome};
use crate::error::{HeatlineError, Result};
use crate::geo_utils::haversine_distance;
use crate::{LocationUpdate, TrajectoryPoint};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Event delivered by a location source.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Update(LocationUpdate),
    /// The device stopped supplying locations (permission revoked, hardware off)
    Unavailable { reason: String },
}

/// Callback invoked by a location source for every event.
pub type LocationCallback = Arc<dyn Fn(LocationEvent) + Send + Sync>;

/// Device location provider.
///
/// Implementations must tolerate [`LocationSubscription::cancel`] being
/// called from inside the callback.
pub trait LocationSource {
    /// Start delivering events. Fails with `LocationUnavailable` when the
    /// device denies or cannot supply locations.
    fn subscribe(&self, callback: LocationCallback) -> Result<Box<dyn LocationSubscription>>;
}

/// Live registration with a location source.
pub trait LocationSubscription: Send {
    /// Stop delivering events. Must be idempotent.
    fn cancel(&mut self);
}

/// Per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub received: u64,
    pub accepted: u64,
    pub recorded_segments: u64,
    pub low_accuracy: u64,
    pub invalid: u64,
    pub out_of_bounds: u64,
    /// Updates older than the previous accepted one
    pub out_of_order: u64,
    pub errors: u64,
    pub distance_m: f64,
}

/// A finished session, as queued for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSession {
    pub session_id: String,
    pub venue_id: String,
    pub user_id: String,
    pub profile: String,
    /// Unix ms
    pub started_at: i64,
    pub ended_at: i64,
    /// Accepted samples in the corrected frame
    pub points: Vec<TrajectoryPoint>,
    pub stats: SessionStats,
    /// Reason, when location became unavailable mid-session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

#[derive(Default)]
struct SessionState {
    last: Option<TrajectoryPoint>,
    points: Vec<TrajectoryPoint>,
    stats: SessionStats,
    aborted: Option<String>,
    closed: bool,
}

struct SessionInner {
    aggregator: Arc<SegmentHeatAggregator>,
    venue_id: String,
    profile: String,
    state: Mutex<SessionState>,
    subscription: Mutex<Option<Box<dyn LocationSubscription>>>,
}

impl SessionInner {
    fn handle_event(&self, event: LocationEvent) {
        match event {
            LocationEvent::Update(update) => self.handle_update(update),
            LocationEvent::Unavailable { reason } => {
                if let Ok(mut state) = self.state.lock() {
                    if state.closed {
                        return;
                    }
                    warn!(
                        "[Session] Location unavailable for {}, aborting: {}",
                        self.venue_id, reason
                    );
                    state.aborted = Some(reason);
                    state.closed = true;
                }
                self.release_subscription();
            }
        }
    }

    fn handle_update(&self, update: LocationUpdate) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed {
            return;
        }
        state.stats.received += 1;

        let point = TrajectoryPoint::from(update);
        if !point.is_valid() {
            state.stats.invalid += 1;
            return;
        }
        if point.accuracy > self.aggregator.config().max_accuracy_m {
            state.stats.low_accuracy += 1;
            return;
        }
        // Stored points are corrected once so the uploaded track matches the map
        let point = self.aggregator.transformer().to_local(&point);

        if let Some(prev) = state.last {
            if point.timestamp < prev.timestamp {
                state.stats.out_of_order += 1;
                return;
            }
            match self
                .aggregator
                .record_segment(&self.venue_id, &self.profile, &prev, &point)
            {
                Ok(SegmentOutcome::Recorded { .. }) => {
                    state.stats.recorded_segments += 1;
                    state.stats.distance_m += haversine_distance(&prev.position(), &point.position());
                }
                Ok(SegmentOutcome::OutOfBounds) => state.stats.out_of_bounds += 1,
                Ok(SegmentOutcome::LowAccuracy) => state.stats.low_accuracy += 1,
                Ok(SegmentOutcome::InvalidPoint) => state.stats.invalid += 1,
                Err(e) => {
                    state.stats.errors += 1;
                    warn!("[Session] Failed to record segment: {}", e);
                }
            }
        }

        state.stats.accepted += 1;
        state.last = Some(point);
        state.points.push(point);
    }

    fn release_subscription(&self) {
        let subscription = match self.subscription.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(mut subscription) = subscription {
            subscription.cancel();
            debug!("[Session] Location subscription released");
        }
    }
}

/// One visitor's live tracking in one venue.
pub struct TrackingSession {
    session_id: String,
    user_id: String,
    started_at: i64,
    inner: Arc<SessionInner>,
}

impl TrackingSession {
    /// Subscribe to `source` and start recording into `venue_id`.
    ///
    /// Fails with `UnknownVenue` before subscribing, or with
    /// `LocationUnavailable` when the source refuses; no state is created
    /// in either case.
    pub fn start(
        source: &dyn LocationSource,
        aggregator: Arc<SegmentHeatAggregator>,
        venue_id: &str,
        user_id: &str,
        profile: &str,
    ) -> Result<Self> {
        aggregator.venue(venue_id)?;

        let started_at = now_millis();
        let sequence = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("{}-{}-{}-{}", venue_id, user_id, started_at, sequence);

        let inner = Arc::new(SessionInner {
            aggregator,
            venue_id: venue_id.to_string(),
            profile: profile.to_string(),
            state: Mutex::new(SessionState::default()),
            subscription: Mutex::new(None),
        });

        let handler = Arc::clone(&inner);
        let callback: LocationCallback = Arc::new(move |event| handler.handle_event(event));
        let subscription = source.subscribe(callback).map_err(|e| match e {
            HeatlineError::LocationUnavailable { .. } => e,
            other => HeatlineError::LocationUnavailable {
                reason: other.to_string(),
            },
        })?;

        match inner.subscription.lock() {
            Ok(mut slot) => *slot = Some(subscription),
            Err(_) => {
                let mut subscription = subscription;
                subscription.cancel();
                return Err(HeatlineError::Internal {
                    message: "session subscription lock poisoned".to_string(),
                });
            }
        }

        info!(
            "[Session] Started {} ({} as {})",
            session_id, user_id, profile
        );

        Ok(Self {
            session_id,
            user_id: user_id.to_string(),
            started_at,
            inner,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn venue_id(&self) -> &str {
        &self.inner.venue_id
    }

    /// Feed an event directly, as the subscription callback does.
    pub fn handle_event(&self, event: LocationEvent) {
        self.inner.handle_event(event);
    }

    pub fn stats(&self) -> SessionStats {
        self.inner
            .state
            .lock()
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    /// Abort reason, once location became unavailable.
    pub fn aborted(&self) -> Option<String> {
        self.inner.state.lock().ok().and_then(|s| s.aborted.clone())
    }

    /// True while the location subscription is held.
    pub fn is_subscribed(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Stop tracking: release the subscription, flush pending writes and
    /// return the session record.
    pub fn end(self) -> Result<CompletedSession> {
        self.inner.release_subscription();

        let (points, stats, aborted) = {
            let mut state = self.inner.state.lock().map_err(|_| HeatlineError::Internal {
                message: "session state lock poisoned".to_string(),
            })?;
            state.closed = true;
            (
                std::mem::take(&mut state.points),
                state.stats.clone(),
                state.aborted.clone(),
            )
        };

        // In-memory heat stays authoritative; the flusher keeps retrying
        if let Err(e) = self.inner.aggregator.flush() {
            warn!("[Session] Flush at end of {} failed: {}", self.session_id, e);
        }

        info!(
            "[Session] Ended {}: {} points, {} segments, {:.0} m",
            self.session_id, stats.accepted, stats.recorded_segments, stats.distance_m
        );

        Ok(CompletedSession {
            session_id: self.session_id.clone(),
            venue_id: self.inner.venue_id.clone(),
            user_id: self.user_id.clone(),
            profile: self.inner.profile.clone(),
            started_at: self.started_at,
            ended_at: now_millis(),
            points,
            stats,
            aborted,
        })
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.inner.release_subscription();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use crate::transform::IdentityTransform;
    use crate::venue::{LonLat, VenueDefinition};

    type Slot = Arc<Mutex<Option<LocationCallback>>>;

    /// Source that stores the callback so tests can push events.
    #[derive(Default)]
    struct ManualSource {
        slot: Slot,
        refuse: bool,
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
        fn emit(&self, event: LocationEvent) {
            let callback = self.slot.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(event);
            }
        }

        fn is_listening(&self) -> bool {
            self.slot.lock().unwrap().is_some()
        }
    }

    fn aggregator() -> Arc<SegmentHeatAggregator> {
        let agg = SegmentHeatAggregator::new(AggregatorConfig::default(), Arc::new(IdentityTransform)).unwrap();
        agg.register_venue(&VenueDefinition {
            id: "park".to_string(),
            boundary: vec![
                LonLat::new(-0.130, 51.500),
                LonLat::new(-0.120, 51.500),
                LonLat::new(-0.120, 51.510),
                LonLat::new(-0.130, 51.510),
            ],
            path_edges: vec![],
        })
        .unwrap();
        Arc::new(agg)
    }

    fn update(lat: f64, lng: f64, accuracy: f64, ts: i64) -> LocationEvent {
        LocationEvent::Update(LocationUpdate {
            latitude: lat,
            longitude: lng,
            accuracy,
            speed: Some(1.2),
            heading: None,
            timestamp: ts,
        })
    }

    #[test]
    fn test_refused_subscription_is_location_unavailable() {
        let source = ManualSource {
            refuse: true,
            ..ManualSource::default()
        };
        let err = TrackingSession::start(&source, aggregator(), "park", "u1", "wheelchair")
            .err()
            .unwrap();
        assert!(matches!(err, HeatlineError::LocationUnavailable { .. }));
    }

    #[test]
    fn test_unknown_venue_does_not_subscribe() {
        let source = ManualSource::default();
        let err = TrackingSession::start(&source, aggregator(), "zoo", "u1", "walker")
            .err()
            .unwrap();
        assert!(matches!(err, HeatlineError::UnknownVenue { .. }));
        assert!(!source.is_listening());
    }

    #[test]
    fn test_updates_recorded_and_filtered() {
        let source = ManualSource::default();
        let agg = aggregator();
        let session = TrackingSession::start(&source, agg.clone(), "park", "u1", "walker").unwrap();

        source.emit(update(51.5050, -0.1250, 5.0, 1_000));
        source.emit(update(51.5051, -0.1250, 90.0, 2_000)); // low accuracy
        source.emit(update(51.5052, -0.1250, 5.0, 3_000));
        source.emit(update(51.5053, -0.1250, 5.0, 2_500)); // out of order
        source.emit(update(51.5200, -0.1250, 5.0, 4_000)); // leaves the venue

        let stats = session.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.low_accuracy, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.recorded_segments, 1);
        assert_eq!(stats.out_of_bounds, 1);

        let completed = session.end().unwrap();
        assert_eq!(completed.points.len(), 3);
        assert!(!source.is_listening());
        assert_eq!(agg.venue_stats("park").unwrap().recorded, 1);
    }

    #[test]
    fn test_unavailable_aborts_and_releases() {
        let source = ManualSource::default();
        let session = TrackingSession::start(&source, aggregator(), "park", "u1", "walker").unwrap();

        source.emit(update(51.5050, -0.1250, 5.0, 1_000));
        source.emit(update(51.5051, -0.1250, 5.0, 2_000));
        source.emit(LocationEvent::Unavailable {
            reason: "gps off".to_string(),
        });
        assert!(!source.is_listening());
        assert!(!session.is_subscribed());

        // Late events are ignored
        session.handle_event(update(51.5052, -0.1250, 5.0, 3_000));

        let completed = session.end().unwrap();
        assert_eq!(completed.aborted.as_deref(), Some("gps off"));
        assert_eq!(completed.stats.recorded_segments, 1);
    }

    #[test]
    fn test_drop_releases_subscription() {
        let source = ManualSource::default();
        {
            let _session = TrackingSession::start(&source, aggregator(), "park", "u1", "walker").unwrap();
            assert!(source.is_listening());
        }
        assert!(!source.is_listening());
    }
}
