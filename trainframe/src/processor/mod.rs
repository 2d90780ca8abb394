//! Event-folding processor.
//!
//! The processor owns the pipeline: it subscribes to the normalized-events
//! topic through its consumer group, folds upsert/remove events into
//! per-city vehicle maps, and triggers frame recomputation for the affected
//! city after every fold. The per-city maps are owned exclusively by the
//! fold step; the TTL store is the only state it shares with the outside.
//!
//! # Lifecycle
//!
//! ```text
//! stopped --start()--> running --stop()--> stopped
//! ```
//!
//! Both transitions are idempotent. `start` establishes exactly one
//! consumer-group subscription; `stop` detaches it and lets an in-flight
//! handler finish — there is no forced cancellation.
//!
//! # Resilience
//!
//! Optional retry and circuit-breaker policies are injected and applied at
//! the transport boundary (the publish helper). Frame-computation errors
//! are local: collected into the pass result and counted, never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::bus::{BoxFuture, BusError, EventBus, HandlerError, MessageHandler, Subscription};
use crate::config::PipelineConfig;
use crate::frame::FrameComputer;
use crate::model::{BBox, EventEnvelope, ScopeDefinition, ValidationError, VehicleEvent, VehiclePosition};
use crate::resilience::{BreakerError, CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryPolicy};
use crate::scope::{clamp_to_web_mercator, clamp_zoom, compute_scope_id, quantize_bbox, ScopeError, ScopeIdOptions};
use crate::store::{ScopeStore, StoreError};
use crate::telemetry::PipelineMetrics;

/// Errors from processor lifecycle operations.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("transport error: {0}")]
    Bus(#[from] BusError),
}

/// Errors from scope provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The viewport failed normalization.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// The store rejected the scope write or read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the resilience-wrapped publish helper.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Envelope failed to serialize.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] ValidationError),

    /// Transport rejected the publish (after any retries).
    #[error("transport error: {0}")]
    Bus(#[from] BusError),

    /// Circuit breaker fast-failed without attempting the publish.
    #[error("circuit breaker open, retry in {retry_in:?}")]
    BreakerOpen { retry_in: Duration },
}

/// Per-city vehicle state: `city_id → (vehicle_id → position)`.
type CityState = DashMap<String, HashMap<String, VehiclePosition>>;

/// Message handler doing the validate → fold → recompute sequence.
///
/// Separate from [`Processor`] so the subscription can hold it as a trait
/// object while the processor itself stays available to callers.
struct Worker {
    state: Arc<CityState>,
    frames: FrameComputer,
    metrics: Arc<PipelineMetrics>,
}

impl Worker {
    fn fold(&self, event: VehicleEvent) -> String {
        match event {
            VehicleEvent::Upsert { city_id, payload, .. } => {
                self.state
                    .entry(city_id.clone())
                    .or_default()
                    .insert(payload.id.clone(), payload);
                city_id
            }
            VehicleEvent::Remove { city_id, payload, .. } => {
                // Removing an absent id is a no-op, not an error.
                if let Some(mut city_map) = self.state.get_mut(&city_id) {
                    city_map.remove(&payload.id);
                }
                city_id
            }
        }
    }
}

impl MessageHandler for Worker {
    fn handle(&self, payload: Bytes) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(async move {
            // Rejection is silent to the transport: returning Ok avoids
            // redelivery storms, while logs and counters keep it observable.
            let envelope = match EventEnvelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(%error, "rejected envelope");
                    self.metrics.event_rejected();
                    return Ok(());
                }
            };

            let kind = envelope.data.kind();
            let city_id = self.fold(envelope.data);
            self.metrics.event_processed();
            debug!(kind, city_id = %city_id, "event folded");

            let vehicles: Vec<VehiclePosition> = self
                .state
                .get(&city_id)
                .map(|city_map| city_map.values().cloned().collect())
                .unwrap_or_default();

            let pass = self.frames.compute_frames(&city_id, &vehicles, &|_| true);
            self.metrics.frames_computed(pass.scopes_processed as u64);
            self.metrics.frame_errors(pass.errors.len() as u64);
            Ok(())
        })
    }
}

/// Folds normalized vehicle events into live per-city state and keeps
/// scope frames current.
///
/// Collaborators — bus, store, resilience policies — are injected; the
/// processor composes, it does not construct transports.
pub struct Processor {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn ScopeStore>,
    config: PipelineConfig,
    worker: Arc<Worker>,
    metrics: Arc<PipelineMetrics>,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreaker>,
    subscription: Mutex<Option<Subscription>>,
}

impl Processor {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn ScopeStore>, config: PipelineConfig) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let worker = Arc::new(Worker {
            state: Arc::new(CityState::new()),
            frames: FrameComputer::new(Arc::clone(&store), config.store.frame_ttl),
            metrics: Arc::clone(&metrics),
        });
        Self {
            bus,
            store,
            config,
            worker,
            metrics,
            retry: None,
            breaker: None,
            subscription: Mutex::new(None),
        }
    }

    /// Retry transient transport failures on the publish path.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(RetryPolicy::new(config));
        self
    }

    /// Fast-fail publishes while the transport is unhealthy.
    #[must_use]
    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(CircuitBreaker::new(config));
        self
    }

    /// Begin consuming the normalized-events topic.
    ///
    /// Idempotent: a running processor ignores further starts.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let mut slot = self.subscription.lock();
        if slot.is_some() {
            debug!("processor already running, start ignored");
            return Ok(());
        }

        let processor_config = &self.config.processor;
        let subscription = self.bus.subscribe(
            &processor_config.topic,
            &processor_config.group,
            &processor_config.consumer_id,
            Arc::clone(&self.worker) as Arc<dyn MessageHandler>,
        )?;
        info!(
            topic = %processor_config.topic,
            group = %processor_config.group,
            consumer = %processor_config.consumer_id,
            "processor started"
        );
        *slot = Some(subscription);
        Ok(())
    }

    /// Detach the subscription.
    ///
    /// Idempotent. A handler already executing for a delivered message is
    /// allowed to complete; no further messages are delivered.
    pub fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
            info!("processor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Publish an envelope to the normalized-events topic through the
    /// configured resilience policies.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let payload = envelope.encode()?;
        let topic = self.config.processor.topic.as_str();
        let bus = &self.bus;
        let breaker = self.breaker.as_ref();

        let attempt = move || {
            let payload = payload.clone();
            async move {
                match breaker {
                    Some(breaker) => breaker
                        .execute("publish", bus.publish(topic, payload))
                        .await
                        .map_err(|error| match error {
                            BreakerError::Open { retry_in } => PublishError::BreakerOpen { retry_in },
                            BreakerError::Operation(bus_error) => PublishError::Bus(bus_error),
                        }),
                    None => bus.publish(topic, payload).await.map_err(PublishError::Bus),
                }
            }
        };

        match &self.retry {
            Some(retry) => retry.execute("publish", attempt).await,
            None => attempt().await,
        }
    }

    /// Provision (or re-arm) a viewport scope for a city.
    ///
    /// The bbox is normalized — Web-Mercator clamp, quantization at the
    /// configured precision, zoom hint rounded — and its deterministic
    /// identifier derived, so jittered requests for the same viewport
    /// converge on one scope. If the scope already exists its definition is
    /// returned as-is; otherwise a fresh definition is written with the
    /// configured scope TTL.
    pub fn provision_scope(
        &self,
        city_id: &str,
        bbox: &BBox,
    ) -> Result<ScopeDefinition, ProvisionError> {
        let options = ScopeIdOptions {
            precision: self.config.processor.scope_precision,
            ..ScopeIdOptions::default()
        };
        let id = compute_scope_id(city_id, bbox, &options)?;

        if let Some(existing) = self.store.get_scope(&id)? {
            debug!(scope_id = %id, "scope already provisioned");
            return Ok(existing);
        }

        let mut canonical = quantize_bbox(&clamp_to_web_mercator(bbox), options.precision)?;
        canonical.zoom = clamp_zoom(bbox.zoom).map(f64::from);
        let definition = ScopeDefinition {
            id: id.clone(),
            city_id: city_id.to_string(),
            bbox: canonical,
            created_at: Utc::now(),
        };
        self.store
            .upsert_scope(&id, definition.clone(), self.config.store.scope_ttl)?;
        info!(scope_id = %id, city_id, "scope provisioned");
        Ok(definition)
    }

    /// Live vehicle count for a city.
    pub fn vehicle_count(&self, city_id: &str) -> usize {
        self.worker
            .state
            .get(city_id)
            .map_or(0, |city_map| city_map.len())
    }

    /// Pipeline counters shared with the handler.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Instant;

    use crate::bus::InMemoryBus;
    use crate::model::{BBox, Coordinate, ScopeDefinition, VehicleRef};
    use crate::store::{MemoryScopeStore, StoreError};

    fn pipeline() -> (Arc<InMemoryBus>, Arc<MemoryScopeStore>, Processor) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryScopeStore::new());
        let processor = Processor::new(
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&store) as Arc<dyn ScopeStore>,
            PipelineConfig::default(),
        );
        (bus, store, processor)
    }

    fn provision(store: &MemoryScopeStore, id: &str, city: &str) {
        store
            .upsert_scope(
                id,
                ScopeDefinition {
                    id: id.to_string(),
                    city_id: city.to_string(),
                    bbox: BBox {
                        south: 40.0,
                        west: -74.5,
                        north: 41.0,
                        east: -73.5,
                        zoom: None,
                    },
                    created_at: Utc::now(),
                },
                Duration::from_secs(60),
            )
            .unwrap();
    }

    fn upsert(city: &str, id: &str, lat: f64, lng: f64) -> EventEnvelope {
        EventEnvelope::new(VehicleEvent::Upsert {
            at: Utc::now(),
            city_id: city.to_string(),
            source: "test".to_string(),
            payload: VehiclePosition {
                id: id.to_string(),
                coordinate: Coordinate { lat, lng },
                updated_at: Utc::now(),
                bearing: None,
                speed_mps: None,
                status: None,
            },
        })
    }

    fn remove(city: &str, id: &str) -> EventEnvelope {
        EventEnvelope::new(VehicleEvent::Remove {
            at: Utc::now(),
            city_id: city.to_string(),
            source: "test".to_string(),
            payload: VehicleRef { id: id.to_string() },
        })
    }

    /// Poll until `check` passes or a deadline lapses.
    async fn wait_until(check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (bus, _store, processor) = pipeline();
        processor.start().unwrap();
        processor.start().unwrap();

        assert!(processor.is_running());
        assert_eq!(
            bus.subscriber_count(&processor.config.processor.topic),
            1,
            "second start must not add a subscription"
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_detaches() {
        let (_bus, _store, processor) = pipeline();
        processor.start().unwrap();
        processor.stop();
        processor.stop();
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_upsert_then_remove_flows_into_frames() {
        let (_bus, store, processor) = pipeline();
        provision(&store, "scope-1", "nyc");
        processor.start().unwrap();

        processor
            .publish_envelope(&upsert("nyc", "veh-1", 40.5, -74.0))
            .await
            .unwrap();
        wait_until(|| {
            store
                .get_frame("scope-1")
                .unwrap()
                .is_some_and(|f| f.vehicles.iter().any(|v| v.id == "veh-1"))
        })
        .await;

        processor.publish_envelope(&remove("nyc", "veh-1")).await.unwrap();
        wait_until(|| {
            store
                .get_frame("scope-1")
                .unwrap()
                .is_some_and(|f| f.vehicles.is_empty())
        })
        .await;

        assert_eq!(processor.vehicle_count("nyc"), 0);
        assert_eq!(processor.metrics().snapshot().events_processed, 2);
    }

    #[tokio::test]
    async fn test_vehicle_outside_bbox_is_excluded() {
        let (_bus, store, processor) = pipeline();
        provision(&store, "scope-1", "nyc");
        processor.start().unwrap();

        processor
            .publish_envelope(&upsert("nyc", "far-away", 10.0, 10.0))
            .await
            .unwrap();
        wait_until(|| store.get_frame("scope-1").unwrap().is_some()).await;

        let frame = store.get_frame("scope-1").unwrap().unwrap();
        assert!(frame.vehicles.is_empty());
        assert_eq!(processor.vehicle_count("nyc"), 1, "state holds it, frame excludes it");
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_dropped_not_fatal() {
        let (bus, store, processor) = pipeline();
        provision(&store, "scope-1", "nyc");
        processor.start().unwrap();

        bus.publish(
            &processor.config.processor.topic,
            Bytes::from_static(b"{not json"),
        )
        .await
        .unwrap();
        wait_until(|| processor.metrics().snapshot().events_rejected == 1).await;

        // The subscription survived; a valid event still lands.
        processor
            .publish_envelope(&upsert("nyc", "veh-2", 40.5, -74.0))
            .await
            .unwrap();
        wait_until(|| processor.metrics().snapshot().events_processed == 1).await;
    }

    #[tokio::test]
    async fn test_remove_of_absent_vehicle_is_noop() {
        let (_bus, store, processor) = pipeline();
        provision(&store, "scope-1", "nyc");
        processor.start().unwrap();

        processor.publish_envelope(&remove("nyc", "ghost")).await.unwrap();
        wait_until(|| processor.metrics().snapshot().events_processed == 1).await;

        assert_eq!(processor.vehicle_count("nyc"), 0);
        assert_eq!(processor.metrics().snapshot().events_rejected, 0);
    }

    #[tokio::test]
    async fn test_cities_fold_into_separate_maps() {
        let (_bus, store, processor) = pipeline();
        provision(&store, "scope-nyc", "nyc");
        processor.start().unwrap();

        processor
            .publish_envelope(&upsert("nyc", "veh-1", 40.5, -74.0))
            .await
            .unwrap();
        processor
            .publish_envelope(&upsert("akl", "veh-1", -36.8, 174.7))
            .await
            .unwrap();
        wait_until(|| processor.metrics().snapshot().events_processed == 2).await;

        assert_eq!(processor.vehicle_count("nyc"), 1);
        assert_eq!(processor.vehicle_count("akl"), 1);
    }

    #[tokio::test]
    async fn test_provision_scope_is_idempotent_under_jitter() {
        let (_bus, store, processor) = pipeline();
        let viewport = BBox {
            south: 40.7,
            west: -74.0,
            north: 40.8,
            east: -73.9,
            zoom: Some(12.0),
        };

        let first = processor.provision_scope("nyc", &viewport).unwrap();

        let mut jittered = viewport;
        jittered.south += 1e-8;
        jittered.zoom = Some(5.0);
        let second = processor.provision_scope("nyc", &jittered).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(
            first.created_at, second.created_at,
            "existing scope returned, not recreated"
        );
        assert_eq!(store.resident_scopes(), 1);
    }

    #[tokio::test]
    async fn test_provisioned_scope_receives_frames() {
        let (_bus, store, processor) = pipeline();
        let scope = processor
            .provision_scope(
                "nyc",
                &BBox {
                    south: 40.0,
                    west: -74.5,
                    north: 41.0,
                    east: -73.5,
                    zoom: None,
                },
            )
            .unwrap();
        processor.start().unwrap();

        processor
            .publish_envelope(&upsert("nyc", "veh-1", 40.5, -74.0))
            .await
            .unwrap();
        let scope_id = scope.id.clone();
        wait_until(|| {
            store
                .get_frame(&scope_id)
                .unwrap()
                .is_some_and(|f| f.vehicles.iter().any(|v| v.id == "veh-1"))
        })
        .await;
    }

    /// Bus whose publish always fails, for resilience-path tests.
    struct DeadBus;

    impl EventBus for DeadBus {
        fn publish(&self, _topic: &str, _payload: Bytes) -> BoxFuture<'_, Result<(), BusError>> {
            Box::pin(async { Err(BusError::Transport("unreachable".to_string())) })
        }

        fn subscribe(
            &self,
            _topic: &str,
            _group: &str,
            _consumer_id: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> Result<Subscription, BusError> {
            Err(BusError::Transport("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_publish_retries_then_surfaces_last_error() {
        let store = Arc::new(MemoryScopeStore::new());
        let processor = Processor::new(
            Arc::new(DeadBus),
            store as Arc<dyn ScopeStore>,
            PipelineConfig::default(),
        )
        .with_retry(RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_backoff: false,
        });

        let err = processor
            .publish_envelope(&upsert("nyc", "veh-1", 40.5, -74.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Bus(BusError::Transport(_))));
    }

    #[tokio::test]
    async fn test_publish_breaker_fast_fails_once_open() {
        let store = Arc::new(MemoryScopeStore::new());
        let processor = Processor::new(
            Arc::new(DeadBus),
            store as Arc<dyn ScopeStore>,
            PipelineConfig::default(),
        )
        .with_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(30),
        });

        let envelope = upsert("nyc", "veh-1", 40.5, -74.0);
        let first = processor.publish_envelope(&envelope).await.unwrap_err();
        assert!(matches!(first, PublishError::Bus(_)));

        let second = processor.publish_envelope(&envelope).await.unwrap_err();
        assert!(matches!(second, PublishError::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn test_frame_errors_are_counted_not_fatal() {
        struct BrokenFrames {
            inner: MemoryScopeStore,
        }
        impl ScopeStore for BrokenFrames {
            fn upsert_scope(
                &self,
                id: &str,
                def: ScopeDefinition,
                ttl: Duration,
            ) -> Result<(), StoreError> {
                self.inner.upsert_scope(id, def, ttl)
            }
            fn get_scope(&self, id: &str) -> Result<Option<ScopeDefinition>, StoreError> {
                self.inner.get_scope(id)
            }
            fn set_frame(
                &self,
                _id: &str,
                _frame: crate::model::ScopedTrainsFrame,
                _ttl: Duration,
            ) -> Result<(), StoreError> {
                Err(StoreError::Backend("write refused".to_string()))
            }
            fn get_frame(
                &self,
                id: &str,
            ) -> Result<Option<crate::model::ScopedTrainsFrame>, StoreError> {
                self.inner.get_frame(id)
            }
            fn for_each_active_scope(
                &self,
                f: &mut dyn FnMut(&ScopeDefinition),
            ) -> Result<(), StoreError> {
                self.inner.for_each_active_scope(f)
            }
        }

        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(BrokenFrames {
            inner: MemoryScopeStore::new(),
        });
        provision(&store.inner, "scope-1", "nyc");
        let processor = Processor::new(
            Arc::clone(&bus) as Arc<dyn EventBus>,
            store as Arc<dyn ScopeStore>,
            PipelineConfig::default(),
        );
        processor.start().unwrap();

        processor
            .publish_envelope(&upsert("nyc", "veh-1", 40.5, -74.0))
            .await
            .unwrap();
        wait_until(|| processor.metrics().snapshot().frame_errors == 1).await;

        // Event itself was folded fine.
        assert_eq!(processor.vehicle_count("nyc"), 1);
        assert!(processor.is_running());
    }
}
