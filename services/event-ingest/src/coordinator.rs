//! Per-message ingestion state machine.
//!
//! ```text
//! RECEIVED ─normalize─▶ NORMALIZED ─gate─▶ GATED ─put─▶ STORED ─insert─▶ RECORDED ─▶ ACKED
//!     │                     │                 │              │
//!     └── MalformedEvent ───┴─ Unregistered ──┤              │
//!                REJECTED ─▶ ACKED            └─ Storage ────┴─ Store ─▶ FAILED ─▶ RETRY
//! ```
//!
//! The metadata insert is only attempted once the image write has returned
//! success. A failed insert after a successful write leaves an orphaned
//! object; it is overwritten in place when the message is redelivered.

use crate::error::{IngestError, RegistryError, StorageError, StoreError};
use crate::event::{normalize, EventRecord, TimestampSource};
use crate::event_store::EventSink;
use crate::object_store::{image_key, ObjectStore, IMAGE_CONTENT_TYPE};
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Upper bound for each network call of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub registry: Duration,
    pub object: Duration,
    pub metadata: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            registry: Duration::from_secs(2),
            object: Duration::from_secs(15),
            metadata: Duration::from_secs(10),
        }
    }
}

/// An event that reached the analytics store
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub camera_id: String,
    pub timestamp: String,
    pub image_path: String,
    pub image_bytes: usize,
}

/// Drives normalize → gate → store → record for one message at a time
pub struct IngestionCoordinator {
    registry: Arc<dyn DeviceRegistry>,
    objects: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
    timeouts: StepTimeouts,
}

impl IngestionCoordinator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        objects: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        timeouts: StepTimeouts,
    ) -> Self {
        Self {
            registry,
            objects,
            events,
            timeouts,
        }
    }

    /// Run one message through the pipeline.
    ///
    /// Every outcome other than `Ok` is logged and counted here; the caller
    /// only decides between acknowledging and redelivering via
    /// [`IngestError::disposition`].
    #[instrument(skip(self, message), fields(size_bytes = message.len()))]
    pub async fn process(
        &self,
        message: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<RecordedEvent, IngestError> {
        metrics::counter!("ingest.events.received").increment(1);
        let started = Instant::now();

        let result = self.run_steps(message, received_at).await;

        match &result {
            Ok(recorded) => {
                metrics::counter!("ingest.events.recorded").increment(1);
                metrics::counter!("ingest.image.bytes").increment(recorded.image_bytes as u64);
                metrics::histogram!("ingest.event.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
            }
            Err(err) => {
                let reason = err.reason();
                let stage = err.stage().as_str();
                match err.disposition() {
                    crate::error::Disposition::Reject => {
                        metrics::counter!("ingest.events.rejected", "reason" => reason)
                            .increment(1);
                    }
                    crate::error::Disposition::Retry => {
                        metrics::counter!("ingest.events.failed", "stage" => stage).increment(1);
                    }
                }
            }
        }

        result
    }

    async fn run_steps(
        &self,
        message: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<RecordedEvent, IngestError> {
        // RECEIVED -> NORMALIZED
        let event = normalize(message, received_at).map_err(|e| {
            warn!(error = %e, reason = "malformed", "Event rejected");
            IngestError::from(e)
        })?;

        let timestamp = event.timestamp.to_store_string();

        if event.timestamp.source == TimestampSource::ReceivedAt {
            debug!(
                camera_id = %event.camera_id,
                timestamp = %timestamp,
                "Event timestamp missing or unparseable, using processing time"
            );
        }

        debug!(
            camera_id = %event.camera_id,
            producer_event_id = ?event.producer_event_id,
            timestamp = %timestamp,
            image_bytes = event.image.len(),
            "Event normalized"
        );

        // NORMALIZED -> GATED
        let registered = with_timeout(
            self.timeouts.registry,
            self.registry.is_registered(&event.camera_id),
            RegistryError::Timeout,
        )
        .await
        .map_err(|source| {
            error!(
                camera_id = %event.camera_id,
                timestamp = %timestamp,
                error = %source,
                "Registry lookup failed"
            );
            IngestError::Registry {
                camera_id: event.camera_id.clone(),
                source,
            }
        })?;

        if !registered {
            warn!(
                camera_id = %event.camera_id,
                timestamp = %timestamp,
                producer_event_id = ?event.producer_event_id,
                reason = "unregistered_device",
                "Event rejected"
            );
            return Err(IngestError::UnregisteredDevice {
                camera_id: event.camera_id,
            });
        }

        // GATED -> STORED
        let key = image_key(&event.camera_id, &event.timestamp);
        let image_bytes = event.image.len();

        with_timeout(
            self.timeouts.object,
            self.objects.put(&key, event.image, IMAGE_CONTENT_TYPE),
            StorageError::Timeout,
        )
        .await
        .map_err(|source| {
            error!(
                camera_id = %event.camera_id,
                timestamp = %timestamp,
                key = %key,
                error = %source,
                "Image upload failed"
            );
            IngestError::Storage {
                key: key.clone(),
                source,
            }
        })?;

        // STORED -> RECORDED
        let record = EventRecord::new(
            event.camera_id,
            &event.timestamp,
            event.confidence,
            key,
            event.payload,
        );

        with_timeout(
            self.timeouts.metadata,
            self.events.insert(&record),
            StoreError::Timeout,
        )
        .await
        .map_err(|source| {
            // The image is already durable; it stays orphaned until redelivery
            error!(
                camera_id = %record.camera_id,
                timestamp = %record.timestamp,
                image_path = %record.image_path,
                error = %source,
                "Event record insert failed"
            );
            IngestError::Store {
                camera_id: record.camera_id.clone(),
                timestamp: record.timestamp.clone(),
                source,
            }
        })?;

        info!(
            camera_id = %record.camera_id,
            timestamp = %record.timestamp,
            image_path = %record.image_path,
            image_bytes,
            "Event recorded"
        );

        Ok(RecordedEvent {
            camera_id: record.camera_id,
            timestamp: record.timestamp,
            image_path: record.image_path,
            image_bytes,
        })
    }
}

/// Treat an elapsed deadline like any other transport error
async fn with_timeout<T, E, F>(
    limit: Duration,
    future: F,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Disposition, MalformedEvent, Stage};
    use crate::event_store::MockEventSink;
    use crate::object_store::{BucketStatus, MockObjectStore};
    use crate::registry::MockDeviceRegistry;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use mockall::Sequence;

    const CAM_1_EVENT: &str = r#"{"deviceId":"CAM-1","timestamp":"2024-01-01T00:00:00Z","image":{"base64":"Zm9v"},"confidence":0.9}"#;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn coordinator(
        registry: MockDeviceRegistry,
        objects: MockObjectStore,
        events: MockEventSink,
    ) -> IngestionCoordinator {
        IngestionCoordinator::new(
            Arc::new(registry),
            Arc::new(objects),
            Arc::new(events),
            StepTimeouts::default(),
        )
    }

    fn registered(camera: &'static str) -> MockDeviceRegistry {
        let mut registry = MockDeviceRegistry::new();
        registry
            .expect_is_registered()
            .with(eq(camera))
            .times(1)
            .returning(|_| Ok(true));
        registry
    }

    #[tokio::test]
    async fn test_registered_event_is_stored_then_recorded() {
        let mut seq = Sequence::new();
        let mut objects = MockObjectStore::new();
        let mut events = MockEventSink::new();

        objects
            .expect_put()
            .withf(|key, body, content_type| {
                key == "CAM-1/2024-01-01 00:00:00.jpg" && body == b"foo" && content_type == "image/jpeg"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        events
            .expect_insert()
            .withf(|record| {
                record.event_id == "2024-01-01 00:00:00"
                    && record.camera_id == "CAM-1"
                    && record.timestamp == "2024-01-01 00:00:00"
                    && record.confidence == 0.9
                    && record.image_path == "CAM-1/2024-01-01 00:00:00.jpg"
                    && record.payload == CAM_1_EVENT
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let recorded = coordinator(registered("CAM-1"), objects, events)
            .process(CAM_1_EVENT.as_bytes(), received_at())
            .await
            .unwrap();

        assert_eq!(recorded.image_path, "CAM-1/2024-01-01 00:00:00.jpg");
        assert_eq!(recorded.image_bytes, 3);
    }

    #[tokio::test]
    async fn test_unregistered_device_writes_nothing() {
        let mut registry = MockDeviceRegistry::new();
        registry.expect_is_registered().returning(|_| Ok(false));

        let mut objects = MockObjectStore::new();
        objects.expect_put().never();
        let mut events = MockEventSink::new();
        events.expect_insert().never();

        let err = coordinator(registry, objects, events)
            .process(CAM_1_EVENT.as_bytes(), received_at())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::UnregisteredDevice { ref camera_id } if camera_id == "CAM-1"));
        assert_eq!(err.disposition(), Disposition::Reject);
    }

    #[tokio::test]
    async fn test_malformed_event_skips_registry() {
        let mut registry = MockDeviceRegistry::new();
        registry.expect_is_registered().never();
        let mut objects = MockObjectStore::new();
        objects.expect_put().never();
        let mut events = MockEventSink::new();
        events.expect_insert().never();

        let err = coordinator(registry, objects, events)
            .process(br#"{"deviceId":"CAM-1","confidence":0.4}"#, received_at())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Malformed(MalformedEvent::MissingImage)));
        assert_eq!(err.disposition(), Disposition::Reject);
    }

    #[tokio::test]
    async fn test_object_store_failure_prevents_metadata_write() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().times(1).returning(|_, _, _| {
            Err(StorageError::Request {
                operation: "put_object",
                message: "connection reset by peer".to_string(),
            })
        });
        let mut events = MockEventSink::new();
        events.expect_insert().never();

        let err = coordinator(registered("CAM-1"), objects, events)
            .process(CAM_1_EVENT.as_bytes(), received_at())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Store);
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    /// Accepts the write but never finishes it
    struct StalledObjectStore;

    #[async_trait::async_trait]
    impl ObjectStore for StalledObjectStore {
        async fn put(&self, _key: &str, _body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn ensure_bucket(&self) -> Result<BucketStatus, StorageError> {
            Ok(BucketStatus::Created)
        }
    }

    #[tokio::test]
    async fn test_stalled_object_write_times_out_before_metadata() {
        let mut events = MockEventSink::new();
        events.expect_insert().never();

        let coordinator = IngestionCoordinator::new(
            Arc::new(registered("CAM-1")),
            Arc::new(StalledObjectStore),
            Arc::new(events),
            StepTimeouts {
                registry: Duration::from_secs(1),
                object: Duration::from_millis(20),
                metadata: Duration::from_secs(1),
            },
        );

        let err = coordinator
            .process(CAM_1_EVENT.as_bytes(), received_at())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Storage {
                source: StorageError::Timeout(_),
                ..
            }
        ));
        assert_eq!(err.stage(), Stage::Store);
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_retried() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().times(1).returning(|_, _, _| Ok(()));
        let mut events = MockEventSink::new();
        events.expect_insert().times(1).returning(|_| {
            Err(StoreError::Rejected {
                status: 503,
                body: "Service Unavailable".to_string(),
            })
        });

        let err = coordinator(registered("CAM-1"), objects, events)
            .process(CAM_1_EVENT.as_bytes(), received_at())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Record);
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    #[tokio::test]
    async fn test_registry_failure_is_retried() {
        let mut registry = MockDeviceRegistry::new();
        registry
            .expect_is_registered()
            .returning(|_| Err(RegistryError::Timeout(Duration::from_secs(2))));
        let mut objects = MockObjectStore::new();
        objects.expect_put().never();
        let mut events = MockEventSink::new();
        events.expect_insert().never();

        let err = coordinator(registry, objects, events)
            .process(CAM_1_EVENT.as_bytes(), received_at())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Gate);
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_deadline() {
        let result: Result<(), StorageError> = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            StorageError::Timeout,
        )
        .await;

        assert!(matches!(result, Err(StorageError::Timeout(d)) if d == Duration::from_millis(10)));
    }
}
