use aeolus_event_ingest::bootstrap::ensure_bucket_exists;
use aeolus_event_ingest::config::BootstrapConfig;
use aeolus_event_ingest::error::{DeadLetterError, RegistryError, StorageError, StoreError};
use aeolus_event_ingest::{
    BucketStatus, DeadLetter, DeadLetterSink, Delivery, DeliverySettler, DeliveryTracker,
    DeviceRegistry, Disposition, EventRecord, EventSink, IngestError, IngestionCoordinator,
    ObjectStore, Settlement, StepTimeouts,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAM_1_EVENT: &str = r#"{"deviceId":"CAM-1","timestamp":"2024-01-01T00:00:00Z","image":{"base64":"Zm9v"},"confidence":0.9}"#;

// In-memory collaborators sharing one write log so ordering can be asserted
mod fakes {
    use super::*;

    pub type WriteLog = Arc<Mutex<Vec<String>>>;

    pub struct InMemoryRegistry {
        cameras: HashSet<String>,
        pub lookups: AtomicU32,
    }

    impl InMemoryRegistry {
        pub fn with(cameras: &[&str]) -> Self {
            Self {
                cameras: cameras.iter().map(|c| c.to_string()).collect(),
                lookups: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceRegistry for InMemoryRegistry {
        async fn is_registered(&self, camera_id: &str) -> Result<bool, RegistryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.cameras.contains(camera_id))
        }
    }

    pub struct InMemoryObjectStore {
        pub objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
        pub puts: AtomicU32,
        pub failing: AtomicBool,
        log: WriteLog,
    }

    impl InMemoryObjectStore {
        pub fn new(log: WriteLog) -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                puts: AtomicU32::new(0),
                failing: AtomicBool::new(false),
                log,
            }
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            content_type: &str,
        ) -> Result<(), StorageError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Request {
                    operation: "put_object",
                    message: "connection reset by peer".to_string(),
                });
            }
            self.log.lock().unwrap().push(format!("put {key}"));
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body, content_type.to_string()));
            Ok(())
        }

        async fn ensure_bucket(&self) -> Result<BucketStatus, StorageError> {
            Ok(BucketStatus::AlreadyOwned)
        }
    }

    pub struct InMemoryEventSink {
        pub rows: Mutex<Vec<EventRecord>>,
        pub failing: AtomicBool,
        log: WriteLog,
    }

    impl InMemoryEventSink {
        pub fn new(log: WriteLog) -> Self {
            Self {
                rows: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                log,
            }
        }
    }

    #[async_trait]
    impl EventSink for InMemoryEventSink {
        async fn insert(&self, record: &EventRecord) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected {
                    status: 503,
                    body: "Service Unavailable".to_string(),
                });
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("insert {}", record.image_path));
            self.rows.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingDeadLetterSink {
        pub letters: Mutex<Vec<DeadLetter>>,
        pub failing: AtomicBool,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingDeadLetterSink {
        async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeadLetterError::Publish {
                    topic: "device-events.dlq".to_string(),
                    message: "broker unavailable".to_string(),
                });
            }
            self.letters.lock().unwrap().push(letter.clone());
            Ok(())
        }
    }

    /// Object store that never finishes a bucket request in time
    pub struct StalledObjectStore {
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for StalledObjectStore {
        async fn put(&self, _: &str, _: Vec<u8>, _: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn ensure_bucket(&self) -> Result<BucketStatus, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(BucketStatus::Created)
        }
    }
}

use fakes::*;

struct Harness {
    registry: Arc<InMemoryRegistry>,
    objects: Arc<InMemoryObjectStore>,
    events: Arc<InMemoryEventSink>,
    log: WriteLog,
    coordinator: IngestionCoordinator,
}

fn harness(cameras: &[&str]) -> Harness {
    let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(InMemoryRegistry::with(cameras));
    let objects = Arc::new(InMemoryObjectStore::new(log.clone()));
    let events = Arc::new(InMemoryEventSink::new(log.clone()));

    let coordinator = IngestionCoordinator::new(
        registry.clone(),
        objects.clone(),
        events.clone(),
        StepTimeouts::default(),
    );

    Harness {
        registry,
        objects,
        events,
        log,
        coordinator,
    }
}

fn received_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn event_with(camera: &str, timestamp: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "deviceId": camera,
        "timestamp": timestamp,
        "image": { "base64": "Zm9v" },
        "confidence": 0.5
    }))
    .unwrap()
}

#[tokio::test]
async fn test_registered_event_produces_one_object_and_one_row() {
    let h = harness(&["CAM-1"]);

    let recorded = h
        .coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at())
        .await
        .unwrap();

    assert_eq!(recorded.image_path, "CAM-1/2024-01-01 00:00:00.jpg");

    let objects = h.objects.objects.lock().unwrap();
    assert_eq!(objects.len(), 1);
    let (body, content_type) = &objects["CAM-1/2024-01-01 00:00:00.jpg"];
    assert_eq!(body.as_slice(), b"foo");
    assert_eq!(content_type, "image/jpeg");

    let rows = h.events.rows.lock().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].camera_id, "CAM-1");
    assert_eq!(rows[0].timestamp, "2024-01-01 00:00:00");
    assert_eq!(rows[0].confidence, 0.9);
    assert_eq!(rows[0].image_path, "CAM-1/2024-01-01 00:00:00.jpg");
    assert!(objects.contains_key(&rows[0].image_path));
    assert_eq!(rows[0].payload, CAM_1_EVENT);

    assert_eq!(
        *h.log.lock().unwrap(),
        vec![
            "put CAM-1/2024-01-01 00:00:00.jpg".to_string(),
            "insert CAM-1/2024-01-01 00:00:00.jpg".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unregistered_camera_is_acknowledged_without_writes() {
    let h = harness(&["CAM-2"]);

    let err = h
        .coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::UnregisteredDevice { .. }));
    assert_eq!(err.disposition(), Disposition::Reject);
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 0);
    assert!(h.events.rows.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_image_creates_nothing() {
    let h = harness(&["CAM-1"]);

    for message in [
        r#"{"deviceId":"CAM-1","timestamp":"2024-01-01T00:00:00Z","confidence":0.9}"#,
        r#"{"deviceId":"CAM-1","image":{},"confidence":0.9}"#,
    ] {
        let err = h
            .coordinator
            .process(message.as_bytes(), received_at())
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::Reject);
    }

    assert_eq!(h.registry.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 0);
    assert!(h.events.rows.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_object_store_failure_leaves_message_unacknowledged() {
    let h = harness(&["CAM-1"]);
    h.objects.failing.store(true, Ordering::SeqCst);

    let err = h
        .coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at())
        .await
        .unwrap_err();

    assert_eq!(err.disposition(), Disposition::Retry);
    assert!(h.events.rows.lock().unwrap().is_empty());
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_redelivery_overwrites_same_object() {
    let h = harness(&["CAM-1"]);

    let first = h
        .coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at())
        .await
        .unwrap();
    let second = h
        .coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at() + chrono::Duration::minutes(5))
        .await
        .unwrap();

    assert_eq!(first.image_path, second.image_path);
    assert_eq!(h.objects.objects.lock().unwrap().len(), 1);

    let rows = h.events.rows.lock().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        (&rows[0].camera_id, &rows[0].timestamp),
        (&rows[1].camera_id, &rows[1].timestamp)
    );
}

#[tokio::test]
async fn test_metadata_failure_after_upload_recovers_on_redelivery() {
    let h = harness(&["CAM-1"]);
    h.events.failing.store(true, Ordering::SeqCst);

    let err = h
        .coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at())
        .await
        .unwrap_err();
    assert_eq!(err.disposition(), Disposition::Retry);
    assert_eq!(h.objects.objects.lock().unwrap().len(), 1);

    h.events.failing.store(false, Ordering::SeqCst);
    h.coordinator
        .process(CAM_1_EVENT.as_bytes(), received_at())
        .await
        .unwrap();

    assert_eq!(h.objects.objects.lock().unwrap().len(), 1);
    assert_eq!(h.events.rows.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_epoch_seconds_and_millis_share_a_key() {
    let h = harness(&["CAM-1"]);

    let seconds = h
        .coordinator
        .process(&event_with("CAM-1", serde_json::json!(1700000000)), received_at())
        .await
        .unwrap();
    let millis = h
        .coordinator
        .process(
            &event_with("CAM-1", serde_json::json!(1700000000000u64)),
            received_at(),
        )
        .await
        .unwrap();

    assert_eq!(seconds.timestamp, "2023-11-14 22:13:20");
    assert_eq!(seconds.timestamp, millis.timestamp);
    assert_eq!(seconds.image_path, millis.image_path);
}

#[tokio::test]
async fn test_poison_message_is_dead_lettered_after_bounded_retries() {
    let h = harness(&["CAM-1"]);
    h.objects.failing.store(true, Ordering::SeqCst);

    let sink = Arc::new(RecordingDeadLetterSink::default());
    let mut settler = DeliverySettler::new(
        DeliveryTracker::new(3, Duration::from_millis(10), Duration::from_millis(100)),
        sink.clone(),
    );

    let delivery = Delivery {
        topic: "device-events",
        partition: 2,
        offset: 41,
        payload: CAM_1_EVENT.as_bytes(),
    };

    let mut settlements = Vec::new();
    for _ in 0..3 {
        let outcome = h.coordinator.process(delivery.payload, received_at()).await;
        settlements.push(settler.settle(&delivery, &outcome).await);
    }

    assert_eq!(
        settlements,
        vec![
            Settlement::Redeliver {
                backoff: Duration::from_millis(10)
            },
            Settlement::Redeliver {
                backoff: Duration::from_millis(20)
            },
            Settlement::Commit,
        ]
    );

    let letters = sink.letters.lock().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].partition, 2);
    assert_eq!(letters[0].offset, 41);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].stage, "store");
    assert_eq!(letters[0].payload, CAM_1_EVENT.as_bytes());
    assert!(h.events.rows.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unpublishable_dead_letter_is_not_committed() {
    let h = harness(&["CAM-1"]);
    h.objects.failing.store(true, Ordering::SeqCst);

    let sink = Arc::new(RecordingDeadLetterSink::default());
    sink.failing.store(true, Ordering::SeqCst);
    let mut settler = DeliverySettler::new(
        DeliveryTracker::new(1, Duration::from_millis(10), Duration::from_millis(100)),
        sink.clone(),
    );

    let delivery = Delivery {
        topic: "device-events",
        partition: 0,
        offset: 7,
        payload: CAM_1_EVENT.as_bytes(),
    };

    let outcome = h.coordinator.process(delivery.payload, received_at()).await;
    assert!(matches!(
        settler.settle(&delivery, &outcome).await,
        Settlement::Redeliver { .. }
    ));
    assert!(sink.letters.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejections_and_successes_are_committed() {
    let h = harness(&["CAM-1"]);
    let sink = Arc::new(RecordingDeadLetterSink::default());
    let mut settler = DeliverySettler::new(
        DeliveryTracker::new(3, Duration::from_millis(10), Duration::from_millis(100)),
        sink.clone(),
    );

    let unregistered = event_with("CAM-9", serde_json::json!("2024-01-01T00:00:00Z"));
    for (offset, payload) in [
        (1, CAM_1_EVENT.as_bytes()),
        (2, unregistered.as_slice()),
        (3, b"not json".as_slice()),
    ] {
        let delivery = Delivery {
            topic: "device-events",
            partition: 0,
            offset,
            payload,
        };
        let outcome = h.coordinator.process(payload, received_at()).await;
        assert_eq!(settler.settle(&delivery, &outcome).await, Settlement::Commit);
    }

    assert!(sink.letters.lock().unwrap().is_empty());
    assert_eq!(h.events.rows.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bucket_initializer_gives_up_on_stalled_store() {
    let store = StalledObjectStore {
        calls: AtomicU32::new(0),
    };
    let config = BootstrapConfig {
        bucket_attempts: 3,
        bucket_retry_delay_ms: 1,
        bucket_attempt_timeout_ms: 20,
    };

    let err = ensure_bucket_exists(&store, "events", &config)
        .await
        .unwrap_err();

    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert!(err.to_string().contains("after 3 attempts"));
}

#[tokio::test]
async fn test_bucket_initializer_accepts_existing_bucket() {
    let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let store = InMemoryObjectStore::new(log);

    let status = ensure_bucket_exists(&store, "events", &BootstrapConfig::default())
        .await
        .unwrap();

    assert_eq!(status, BucketStatus::AlreadyOwned);
}
