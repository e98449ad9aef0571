//! Aeolus Event Ingest Service
//!
//! Ingestion service for detection events produced by registered cameras.
//! Each event read from Kafka is normalized, checked against the device
//! registry, its image written to S3-compatible storage, and a metadata row
//! appended to the ClickHouse analytics store.
//!
//! ## Guarantees
//!
//! - **Ordered writes**: the metadata row is only inserted after the image
//!   write succeeded, so no row ever points at a missing image
//! - **At-least-once**: offsets are committed only for recorded, rejected or
//!   dead-lettered messages; transient failures are redelivered
//! - **Idempotent images**: image keys are derived from camera and event
//!   time, so redelivery overwrites rather than duplicates
//! - **Bounded retries**: a message that keeps failing is parked on a
//!   dead-letter topic instead of blocking its partition
//!
//! ## Architecture
//!
//! ```text
//! Kafka                                                        Kafka
//! ┌──────────────┐     ┌──────────────┐     ┌─────────────┐    ┌──────────────┐
//! │ device-      │────▶│ Event        │────▶│ Delivery    │───▶│ device-      │
//! │ events       │◀─┐  │ Consumer     │     │ Settler     │    │ events.dlq   │
//! └──────────────┘  │  └──────────────┘     └─────────────┘    └──────────────┘
//!                   │         │                    │
//!                   └─ seek ──┼──── commit ◀───────┘
//!                             ▼
//!                      ┌──────────────┐     PostgreSQL
//!                      │ Ingestion    │────▶ cameras (registry gate)
//!                      │ Coordinator  │
//!                      └──────────────┘     S3 / MinIO
//!                             ├───────────▶ {camera}/{timestamp}.jpg
//!                             │
//!                             │             ClickHouse
//!                             └───────────▶ events (append-only)
//!                                                 ▲
//!                                          ┌──────────────┐
//!                                          │ Event API    │
//!                                          └──────────────┘
//! ```

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod event;
pub mod event_store;
pub mod kafka_consumer;
pub mod object_store;
pub mod registry;

pub use bootstrap::ensure_bucket_exists;
pub use config::Config;
pub use coordinator::{IngestionCoordinator, RecordedEvent, StepTimeouts};
pub use dead_letter::{DeadLetter, DeadLetterSink, KafkaDeadLetterSink};
pub use delivery::{Delivery, DeliverySettler, DeliveryTracker, RetryDecision, Settlement};
pub use error::{Disposition, FatalInitError, IngestError, MalformedEvent, Stage};
pub use event::{normalize, EventRecord, EventTimestamp, NormalizedEvent, TimestampSource};
pub use event_store::{ClickHouseEventStore, EventQuery, EventSink};
pub use kafka_consumer::{EventConsumer, RebalanceContext};
pub use object_store::{image_key, BucketStatus, ObjectStore, S3ObjectStore};
pub use registry::{DeviceRegistry, PostgresDeviceRegistry};
