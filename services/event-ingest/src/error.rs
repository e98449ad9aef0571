use std::time::Duration;
use thiserror::Error;

/// Why an inbound message could not be turned into an event
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedEvent {
    #[error("message is not a valid device event: {0}")]
    InvalidDocument(String),

    #[error("event has no image.base64")]
    MissingImage,

    #[error("image.base64 is not valid base64: {0}")]
    InvalidImage(String),
}

/// Errors from the device registry lookup
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("registry lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the object store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store {operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("bucket {0} exists but is owned by another account")]
    BucketOwnedElsewhere(String),

    #[error("object store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the analytics store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("analytics store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("analytics store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to encode event record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("analytics store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the dead-letter sink
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to publish dead letter to {topic}: {message}")]
    Publish { topic: String, message: String },
}

/// Pipeline step an event was in when it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Gate,
    Store,
    Record,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Gate => "gate",
            Stage::Store => "store",
            Stage::Record => "record",
        }
    }
}

/// What the consumer should do with the message after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; redelivery can never succeed
    Reject,
    /// Leave unacknowledged for redelivery
    Retry,
}

/// Per-event pipeline failure
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),

    #[error("device {camera_id} is not registered")]
    UnregisteredDevice { camera_id: String },

    #[error("registry lookup for {camera_id} failed: {source}")]
    Registry {
        camera_id: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to store image {key}: {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to record event {camera_id}@{timestamp}: {source}")]
    Store {
        camera_id: String,
        timestamp: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn disposition(&self) -> Disposition {
        match self {
            IngestError::Malformed(_) | IngestError::UnregisteredDevice { .. } => {
                Disposition::Reject
            }
            IngestError::Registry { .. }
            | IngestError::Storage { .. }
            | IngestError::Store { .. } => Disposition::Retry,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            IngestError::Malformed(_) => Stage::Normalize,
            IngestError::UnregisteredDevice { .. } | IngestError::Registry { .. } => Stage::Gate,
            IngestError::Storage { .. } => Stage::Store,
            IngestError::Store { .. } => Stage::Record,
        }
    }

    /// Short label used for rejection metrics
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::Malformed(MalformedEvent::InvalidDocument(_)) => "invalid_document",
            IngestError::Malformed(MalformedEvent::MissingImage) => "missing_image",
            IngestError::Malformed(MalformedEvent::InvalidImage(_)) => "invalid_image",
            IngestError::UnregisteredDevice { .. } => "unregistered_device",
            IngestError::Registry { .. } => "registry_unavailable",
            IngestError::Storage { .. } => "object_store_unavailable",
            IngestError::Store { .. } => "analytics_store_unavailable",
        }
    }
}

/// Startup failure that must stop the process
#[derive(Error, Debug)]
pub enum FatalInitError {
    #[error("bucket {bucket} unavailable after {attempts} attempts: {last_error}")]
    BucketUnavailable {
        bucket: String,
        attempts: u32,
        last_error: String,
    },
}
