use crate::config::BootstrapConfig;
use crate::error::{FatalInitError, StorageError};
use crate::object_store::{BucketStatus, ObjectStore};
use tracing::{info, instrument, warn};

/// Make sure the image bucket exists before any event is consumed.
///
/// Retries up to `bucket_attempts` times with a fixed delay. A bucket that
/// exists under another account is fatal straight away since no number of
/// retries will make it writable.
#[instrument(skip(store, config))]
pub async fn ensure_bucket_exists(
    store: &dyn ObjectStore,
    bucket: &str,
    config: &BootstrapConfig,
) -> Result<BucketStatus, FatalInitError> {
    let attempts = config.bucket_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(
            config.bucket_attempt_timeout(),
            store.ensure_bucket(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(config.bucket_attempt_timeout())),
        };

        match result {
            Ok(status) => {
                info!(bucket = %bucket, ?status, attempt, "Image bucket ready");
                return Ok(status);
            }
            Err(StorageError::BucketOwnedElsewhere(_)) => {
                return Err(FatalInitError::BucketUnavailable {
                    bucket: bucket.to_string(),
                    attempts: attempt,
                    last_error: "bucket name is owned by another account".to_string(),
                });
            }
            Err(e) => {
                warn!(
                    bucket = %bucket,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Bucket not ready"
                );
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(config.bucket_retry_delay()).await;
        }
    }

    Err(FatalInitError::BucketUnavailable {
        bucket: bucket.to_string(),
        attempts,
        last_error,
    })
}
