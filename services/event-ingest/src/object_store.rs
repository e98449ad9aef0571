use crate::config::S3Config;
use crate::error::StorageError;
use crate::event::EventTimestamp;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Content type of every stored event image
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Region in which S3 rejects an explicit location constraint
const DEFAULT_REGION: &str = "us-east-1";

/// Outcome of an idempotent bucket creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Created,
    AlreadyOwned,
}

/// Keyed blob storage for event images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, replacing any existing object
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Create the destination bucket; an existing bucket we own is success
    async fn ensure_bucket(&self) -> Result<BucketStatus, StorageError>;
}

/// Object key of an event image: `{camera_id}/{YYYY-MM-DD HH:MM:SS}.jpg`
///
/// Deterministic so that a redelivered event overwrites its own image.
pub fn image_key(camera_id: &str, timestamp: &EventTimestamp) -> String {
    format!(
        "{}/{}.jpg",
        sanitize_path_component(camera_id),
        timestamp.to_store_string()
    )
}

/// S3-compatible object store (AWS S3 or MinIO)
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    /// Create a new S3 client for the configured bucket
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "event-ingest-static",
            ));
        }

        let aws_config = loader.load().await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "Object store client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Time-limited GET URL for a stored image
    pub async fn presigned_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<(String, DateTime<Utc>)> {
        let presigning_config =
            PresigningConfig::expires_in(expires_in).context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(expires_in).context("Presigned URL expiry out of range")?;

        Ok((presigned.uri().to_string(), expires_at))
    }

    /// Single-part upload for small images
    async fn simple_upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| request_error("put_object", e))?;

        Ok(())
    }

    /// Multipart upload for large images; aborted on any part failure
    async fn multipart_upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| request_error("create_multipart_upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Request {
                operation: "create_multipart_upload",
                message: "no upload id in response".to_string(),
            })?
            .to_string();

        match self.upload_parts(key, &upload_id, &body).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| request_error("complete_multipart_upload", e))?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &[u8],
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| request_error("upload_part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        debug!(key = %key, "Uploading image");

        if body.len() > self.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await
        } else {
            self.simple_upload(key, body, content_type).await
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn ensure_bucket(&self) -> Result<BucketStatus, StorageError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);

        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(BucketStatus::Created),
            Err(err) => match err.as_service_error() {
                Some(service_err) if service_err.is_bucket_already_owned_by_you() => {
                    Ok(BucketStatus::AlreadyOwned)
                }
                Some(service_err) if service_err.is_bucket_already_exists() => {
                    Err(StorageError::BucketOwnedElsewhere(self.bucket.clone()))
                }
                _ => Err(request_error("create_bucket", err)),
            },
        }
    }
}

fn request_error<E>(operation: &'static str, err: E) -> StorageError
where
    E: std::error::Error + 'static,
{
    StorageError::Request {
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}

/// Keep a key component inside its own path segment
fn sanitize_path_component(component: &str) -> String {
    if component == "." || component == ".." {
        return "_".repeat(component.len());
    }

    component
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
