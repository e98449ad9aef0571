use anyhow::{bail, ensure};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the event ingestion service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Object storage configuration
    pub s3: S3Config,
    /// Device registry configuration
    pub registry: RegistryConfig,
    /// Analytics store configuration
    pub analytics: AnalyticsConfig,
    /// Per-event pipeline policy
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Startup resource checks
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    /// Read-side API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Client ID reported to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying device events
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    /// Topic receiving messages that exhausted their delivery attempts
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Dead-letter produce timeout in milliseconds
    #[serde(default = "default_produce_timeout_ms")]
    pub produce_timeout_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding event images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key; the default AWS credential chain is used when unset
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Device registry (PostgreSQL) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Analytics store (ClickHouse HTTP interface) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    /// Base URL, e.g. http://localhost:8123
    pub url: String,
    /// Database holding the events table
    #[serde(default = "default_database")]
    pub database: String,
    /// Events table
    #[serde(default = "default_events_table")]
    pub table: String,
    #[serde(default = "default_analytics_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// HTTP request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Per-event timeouts and redelivery policy
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Registry lookup timeout in milliseconds
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,
    /// Image upload timeout in milliseconds
    #[serde(default = "default_object_timeout_ms")]
    pub object_timeout_ms: u64,
    /// Metadata insert timeout in milliseconds
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    /// Deliveries of one message before it is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Backoff before the first redelivery in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on the redelivery backoff in milliseconds
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
}

/// Destination checks run before consuming
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Bucket creation attempts
    #[serde(default = "default_bucket_attempts")]
    pub bucket_attempts: u32,
    /// Delay between bucket creation attempts in milliseconds
    #[serde(default = "default_bucket_retry_delay_ms")]
    pub bucket_retry_delay_ms: u64,
    /// Timeout of a single bucket creation attempt in milliseconds
    #[serde(default = "default_bucket_attempt_timeout_ms")]
    pub bucket_attempt_timeout_ms: u64,
}

/// API configuration for the read-side endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the read-side API alongside the consumer
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "event-ingest".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_client_id() -> String {
    "aeolus-app".to_string()
}

fn default_consumer_group() -> String {
    "aeolus-group".to_string()
}

fn default_events_topic() -> String {
    "device-events".to_string()
}

fn default_dead_letter_topic() -> String {
    "device-events.dlq".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_produce_timeout_ms() -> u64 {
    10000
}

fn default_bucket() -> String {
    "events".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    300
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_database() -> String {
    "default".to_string()
}

fn default_events_table() -> String {
    "events".to_string()
}

fn default_analytics_username() -> String {
    "default".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_registry_timeout_ms() -> u64 {
    2000
}

fn default_object_timeout_ms() -> u64 {
    15000
}

fn default_metadata_timeout_ms() -> u64 {
    10000
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    30000
}

fn default_bucket_attempts() -> u32 {
    10
}

fn default_bucket_retry_delay_ms() -> u64 {
    3000
}

fn default_bucket_attempt_timeout_ms() -> u64 {
    10000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "event-ingest")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/event-ingest").required(false))
            .add_source(config::File::with_name("/etc/aeolus/event-ingest").required(false))
            // Override with environment variables
            // INGEST__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.s3.bucket.trim().is_empty(), "s3.bucket must not be empty");
        ensure!(
            self.s3.part_size_bytes >= 5 * 1024 * 1024,
            "s3.part_size_bytes must be at least 5MB"
        );
        ensure!(
            self.ingest.max_delivery_attempts >= 1,
            "ingest.max_delivery_attempts must be at least 1"
        );
        ensure!(
            self.bootstrap.bucket_attempts >= 1,
            "bootstrap.bucket_attempts must be at least 1"
        );
        for (key, value) in [
            ("analytics.table", &self.analytics.table),
            ("analytics.database", &self.analytics.database),
        ] {
            if !is_identifier(value) {
                bail!("{key} must be a plain identifier, got {value:?}");
            }
        }
        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }
}

impl RegistryConfig {
    /// Get pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get pool idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl IngestConfig {
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_millis(self.object_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }
}

impl BootstrapConfig {
    pub fn bucket_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bucket_retry_delay_ms)
    }

    pub fn bucket_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.bucket_attempt_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            registry_timeout_ms: default_registry_timeout_ms(),
            object_timeout_ms: default_object_timeout_ms(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bucket_attempts: default_bucket_attempts(),
            bucket_retry_delay_ms: default_bucket_retry_delay_ms(),
            bucket_attempt_timeout_ms: default_bucket_attempt_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !value.starts_with(|c: char| c.is_ascii_digit())
}
