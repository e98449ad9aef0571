use crate::config::RegistryConfig;
use crate::error::RegistryError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

/// Read-only view of the device registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Whether `camera_id` belongs to a registered device
    async fn is_registered(&self, camera_id: &str) -> Result<bool, RegistryError>;
}

/// Device registry backed by the `cameras` table in PostgreSQL.
///
/// The table is owned by the registry API; this service only reads it.
pub struct PostgresDeviceRegistry {
    pool: PgPool,
}

impl PostgresDeviceRegistry {
    /// Connect to the registry database
    pub async fn new(config: &RegistryConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to device registry")?;

        info!("Connected to device registry");

        Ok(Self { pool })
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DeviceRegistry for PostgresDeviceRegistry {
    #[instrument(skip(self))]
    async fn is_registered(&self, camera_id: &str) -> Result<bool, RegistryError> {
        let registered: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cameras WHERE camera_id = $1)")
                .bind(camera_id)
                .fetch_one(&self.pool)
                .await?;

        debug!(camera_id = %camera_id, registered, "Registry lookup");

        Ok(registered)
    }
}
