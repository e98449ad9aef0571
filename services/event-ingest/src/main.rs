use aeolus_event_ingest::api::{start_api_server, AppState};
use aeolus_event_ingest::{
    ensure_bucket_exists, ClickHouseEventStore, Config, DeliverySettler, DeliveryTracker,
    EventConsumer, IngestionCoordinator, KafkaDeadLetterSink, PostgresDeviceRegistry,
    S3ObjectStore, StepTimeouts,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        topic = %config.kafka.events_topic,
        bucket = %config.s3.bucket,
        "Starting Aeolus event ingest service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // The bucket must exist before any event is consumed
    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    if let Err(e) =
        ensure_bucket_exists(object_store.as_ref(), object_store.bucket(), &config.bootstrap).await
    {
        error!(error = %e, "Image bucket unavailable, exiting");
        return Err(e.into());
    }

    let registry = Arc::new(
        PostgresDeviceRegistry::new(&config.registry)
            .await
            .context("Failed to initialize device registry")?,
    );

    let event_store = Arc::new(
        ClickHouseEventStore::new(&config.analytics)
            .context("Failed to initialize analytics store")?,
    );

    let dead_letters = Arc::new(
        KafkaDeadLetterSink::new(&config.kafka).context("Failed to initialize dead-letter sink")?,
    );

    let coordinator = Arc::new(IngestionCoordinator::new(
        registry.clone(),
        object_store.clone(),
        event_store.clone(),
        StepTimeouts {
            registry: config.ingest.registry_timeout(),
            object: config.ingest.object_timeout(),
            metadata: config.ingest.metadata_timeout(),
        },
    ));

    let settler = DeliverySettler::new(
        DeliveryTracker::new(
            config.ingest.max_delivery_attempts,
            config.ingest.retry_backoff(),
            config.ingest.max_retry_backoff(),
        ),
        dead_letters.clone(),
    );

    let consumer = EventConsumer::new(&config.kafka, coordinator, settler)
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    // Spawn Kafka consumer task
    let mut consumer_handle = tokio::spawn(consumer.run(shutdown.clone()));

    // Spawn API server task
    let api_handle = if config.api.enabled {
        let api_state = AppState {
            object_store: object_store.clone(),
            event_store: event_store.clone(),
            registry: registry.clone(),
            presigned_url_expiry: config.presigned_url_expiry(),
        };
        let api_config = config.api.clone();
        let api_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    info!("Event ingest service started successfully");

    // Wait for a shutdown signal, or for the consumer to stop on its own
    let stopped_early = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut consumer_handle => Some(result),
    };

    let consumer_result = match stopped_early {
        Some(result) => result,
        None => {
            info!("Shutting down event ingest service");
            shutdown.cancel();
            consumer_handle.await
        }
    };
    shutdown.cancel();

    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "API server task failed");
        }
    }

    dead_letters.flush(Duration::from_secs(5));

    consumer_result
        .context("Kafka consumer task panicked")?
        .context("Kafka consumer stopped")?;

    info!("Event ingest service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
