use crate::config::KafkaConfig;
use crate::coordinator::IngestionCoordinator;
use crate::dead_letter::apply_security;
use crate::delivery::{Delivery, DeliverySettler, Settlement};
use anyhow::{Context, Result};
use chrono::Utc;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Remembers partitions revoked by a rebalance until the loop clears their
/// retry state. Callbacks run on the librdkafka thread.
#[derive(Debug, Clone, Default)]
pub struct RebalanceContext {
    revoked: Arc<Mutex<Vec<(String, i32)>>>,
}

impl RebalanceContext {
    fn record_revoked(&self, partitions: &TopicPartitionList) {
        let mut revoked = self.revoked.lock().unwrap_or_else(PoisonError::into_inner);
        revoked.extend(
            partitions
                .elements()
                .iter()
                .map(|elem| (elem.topic().to_string(), elem.partition())),
        );
    }

    fn take_revoked(&self) -> Vec<(String, i32)> {
        std::mem::take(&mut *self.revoked.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(partitions = partitions.count(), "Partitions revoked");
            self.record_revoked(partitions);
        }
    }
}

/// Kafka consumer for device events.
///
/// Messages are handled one at a time per consumer. Offsets are committed
/// manually and only after the message reached a final outcome.
pub struct EventConsumer {
    consumer: StreamConsumer<RebalanceContext>,
    context: RebalanceContext,
    topic: String,
    coordinator: Arc<IngestionCoordinator>,
    settler: DeliverySettler,
}

impl EventConsumer {
    /// Create a consumer subscribed to the events topic
    pub fn new(
        config: &KafkaConfig,
        coordinator: Arc<IngestionCoordinator>,
        settler: DeliverySettler,
    ) -> Result<Self> {
        let context = RebalanceContext::default();
        let consumer: StreamConsumer<RebalanceContext> = client_config(config)
            .create_with_context(context.clone())
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.events_topic])
            .context("Failed to subscribe to events topic")?;

        info!(
            topic = %config.events_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            context,
            topic: config.events_topic.clone(),
            coordinator,
            settler,
        })
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// The event in flight when shutdown is requested runs to completion; an
    /// event waiting out its redelivery backoff is left uncommitted.
    #[instrument(skip(self, shutdown), fields(topic = %self.topic))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting event consumer");

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => received.map(|m| m.detach()),
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("ingest.kafka.errors").increment(1);
                    continue;
                }
            };

            self.forget_revoked();

            match self.handle(&message).await {
                Settlement::Commit => self.commit(&message),
                Settlement::Redeliver { backoff } => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    self.forget_revoked();
                    self.rewind(&message)?;
                }
            }
        }

        info!("Shutdown requested, leaving consumer group");
        self.consumer.unsubscribe();

        Ok(())
    }

    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn handle(&mut self, message: &OwnedMessage) -> Settlement {
        let payload = message.payload().unwrap_or_default();

        let delivery = Delivery {
            topic: message.topic(),
            partition: message.partition(),
            offset: message.offset(),
            payload,
        };

        let outcome = self.coordinator.process(payload, Utc::now()).await;
        self.settler.settle(&delivery, &outcome).await
    }

    /// Commit the offset after `message`
    fn commit(&self, message: &OwnedMessage) {
        let mut offsets = TopicPartitionList::new();

        let result = offsets
            .add_partition_offset(
                message.topic(),
                message.partition(),
                Offset::Offset(message.offset() + 1),
            )
            .and_then(|_| self.consumer.commit(&offsets, CommitMode::Async));

        match result {
            Ok(()) => debug!(
                partition = message.partition(),
                offset = message.offset(),
                "Offset committed"
            ),
            Err(e) => {
                warn!(
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "Failed to commit offset"
                );
                metrics::counter!("ingest.kafka.commit_errors").increment(1);
            }
        }
    }

    /// Drop retry counts of partitions this consumer no longer owns
    fn forget_revoked(&mut self) {
        for (topic, partition) in self.context.take_revoked() {
            self.settler.forget(&topic, partition);
        }
    }

    /// Point the partition back at `message` so it is fetched again.
    ///
    /// If the partition was revoked meanwhile its new owner resumes from the
    /// last committed offset, so the message is not lost. A failed seek on a
    /// partition still assigned to us is fatal: continuing would commit past
    /// the message.
    fn rewind(&mut self, message: &OwnedMessage) -> Result<()> {
        let seek_err = match self.consumer.seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            SEEK_TIMEOUT,
        ) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let assignment = self
            .consumer
            .assignment()
            .context("Failed to read partition assignment")?;

        if is_assigned(&assignment, message.topic(), message.partition()) {
            return Err(anyhow::Error::new(seek_err).context(format!(
                "Failed to rewind {}[{}] to offset {}",
                message.topic(),
                message.partition(),
                message.offset()
            )));
        }

        warn!(
            partition = message.partition(),
            offset = message.offset(),
            error = %seek_err,
            "Partition revoked during redelivery backoff, leaving message to its new owner"
        );
        metrics::counter!("ingest.kafka.revoked_redeliveries").increment(1);
        self.settler.forget(message.topic(), message.partition());

        Ok(())
    }
}

fn is_assigned(assignment: &TopicPartitionList, topic: &str, partition: i32) -> bool {
    assignment.find_partition(topic, partition).is_some()
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

    apply_security(&mut client_config, config);

    client_config
}
