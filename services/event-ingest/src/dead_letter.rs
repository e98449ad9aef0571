use crate::config::KafkaConfig;
use crate::error::DeadLetterError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A message that exhausted its delivery attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub attempts: u32,
    pub stage: String,
    pub error: String,
    /// Original message bytes
    #[serde(rename = "payload_base64", serialize_with = "serialize_base64")]
    pub payload: Vec<u8>,
    pub failed_at: DateTime<Utc>,
}

fn serialize_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// Destination for poison messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Dead-letter topic on the same Kafka cluster
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", format!("{}-dlq", config.client_id))
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.produce_timeout_ms.to_string());

        apply_security(&mut client_config, config);

        let producer: FutureProducer = client_config
            .create()
            .context("Failed to create dead-letter producer")?;

        info!(topic = %config.dead_letter_topic, "Dead-letter producer created");

        Ok(Self {
            producer,
            topic: config.dead_letter_topic.clone(),
            timeout: Duration::from_millis(config.produce_timeout_ms),
        })
    }

    /// Flush pending dead letters
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(Timeout::After(timeout)) {
            warn!(error = %e, "Failed to flush dead-letter producer");
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    #[instrument(skip(self, letter), fields(topic = %self.topic, partition = letter.partition, offset = letter.offset))]
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_vec(letter)?;
        let key = Uuid::new_v4().to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "message-type",
                value: Some("dead_letter"),
            })
            .insert(Header {
                key: "original-topic",
                value: Some(letter.original_topic.as_str()),
            })
            .insert(Header {
                key: "error-stage",
                value: Some(letter.stage.as_str()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| DeadLetterError::Publish {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}

/// SSL/SASL settings shared by the consumer and the dead-letter producer
pub(crate) fn apply_security(client_config: &mut ClientConfig, config: &KafkaConfig) {
    let sasl = match (&config.sasl_username, &config.sasl_password) {
        (Some(username), Some(password)) => Some((username, password)),
        _ => None,
    };

    let protocol = match (config.ssl_enabled, sasl.is_some()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SSL",
        (false, true) => "SASL_PLAINTEXT",
        (false, false) => "PLAINTEXT",
    };
    client_config.set("security.protocol", protocol);

    if config.ssl_enabled {
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    if let Some((username, password)) = sasl {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
}
