//! Bounded redelivery.
//!
//! A message whose processing failed with a transient error is redelivered
//! from the same offset after an exponential backoff. Once it has failed
//! `max_attempts` times in a row it is published to the dead-letter sink and
//! committed so the partition can move on. Counters are held in memory per
//! partition. They are dropped when the partition is revoked and start over
//! after a restart.

use crate::coordinator::RecordedEvent;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::{Disposition, IngestError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// What to do with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Redeliver { attempt: u32, backoff: Duration },
    DeadLetter { attempts: u32 },
}

/// Consecutive failure counts of the message at the head of each partition
#[derive(Debug)]
pub struct DeliveryTracker {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    failures: HashMap<(String, i32), (i64, u32)>,
}

impl DeliveryTracker {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
            failures: HashMap::new(),
        }
    }

    /// Count a failure of the message at `offset`
    pub fn record_failure(&mut self, topic: &str, partition: i32, offset: i64) -> RetryDecision {
        let entry = self
            .failures
            .entry((topic.to_string(), partition))
            .or_insert((offset, 0));

        if entry.0 != offset {
            *entry = (offset, 0);
        }
        entry.1 += 1;

        let attempt = entry.1;
        if attempt >= self.max_attempts {
            RetryDecision::DeadLetter { attempts: attempt }
        } else {
            RetryDecision::Redeliver {
                attempt,
                backoff: self.backoff_for(attempt),
            }
        }
    }

    /// Forget the partition's failure count once its head message is committed
    pub fn record_settled(&mut self, topic: &str, partition: i32) {
        self.failures.remove(&(topic.to_string(), partition));
    }

    /// `base * 2^(attempt - 1)`, capped at the maximum backoff
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Position and bytes of one consumed message
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub payload: &'a [u8],
}

/// Final action for a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledge and move past the message
    Commit,
    /// Rewind to the message after waiting `backoff`
    Redeliver { backoff: Duration },
}

/// Turns pipeline outcomes into commit/redeliver decisions
pub struct DeliverySettler {
    tracker: DeliveryTracker,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl DeliverySettler {
    pub fn new(tracker: DeliveryTracker, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            tracker,
            dead_letters,
        }
    }

    pub async fn settle(
        &mut self,
        delivery: &Delivery<'_>,
        outcome: &Result<RecordedEvent, IngestError>,
    ) -> Settlement {
        let err = match outcome {
            Ok(_) => return self.commit(delivery),
            Err(err) if err.disposition() == Disposition::Reject => return self.commit(delivery),
            Err(err) => err,
        };

        match self
            .tracker
            .record_failure(delivery.topic, delivery.partition, delivery.offset)
        {
            RetryDecision::Redeliver { attempt, backoff } => {
                warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    stage = err.stage().as_str(),
                    "Event will be redelivered"
                );
                metrics::counter!("ingest.events.redelivered").increment(1);
                Settlement::Redeliver { backoff }
            }
            RetryDecision::DeadLetter { attempts } => {
                self.dead_letter(delivery, err, attempts).await
            }
        }
    }

    /// Drop the failure count of a partition this consumer no longer owns
    pub fn forget(&mut self, topic: &str, partition: i32) {
        debug!(topic, partition, "Clearing redelivery state of revoked partition");
        self.tracker.record_settled(topic, partition);
    }

    fn commit(&mut self, delivery: &Delivery<'_>) -> Settlement {
        self.tracker
            .record_settled(delivery.topic, delivery.partition);
        Settlement::Commit
    }

    async fn dead_letter(
        &mut self,
        delivery: &Delivery<'_>,
        err: &IngestError,
        attempts: u32,
    ) -> Settlement {
        let letter = DeadLetter {
            original_topic: delivery.topic.to_string(),
            partition: delivery.partition,
            offset: delivery.offset,
            attempts,
            stage: err.stage().as_str().to_string(),
            error: err.to_string(),
            payload: delivery.payload.to_vec(),
            failed_at: Utc::now(),
        };

        match self.dead_letters.publish(&letter).await {
            Ok(()) => {
                error!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    attempts,
                    stage = %letter.stage,
                    error = %letter.error,
                    "Event dead-lettered after exhausting delivery attempts"
                );
                metrics::counter!("ingest.events.dead_lettered").increment(1);
                self.commit(delivery)
            }
            Err(publish_err) => {
                // Never commit a message that is not parked somewhere
                error!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %publish_err,
                    "Failed to publish dead letter, redelivering"
                );
                metrics::counter!("ingest.dead_letter.errors").increment(1);
                Settlement::Redeliver {
                    backoff: self.tracker.max_backoff(),
                }
            }
        }
    }
}
