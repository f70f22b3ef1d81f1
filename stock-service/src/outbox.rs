use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

use shared::{
    EVENT_LOW_STOCK_ALERT, EVENT_OUT_OF_STOCK, EVENT_STOCK_COMMITTED, EVENT_STOCK_RELEASED,
    EVENT_STOCK_RESERVED,
};

use crate::clock::Clock;
use crate::error::{StockError, StockResult};
use crate::store::LedgerStore;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_BATCH_SIZE: i64 = 25;
pub const DEFAULT_LEASE_MINUTES: i64 = 5;

/// Transport seam for outbox publication. The message id doubles as the
/// transport-level dedup key where the broker supports one.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        destination: &str,
        message_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> StockResult<()>;
}

pub struct KafkaEventPublisher {
    producer: FutureProducer,
}

impl KafkaEventPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(
        &self,
        destination: &str,
        message_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> StockResult<()> {
        let json =
            serde_json::to_string(payload).map_err(|e| StockError::Publish(e.to_string()))?;
        let key = message_id.to_string();
        let record = FutureRecord::to(destination)
            .payload(&json)
            .key(&key)
            .headers(OwnedHeaders::new().insert(Header {
                key: "event-type",
                value: Some(event_type),
            }));

        self.producer
            .send(record, StdDuration::from_secs(5))
            .await
            .map_err(|(e, _)| StockError::Publish(e.to_string()))?;
        Ok(())
    }
}

pub fn topic_for(event_type: &str) -> &'static str {
    match event_type {
        EVENT_STOCK_RESERVED | EVENT_STOCK_COMMITTED | EVENT_STOCK_RELEASED => "stock-events",
        EVENT_LOW_STOCK_ALERT | EVENT_OUT_OF_STOCK => "stock-alerts",
        _ => "domain-events",
    }
}

/// Background loop that leases and publishes not-yet-processed outbox rows.
///
/// Coordination between instances happens purely through the store: each row
/// is claimed with a conditional update, and a stale claim (crashed instance)
/// becomes reclaimable once its lease expires. Publish failures clear the
/// claim and bump the retry counter; the row is retried on a later cycle.
#[derive(Clone)]
pub struct OutboxDispatcher {
    store: Arc<dyn LedgerStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    poll_interval: StdDuration,
    batch_size: i64,
    lease: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            instance_id: format!("dispatcher-{}", Uuid::new_v4()),
            poll_interval: StdDuration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            lease: Duration::minutes(DEFAULT_LEASE_MINUTES),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: StdDuration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.drain_once().await {
                error!("error draining outbox: {}", e);
            }
        }
    }

    /// One poll cycle. Returns the number of messages published.
    pub async fn drain_once(&self) -> StockResult<usize> {
        let now = self.clock.now();
        let due = self
            .store
            .due_outbox_messages(now - self.lease, self.batch_size)
            .await?;

        let mut published = 0;
        for message in due {
            let now = self.clock.now();
            let claimed = self
                .store
                .try_claim_outbox(message.id, &self.instance_id, now, now - self.lease)
                .await?;
            if !claimed {
                // Another dispatcher instance won the race.
                continue;
            }

            let destination = message
                .destination
                .clone()
                .unwrap_or_else(|| topic_for(&message.event_type).to_string());

            match self
                .publisher
                .publish(
                    &destination,
                    message.message_id,
                    &message.event_type,
                    &message.content,
                )
                .await
            {
                Ok(()) => {
                    self.store
                        .mark_outbox_processed(message.id, self.clock.now())
                        .await?;
                    published += 1;
                    info!(
                        message_id = %message.message_id,
                        event_type = message.event_type,
                        destination,
                        "outbox message published"
                    );
                }
                Err(e) => {
                    error!(
                        message_id = %message.message_id,
                        retry_count = message.retry_count,
                        "failed to publish outbox message: {}",
                        e
                    );
                    self.store.release_outbox_claim(message.id).await?;
                }
            }
        }

        Ok(published)
    }
}

/// Publisher that records what it was asked to publish; used by tests and
/// local development runs without a broker.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<std::sync::Mutex<Vec<RecordedPublish>>>,
    fail_next: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub destination: String,
    pub message_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        destination: &str,
        message_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> StockResult<()> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StockError::Publish("injected transport failure".into()));
        }
        self.published.lock().unwrap().push(RecordedPublish {
            destination: destination.to_string(),
            message_id,
            event_type: event_type.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
