use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use shared::*;

use crate::error::{StockError, StockResult};
use crate::idempotency::{IdempotencyCoordinator, StoredResponse};
use crate::inbox::{InboxOutcome, InboxProcessor};
use crate::reservation::ReservationLifecycleManager;

/// How long a stored idempotent response stays replayable.
pub const RESPONSE_TTL_HOURS: i64 = 24;

/// Deterministic fingerprint of a command payload, stored alongside the
/// idempotency key to detect key reuse with a different body.
pub fn request_fingerprint(payload: &serde_json::Value) -> StockResult<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// Durable identifiers stored on inbox rows; decoupled from the enum's
// variant names so a rename never changes stored data.
fn command_type_str(command_type: StockCommandType) -> &'static str {
    match command_type {
        StockCommandType::ReserveStock => "ReserveStock",
        StockCommandType::CommitReservation => "CommitReservation",
        StockCommandType::ReleaseReservation => "ReleaseReservation",
        StockCommandType::ReleaseCartReservations => "ReleaseCartReservations",
    }
}

/// Consumes `StockCommand` messages from the command topic. Each message is
/// deduplicated by the inbox (at-most-once handling per delivery), executed
/// under the idempotency coordinator (at-most-once effect per logical key),
/// and answered on the reply topic.
pub struct CommandHandler {
    inbox: InboxProcessor,
    coordinator: IdempotencyCoordinator,
    manager: ReservationLifecycleManager,
    producer: FutureProducer,
    reply_topic: String,
}

impl CommandHandler {
    pub fn new(
        inbox: InboxProcessor,
        coordinator: IdempotencyCoordinator,
        manager: ReservationLifecycleManager,
        producer: FutureProducer,
        reply_topic: String,
    ) -> Self {
        Self {
            inbox,
            coordinator,
            manager,
            producer,
            reply_topic,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => {
                                if let Ok(command) = serde_json::from_str::<StockCommand>(json_str)
                                {
                                    if let Err(e) = self.handle_command(command).await {
                                        error!("error handling command: {}", e);
                                    }
                                }
                            }
                            Err(e) => error!("error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) =
                        consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async)
                    {
                        error!("error committing message: {}", e);
                    }
                }
                Err(e) => error!("error receiving message: {}", e),
            }
        }
    }

    pub async fn handle_command(&self, command: StockCommand) -> StockResult<()> {
        let message_id = command.id.to_string();
        let message_type = command_type_str(command.command_type);
        let content = command.payload.clone();

        let outcome = self
            .inbox
            .process_once(&message_id, message_type, content, || async {
                let reply = match self.dispatch(&command).await {
                    Ok(reply) => reply,
                    Err(e) if matches!(e, StockError::Store(_) | StockError::Publish(_)) => {
                        // Infra failure: leave the inbox row unprocessed so the
                        // transport's redelivery retries the whole command.
                        return Err(e);
                    }
                    Err(e) => CommandReply::failed(command.id, e.to_string()),
                };
                self.send_reply(reply).await
            })
            .await?;

        if outcome == InboxOutcome::AlreadyProcessed {
            info!(command_id = %command.id, "duplicate command delivery ignored");
        }
        Ok(())
    }

    async fn dispatch(&self, command: &StockCommand) -> StockResult<CommandReply> {
        let ttl = ChronoDuration::hours(RESPONSE_TTL_HOURS);
        let hash = request_fingerprint(&command.payload)?;

        let response = match command.command_type {
            StockCommandType::ReserveStock => {
                let data: ReserveStockData = serde_json::from_value(command.payload.clone())?;
                let subject = data.customer_id.map(|c| c.to_string());
                let manager = &self.manager;
                self.coordinator
                    .execute(
                        &command.idempotency_key,
                        subject.as_deref(),
                        Some(&hash),
                        ttl,
                        || async move {
                            let result = manager.reserve(&data).await?;
                            Ok(StoredResponse {
                                body: serde_json::to_value(result)?,
                                status_code: 201,
                            })
                        },
                    )
                    .await
            }
            StockCommandType::CommitReservation => {
                let data: CommitReservationData = serde_json::from_value(command.payload.clone())?;
                let manager = &self.manager;
                self.coordinator
                    .execute(&command.idempotency_key, None, Some(&hash), ttl, || async move {
                        let committed = manager.commit(data.reservation_id, data.order_id).await?;
                        Ok(StoredResponse {
                            body: serde_json::json!({ "committed": committed }),
                            status_code: 200,
                        })
                    })
                    .await
            }
            StockCommandType::ReleaseReservation => {
                let data: ReleaseReservationData = serde_json::from_value(command.payload.clone())?;
                let manager = &self.manager;
                self.coordinator
                    .execute(&command.idempotency_key, None, Some(&hash), ttl, || async move {
                        let released = manager
                            .release(data.reservation_id, data.reason.as_deref())
                            .await?;
                        Ok(StoredResponse {
                            body: serde_json::json!({ "released": released }),
                            status_code: 200,
                        })
                    })
                    .await
            }
            StockCommandType::ReleaseCartReservations => {
                let data: ReleaseCartReservationsData =
                    serde_json::from_value(command.payload.clone())?;
                let manager = &self.manager;
                self.coordinator
                    .execute(&command.idempotency_key, None, Some(&hash), ttl, || async move {
                        let released = manager.release_cart(data.cart_id).await?;
                        Ok(StoredResponse {
                            body: serde_json::json!({ "released_count": released }),
                            status_code: 200,
                        })
                    })
                    .await
            }
        };

        match response {
            Ok(stored) => Ok(CommandReply::success(command.id, Some(stored.body))),
            Err(e) if matches!(e, StockError::Store(_) | StockError::Publish(_)) => Err(e),
            Err(e) => Ok(CommandReply::failed(command.id, e.to_string())),
        }
    }

    async fn send_reply(&self, reply: CommandReply) -> StockResult<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.command_id.to_string();
        let record = FutureRecord::to(&self.reply_topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| StockError::Publish(format!("failed to send reply: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_command_type_identifiers_are_stable() {
        assert_eq!(command_type_str(StockCommandType::ReserveStock), "ReserveStock");
        assert_eq!(
            command_type_str(StockCommandType::CommitReservation),
            "CommitReservation"
        );
        assert_eq!(
            command_type_str(StockCommandType::ReleaseReservation),
            "ReleaseReservation"
        );
        assert_eq!(
            command_type_str(StockCommandType::ReleaseCartReservations),
            "ReleaseCartReservations"
        );
    }
}
