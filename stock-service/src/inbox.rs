use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::StockResult;
use crate::models::{NewInboxMessage, INBOX_PROCESSED, INBOX_RECEIVED};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    Processed,
    AlreadyProcessed,
}

/// Consumer-side dedup: records the message id before handling, so a handler
/// runs at most once per message even under transport redelivery.
///
/// A handler failure leaves the row in `received` state; the next redelivery
/// of the same message id retries the handler instead of skipping it.
#[derive(Clone)]
pub struct InboxProcessor {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    consumer: String,
}

impl InboxProcessor {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, consumer: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            consumer: consumer.into(),
        }
    }

    pub async fn process_once<F, Fut>(
        &self,
        message_id: &str,
        message_type: &str,
        content: serde_json::Value,
        handler: F,
    ) -> StockResult<InboxOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = StockResult<()>> + Send,
    {
        let inserted = self
            .store
            .try_insert_inbox(NewInboxMessage {
                message_id: message_id.to_string(),
                message_type: message_type.to_string(),
                content,
                consumer: Some(self.consumer.clone()),
                status: INBOX_RECEIVED.to_string(),
                received_at: self.clock.now(),
            })
            .await?;

        if !inserted {
            let existing = self.store.get_inbox_message(message_id).await?;
            let done = existing
                .map(|m| m.status == INBOX_PROCESSED)
                .unwrap_or(false);
            if done {
                debug!(message_id, "duplicate message, already processed");
                return Ok(InboxOutcome::AlreadyProcessed);
            }
            // Row exists but is still `received`: a previous delivery failed
            // mid-handling, so this redelivery retries the handler.
            info!(message_id, "retrying previously failed message");
        }

        handler().await?;

        self.store
            .mark_inbox_processed(message_id, self.clock.now())
            .await?;
        Ok(InboxOutcome::Processed)
    }
}
