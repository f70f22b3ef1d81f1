use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{StockError, StockResult};
use crate::models::NewIdempotentRequest;
use crate::store::LedgerStore;

pub const DEFAULT_LOCK_DURATION_SECS: i64 = 30;

/// A serialized operation result as stored on the idempotent-request record
/// and replayed verbatim to later callers of the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub body: serde_json::Value,
    pub status_code: i16,
}

/// Wraps an action with at-most-once semantics keyed by (key, subject id).
///
/// Deliberately non-blocking: a caller that finds the key locked by an
/// in-flight operation gets `OperationInProgress` immediately instead of
/// waiting on the other caller. The lock's own expiry is the only timeout;
/// client cancellation never clears it early.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    lock_duration: Duration,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock_duration: Duration::seconds(DEFAULT_LOCK_DURATION_SECS),
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        subject_id: Option<&str>,
        request_hash: Option<&str>,
        ttl: Duration,
        action: F,
    ) -> StockResult<StoredResponse>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = StockResult<StoredResponse>> + Send,
    {
        let subject = subject_id.unwrap_or("");
        let now = self.clock.now();

        if let Some(existing) = self.store.find_request(key, subject).await? {
            let expired = existing.expires_on.map(|e| e <= now).unwrap_or(false);
            if let (Some(body), false) = (existing.response_body.clone(), expired) {
                check_hash(existing.request_hash.as_deref(), request_hash)?;
                debug!(key, "returning stored idempotent response");
                return Ok(StoredResponse {
                    body,
                    status_code: existing.status_code.unwrap_or(200),
                });
            }
        }

        let locked_until = now + self.lock_duration;
        let expires_on = Some(now + ttl);
        let inserted = self
            .store
            .try_insert_request(NewIdempotentRequest {
                key: key.to_string(),
                subject_id: subject.to_string(),
                request_hash: request_hash.map(|h| h.to_string()),
                locked_until: Some(locked_until),
                expires_on,
                created_at: now,
            })
            .await?;

        if !inserted {
            // Lost the insert race. A result may have landed in the meantime;
            // otherwise the record is either still locked or stale enough to
            // reclaim.
            let existing = self
                .store
                .find_request(key, subject)
                .await?
                .ok_or(StockError::OperationInProgress)?;

            let expired = existing.expires_on.map(|e| e <= now).unwrap_or(false);
            if let (Some(body), false) = (existing.response_body.clone(), expired) {
                check_hash(existing.request_hash.as_deref(), request_hash)?;
                return Ok(StoredResponse {
                    body,
                    status_code: existing.status_code.unwrap_or(200),
                });
            }

            let reclaimed = self
                .store
                .try_reclaim_request(
                    key,
                    subject,
                    now,
                    locked_until,
                    expires_on,
                    request_hash.map(|h| h.to_string()),
                )
                .await?;
            if !reclaimed {
                return Err(StockError::OperationInProgress);
            }
            debug!(key, "reclaimed stale idempotent request record");
        }

        match action().await {
            Ok(response) => {
                self.store
                    .complete_request(key, subject, response.body.clone(), response.status_code)
                    .await?;
                Ok(response)
            }
            Err(e) => {
                // No result stored: a retry with the same key re-executes.
                self.store.clear_request_lock(key, subject).await?;
                Err(e)
            }
        }
    }
}

fn check_hash(stored: Option<&str>, presented: Option<&str>) -> StockResult<()> {
    if let (Some(stored), Some(presented)) = (stored, presented) {
        if stored != presented {
            return Err(StockError::KeyPayloadMismatch);
        }
    }
    Ok(())
}
