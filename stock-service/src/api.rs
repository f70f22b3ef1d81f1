use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use shared::*;

use crate::allocation::Availability;
use crate::error::StockError;
use crate::handlers::{request_fingerprint, RESPONSE_TTL_HOURS};
use crate::idempotency::{IdempotencyCoordinator, StoredResponse};
use crate::reservation::ReservationLifecycleManager;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub manager: ReservationLifecycleManager,
    pub coordinator: IdempotencyCoordinator,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub quantity: i32,
    pub warehouse_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub order_id: Uuid,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReleaseRequest {
    pub reason: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/availability", get(check_availability))
        .route("/reservations", post(reserve_stock))
        .route("/reservations/:id/commit", post(commit_reservation))
        .route("/reservations/:id/release", post(release_reservation))
        .route("/carts/:cart_id/reservations", delete(release_cart))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(e: StockError) -> ApiError {
    let (status, code) = match &e {
        StockError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        StockError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StockError::InsufficientStock { .. } => (StatusCode::CONFLICT, "insufficient_stock"),
        StockError::KeyPayloadMismatch => (StatusCode::CONFLICT, "key_payload_mismatch"),
        StockError::OperationInProgress => (StatusCode::CONFLICT, "in_progress"),
        StockError::InvalidState => (StatusCode::CONFLICT, "invalid_state"),
        StockError::Store(_) | StockError::Publish(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code,
        }),
    )
}

/// Explicit `Idempotency-Key` header if supplied, otherwise derived from
/// (method, route, body). Callers repeating a legitimately repeatable action
/// must salt their own key; a purely content-derived key treats repeats as
/// duplicates.
fn resolve_idempotency_key(
    headers: &HeaderMap,
    method: &str,
    route: &str,
    body: &serde_json::Value,
) -> String {
    if let Some(key) = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if !key.is_empty() {
            return key.to_string();
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(route.as_bytes());
    hasher.update(b"|");
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn stored_response(stored: StoredResponse) -> (StatusCode, Json<serde_json::Value>) {
    let status =
        StatusCode::from_u16(stored.status_code as u16).unwrap_or(StatusCode::OK);
    (status, Json(stored.body))
}

async fn check_availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Availability>, ApiError> {
    state
        .manager
        .check_availability(
            query.product_id,
            query.variation_id,
            query.quantity,
            query.warehouse_id,
        )
        .await
        .map(Json)
        .map_err(error_response)
}

async fn reserve_stock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReserveStockData>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let body = serde_json::to_value(&request).map_err(|e| error_response(e.into()))?;
    let key = resolve_idempotency_key(&headers, "POST", "/reservations", &body);
    let hash = request_fingerprint(&body).map_err(error_response)?;
    let subject = request.customer_id.map(|c| c.to_string());

    let manager = &state.manager;
    let stored = state
        .coordinator
        .execute(
            &key,
            subject.as_deref(),
            Some(&hash),
            Duration::hours(RESPONSE_TTL_HOURS),
            || async move {
                let result = manager.reserve(&request).await?;
                Ok(StoredResponse {
                    body: serde_json::to_value(result)?,
                    status_code: 201,
                })
            },
        )
        .await
        .map_err(error_response)?;

    Ok(stored_response(stored))
}

async fn commit_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CommitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let body = serde_json::json!({ "reservation_id": id, "order_id": request.order_id });
    let route = format!("/reservations/{}/commit", id);
    let key = resolve_idempotency_key(&headers, "POST", &route, &body);
    let hash = request_fingerprint(&body).map_err(error_response)?;

    let manager = &state.manager;
    let stored = state
        .coordinator
        .execute(
            &key,
            None,
            Some(&hash),
            Duration::hours(RESPONSE_TTL_HOURS),
            || async move {
                let committed = manager.commit(id, request.order_id).await?;
                Ok(StoredResponse {
                    body: serde_json::json!({ "committed": committed }),
                    status_code: 200,
                })
            },
        )
        .await
        .map_err(error_response)?;

    Ok(stored_response(stored))
}

async fn release_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ReleaseRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let body = serde_json::json!({ "reservation_id": id, "reason": &request.reason });
    let route = format!("/reservations/{}/release", id);
    let key = resolve_idempotency_key(&headers, "POST", &route, &body);
    let hash = request_fingerprint(&body).map_err(error_response)?;

    let manager = &state.manager;
    let stored = state
        .coordinator
        .execute(
            &key,
            None,
            Some(&hash),
            Duration::hours(RESPONSE_TTL_HOURS),
            || async move {
                let released = manager.release(id, request.reason.as_deref()).await?;
                Ok(StoredResponse {
                    body: serde_json::json!({ "released": released }),
                    status_code: 200,
                })
            },
        )
        .await
        .map_err(error_response)?;

    Ok(stored_response(stored))
}

async fn release_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let body = serde_json::json!({ "cart_id": cart_id });
    let route = format!("/carts/{}/reservations", cart_id);
    let key = resolve_idempotency_key(&headers, "DELETE", &route, &body);
    let hash = request_fingerprint(&body).map_err(error_response)?;

    let manager = &state.manager;
    let stored = state
        .coordinator
        .execute(
            &key,
            None,
            Some(&hash),
            Duration::hours(RESPONSE_TTL_HOURS),
            || async move {
                let released = manager.release_cart(cart_id).await?;
                Ok(StoredResponse {
                    body: serde_json::json!({ "released_count": released }),
                    status_code: 200,
                })
            },
        )
        .await
        .map_err(error_response)?;

    Ok(stored_response(stored))
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::StockItem;
    use crate::store::memory::MemoryLedgerStore;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        manager: ReservationLifecycleManager,
        app: Router,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = ReservationLifecycleManager::new(store.clone(), clock.clone());
        let coordinator = IdempotencyCoordinator::new(store.clone(), clock.clone());
        let app = create_router(AppState {
            manager: manager.clone(),
            coordinator,
        });
        Fixture {
            store,
            manager,
            app,
        }
    }

    fn seed_stock(store: &MemoryLedgerStore, product_id: Uuid, available: i32) -> Uuid {
        let item = StockItem {
            id: Uuid::new_v4(),
            product_id,
            variation_id: None,
            warehouse_id: Uuid::new_v4(),
            sku: None,
            available_quantity: available,
            reserved_quantity: 0,
            in_transit_quantity: 0,
            damaged_quantity: 0,
            minimum_level: None,
            maximum_level: None,
            expiry_date: None,
            batch_number: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let id = item.id;
        store.add_stock_item(item);
        id
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        key: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .header(IDEMPOTENCY_KEY_HEADER, key)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn reserve(f: &Fixture, product_id: Uuid, quantity: i32) -> Uuid {
        f.manager
            .reserve(&ReserveStockData {
                product_id,
                variation_id: None,
                warehouse_id: None,
                cart_id: None,
                order_id: None,
                customer_id: None,
                quantity,
                reservation_type: ReservationKind::Cart,
                ttl_minutes: None,
            })
            .await
            .unwrap()
            .reservation_id
    }

    #[tokio::test]
    async fn keyed_release_retry_replays_original_response() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        seed_stock(&f.store, product_id, 10);
        let reservation_id = reserve(&f, product_id, 4).await;

        let uri = format!("/reservations/{}/release", reservation_id);
        let (status, body) = post_json(&f.app, &uri, "rel-1", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "released": true }));

        // Retry with the same key: the stored response comes back verbatim,
        // not the no-op outcome a second release would report.
        let (status, body) = post_json(&f.app, &uri, "rel-1", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "released": true }));
    }

    #[tokio::test]
    async fn keyed_cart_release_retry_replays_original_count() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        seed_stock(&f.store, product_id, 10);
        let cart_id = Uuid::new_v4();
        f.manager
            .reserve(&ReserveStockData {
                product_id,
                variation_id: None,
                warehouse_id: None,
                cart_id: Some(cart_id),
                order_id: None,
                customer_id: None,
                quantity: 3,
                reservation_type: ReservationKind::Cart,
                ttl_minutes: None,
            })
            .await
            .unwrap();

        let uri = format!("/carts/{}/reservations", cart_id);
        let request = || {
            Request::builder()
                .method("DELETE")
                .uri(&uri)
                .header(IDEMPOTENCY_KEY_HEADER, "cart-rel-1")
                .body(Body::empty())
                .unwrap()
        };

        let response = f.app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({ "released_count": 1 }));

        let response = f.app.clone().oneshot(request()).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({ "released_count": 1 }));
    }
}
