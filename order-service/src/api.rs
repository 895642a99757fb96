use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::OrderError;
use crate::models::{Order, OrderItem};
use crate::orders::{CreateOrderRequest, CreateOrderResponse, OrderService};

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
    /// Budget for one order submission; on expiry the saga compensates any
    /// partial reservations and the client gets an error.
    pub order_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), OrderError> {
    // Header form of the key is a fallback when the body carries none.
    if request.idempotency_key.is_none() {
        request.idempotency_key = headers
            .get("Idempotency-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    let budget = state.order_timeout;
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(budget).await;
        deadline.cancel();
    });

    let result = state.orders.submit_order(request, cancel).await;
    watchdog.abort();

    let response = result?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderResponse>, OrderError> {
    let (order, items) = state.orders.get_order(order_id).await?;
    Ok(Json(OrderResponse { order, items }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "time": Utc::now().timestamp(),
    }))
}

async fn ready() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ready",
        "time": Utc::now().timestamp(),
    }))
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrderError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OrderError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(%self, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
