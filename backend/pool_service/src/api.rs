//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use giftpool_protocol::{EventStatus, ReportedStatus};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::errors::PoolError;
use crate::ledger::Ledger;
use crate::models::{ContributionRecord, NewContribution, NewEvent, WebhookPayload};

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<Ledger>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(create_event))
        .route("/events/:id", get(get_event))
        .route("/events/:id/open", post(open_event))
        .route("/events/:id/purchase", post(begin_purchase))
        .route("/events/:id/invest", post(mark_invested))
        .route("/events/:id/complete", post(mark_completed))
        .route("/events/:id/cancel", post(cancel_event))
        .route(
            "/events/:id/contributions",
            post(create_contribution).get(list_contributions),
        )
        .route("/payments/confirm", post(confirm_payment))
        .route("/webhooks/payments", post(payment_webhook))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct ContributionsResponse {
    pub event_id: String,
    pub count: usize,
    pub contributions: Vec<ContributionRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub payment_ref: String,
    /// When absent the provider is asked for the intent status.
    #[serde(default)]
    pub status: Option<ReportedStatus>,
}

#[derive(Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: crate::models::WebhookOutcome,
}

impl PoolError {
    fn status_code(&self) -> StatusCode {
        match self {
            PoolError::InvalidAmount(_) | PoolError::EventNotAcceptingContributions { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PoolError::EventNotFound(_)
            | PoolError::ContributionNotFound(_)
            | PoolError::UnknownPaymentRef(_) => StatusCode::NOT_FOUND,
            PoolError::InvalidStateTransition { .. } | PoolError::ConfirmationRejected(_) => {
                StatusCode::CONFLICT
            }
            PoolError::Gateway(_) => StatusCode::BAD_GATEWAY,
            PoolError::ConcurrencyExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::Accounting(_)
            | PoolError::Database(_)
            | PoolError::Migrate(_)
            | PoolError::Json(_)
            | PoolError::Config(_)
            | PoolError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), "Request failed: {self}");
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

type ApiResult<T> = Result<T, PoolError>;

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /events`
pub async fn create_event(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<NewEvent>,
) -> ApiResult<impl IntoResponse> {
    let event = state.ledger.create_event(body).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// `GET /events/:id`
pub async fn get_event(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.event_view(&id).await?))
}

async fn transition_to(state: &ApiState, id: &str, to: EventStatus) -> ApiResult<Response> {
    let event = state.ledger.transition(id, to).await?;
    Ok(Json(event).into_response())
}

/// `POST /events/:id/open`
pub async fn open_event(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    transition_to(&state, &id, EventStatus::Active).await
}

/// `POST /events/:id/purchase`
pub async fn begin_purchase(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    transition_to(&state, &id, EventStatus::Purchasing).await
}

/// `POST /events/:id/invest`
pub async fn mark_invested(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    transition_to(&state, &id, EventStatus::Invested).await
}

/// `POST /events/:id/complete`
pub async fn mark_completed(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    transition_to(&state, &id, EventStatus::Completed).await
}

/// `POST /events/:id/cancel`
pub async fn cancel_event(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<impl IntoResponse> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "cancelled by host".to_string());
    Ok(Json(state.ledger.cancel_event(&id, &reason).await?))
}

/// `POST /events/:id/contributions`
pub async fn create_contribution(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<NewContribution>,
) -> ApiResult<impl IntoResponse> {
    let created = state.ledger.create_contribution(&id, body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /events/:id/contributions`
pub async fn list_contributions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let contributions = state.ledger.list_contributions(&id).await?;
    Ok(Json(ContributionsResponse {
        event_id: id,
        count: contributions.len(),
        contributions,
    }))
}

/// `POST /payments/confirm`
pub async fn confirm_payment(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ConfirmRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = match body.status {
        Some(status) => {
            state
                .ledger
                .reconcile_confirmation(&body.payment_ref, status)
                .await?
        }
        None => state.ledger.confirm_payment(&body.payment_ref).await?,
    };
    Ok(Json(result))
}

/// `POST /webhooks/payments`
///
/// Signature verification happens in front of this handler. Answers 200 as
/// soon as the provider event id is recorded so the provider stops retrying.
pub async fn payment_webhook(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<WebhookPayload>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.ledger.handle_webhook(body).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
