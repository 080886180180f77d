//! Administrative HTTP surface over [`DeadLetterAdmin`].
//!
//! Intended for an operator tool or internal admin UI:
//!
//! - `GET /dead-letters?page&pageSize` — paginated listing
//! - `POST /dead-letters/{id}/reprocess` — reset one message
//! - `POST /dead-letters/reprocess` — filtered bulk reset
//!
//! Error responses are structured JSON bodies with enough detail to act;
//! handler internals are never exposed beyond the stored `error` string
//! already surfaced by the listing.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admin::{AdminError, AdminErrorKind, BulkReprocessRequest, DeadLetterAdmin};
use crate::store::DeadLetterStore;
use crate::OutboxMessage;

/// Build the administrative router.
///
/// The router owns a shared [`DeadLetterAdmin`] and can be merged into a
/// larger application or served standalone.
pub fn router<D>(admin: Arc<DeadLetterAdmin<D>>) -> Router
where
    D: DeadLetterStore<ID = i64> + Send + Sync + 'static,
    D::Error: Into<tower::BoxError>,
{
    Router::new()
        .route("/dead-letters", get(list::<D>))
        .route("/dead-letters/reprocess", post(reprocess_bulk::<D>))
        .route("/dead-letters/:id/reprocess", post(reprocess::<D>))
        .with_state(admin)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default = "default_page")]
    page: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Vec<DeadLetterItem>,
    total_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterItem {
    id: i64,
    occurred_on_utc: DateTime<Utc>,
    event_type: String,
    retry_count: u32,
    dead_lettered_on_utc: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl From<&OutboxMessage<i64>> for DeadLetterItem {
    fn from(msg: &OutboxMessage<i64>) -> Self {
        Self {
            id: *msg.id(),
            occurred_on_utc: msg.occurred_on(),
            event_type: msg.event().event_type.clone(),
            retry_count: msg.retry_count(),
            dead_lettered_on_utc: msg.dead_lettered_on(),
            error: msg.error().map(str::to_owned),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkBody {
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    dead_lettered_from_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    dead_lettered_to_utc: Option<DateTime<Utc>>,
    max_items: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkResponse {
    reprocessed_count: u64,
}

async fn list<D>(
    State(admin): State<Arc<DeadLetterAdmin<D>>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError>
where
    D: DeadLetterStore<ID = i64> + Send + Sync,
    D::Error: Into<tower::BoxError>,
{
    let page = admin.list(params.page, params.page_size).await?;
    Ok(Json(ListResponse {
        items: page.items.iter().map(DeadLetterItem::from).collect(),
        total_count: page.total_count,
    }))
}

async fn reprocess<D>(
    State(admin): State<Arc<DeadLetterAdmin<D>>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError>
where
    D: DeadLetterStore<ID = i64> + Send + Sync,
    D::Error: Into<tower::BoxError>,
{
    admin
        .reprocess(&id)
        .await
        .map_err(|err| ApiError::for_message(err, id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reprocess_bulk<D>(
    State(admin): State<Arc<DeadLetterAdmin<D>>>,
    Json(body): Json<BulkBody>,
) -> Result<Json<BulkResponse>, ApiError>
where
    D: DeadLetterStore<ID = i64> + Send + Sync,
    D::Error: Into<tower::BoxError>,
{
    let reprocessed_count = admin
        .reprocess_bulk(BulkReprocessRequest {
            event_type: body.event_type,
            dead_lettered_from: body.dead_lettered_from_utc,
            dead_lettered_to: body.dead_lettered_to_utc,
            max_items: body.max_items,
        })
        .await?;
    Ok(Json(BulkResponse { reprocessed_count }))
}

/// [`AdminError`] mapped onto a status code and a JSON problem body.
struct ApiError {
    error: AdminError,
    message_id: Option<i64>,
}

impl ApiError {
    fn for_message(error: AdminError, id: i64) -> Self {
        Self {
            error,
            message_id: Some(id),
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(error: AdminError) -> Self {
        Self {
            error,
            message_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self.error.kind() {
            AdminErrorKind::NotFound => (StatusCode::NOT_FOUND, "message not found".to_owned()),
            AdminErrorKind::NotDeadLettered => (
                StatusCode::BAD_REQUEST,
                "message is not currently dead-lettered".to_owned(),
            ),
            AdminErrorKind::InvalidPagination { page, page_size } => (
                StatusCode::BAD_REQUEST,
                format!("invalid pagination: page {page}, pageSize {page_size}"),
            ),
            AdminErrorKind::InvalidMaxItems(max_items) => (
                StatusCode::BAD_REQUEST,
                format!("invalid maxItems: {max_items}"),
            ),
            AdminErrorKind::InvalidWindow { from, to } => (
                StatusCode::BAD_REQUEST,
                format!("invalid time window: {from} is after {to}"),
            ),
            AdminErrorKind::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store unavailable".to_owned(),
            ),
        };

        let body = serde_json::json!({
            "error": detail,
            "id": self.message_id,
        });
        (status, Json(body)).into_response()
    }
}
