use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::ingest::{self, Delivery};
use crate::query;
use crate::source::SourceId;
use crate::state::AppState;
use crate::types::{EventRecord, Summary, TransportMeta};

#[derive(Debug, Deserialize)]
struct WebhookParams {
    verify_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct PageResponse {
    source_id: String,
    count: usize,
    events: Vec<EventRecord>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/webhook", any(handle_default_webhook))
        .route("/webhook/{source_id}", any(handle_webhook))
        .route("/logs", get(handle_summary))
        .route("/logs/{source_id}", get(handle_page))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

async fn handle_webhook(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    method: Method,
    params: Result<Query<WebhookParams>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    dispatch(&state, &source_id, method, params, &headers, body).await
}

async fn handle_default_webhook(
    State(state): State<AppState>,
    method: Method,
    params: Result<Query<WebhookParams>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let source_id = state.default_source.clone();
    dispatch(&state, &source_id, method, params, &headers, body).await
}

async fn dispatch(
    state: &AppState,
    raw_source: &str,
    method: Method,
    params: Result<Query<WebhookParams>, QueryRejection>,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    match method {
        Method::GET => {
            // Domain-ownership check from the platform: echo the token as is.
            let token = params
                .ok()
                .and_then(|Query(params)| params.verify_token)
                .filter(|token| !token.is_empty())
                .ok_or(ApiError::MissingVerifyToken)?;
            debug!(source_id = raw_source, "answering verification challenge");
            Ok(token.into_response())
        }
        // Deliveries are always acknowledged with 200; the platform redelivers
        // on anything else.
        Method::POST => {
            let source = match SourceId::parse(raw_source) {
                Ok(source) => source,
                Err(e) => {
                    warn!(source_id = raw_source, error = %e, "delivery for an invalid source dropped");
                    let ack =
                        ingest::not_persisted(raw_source, ingest::NOTE_INVALID_SOURCE, e.to_string());
                    return Ok(Json(ack).into_response());
                }
            };
            let body = match body {
                Ok(body) => body,
                Err(rejection) => {
                    let error = rejection.body_text();
                    warn!(source_id = %source, error = %error, "delivery body rejected");
                    let ack =
                        ingest::not_persisted(source.as_str(), ingest::NOTE_BODY_REJECTED, error);
                    return Ok(Json(ack).into_response());
                }
            };
            let delivery = Delivery {
                source,
                method: method.to_string(),
                payload: payload_from_body(&body),
                transport_meta: transport_meta(headers),
            };
            let ingested = state.ingestor.ingest(delivery).await;
            Ok(Json(ingested.ack).into_response())
        }
        _ => Err(ApiError::MethodNotSupported),
    }
}

/// JSON bodies are kept as parsed; anything else is kept as a string.
fn payload_from_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn transport_meta(headers: &HeaderMap) -> TransportMeta {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    TransportMeta {
        user_agent: header_str(header::USER_AGENT),
        content_type: header_str(header::CONTENT_TYPE),
    }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

async fn handle_page(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<Json<PageResponse>, ApiError> {
    let source = SourceId::parse(&source_id)?;
    let storage = state.storage().ok_or(ApiError::StorageNotConfigured)?;
    let events = query::get_page(storage, &source).await?;
    Ok(Json(PageResponse {
        source_id: source.as_str().to_string(),
        count: events.len(),
        events,
    }))
}

async fn handle_summary(State(state): State<AppState>) -> Result<Json<Summary>, ApiError> {
    let storage = state.storage().ok_or(ApiError::StorageNotConfigured)?;
    Ok(Json(query::get_summary(storage).await?))
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let storage = if state.storage().is_some() {
        "configured"
    } else {
        "not_configured"
    };
    Json(serde_json::json!({ "status": "ok", "storage": storage }))
}
