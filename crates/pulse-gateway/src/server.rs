//! HTTP surface: the realtime stream route plus small diagnostic routes.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use pulse_types::wire::STREAM_CONTENT_TYPE;

use crate::auth::ConnectRequest;
use crate::stream::{StreamEndpoint, StreamRejection};

pub const STREAM_PATH: &str = "/api/realtime/stream";
pub const STATUS_PATH: &str = "/api/realtime/status";

pub fn router(endpoint: Arc<StreamEndpoint>) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .route(STATUS_PATH, get(status_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(endpoint)
}

/// Bind and serve until the listener fails.
pub async fn serve(endpoint: Arc<StreamEndpoint>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Realtime gateway listening on http://{addr}{STREAM_PATH}");
    axum::serve(listener, router(endpoint))
        .await
        .context("HTTP server stopped")
}

impl IntoResponse for StreamRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
        (status, Json(self.body())).into_response()
    }
}

async fn stream_handler(
    State(endpoint): State<Arc<StreamEndpoint>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = connect_request(&headers, &query);
    let connection = match endpoint.open(&request).await {
        Ok(connection) => connection,
        Err(rejection) => return rejection.into_response(),
    };

    let mut response = Response::new(Body::from_stream(connection.into_stream()));
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform"));
    h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn status_handler(State(endpoint): State<Arc<StreamEndpoint>>) -> impl IntoResponse {
    let bus = endpoint.bus();
    Json(json!({
        "latestEventId": bus.latest_event_id(),
        "connections": bus.connection_count(),
        "heartbeat": bus.heartbeat_running(),
    }))
}

/// Token from `Authorization: Bearer …`, else the `access_token` query value.
fn connect_request(headers: &HeaderMap, query: &HashMap<String, String>) -> ConnectRequest {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    ConnectRequest {
        token: bearer.or_else(|| query.get("access_token").cloned()),
        scopes: query.get("scopes").cloned(),
    }
}
