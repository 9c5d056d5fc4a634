//! HTTP surface of the transmitter.
//!
//! Serves reference audio windows out of the [`AudioRing`] for drift
//! measurement, plus ring info and a health probe. Responses carry the
//! PCM metadata in `X-*` headers so the raw body stays pure sample data.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audio::AudioRing;
use crate::error::SyncError;
use crate::protocol::constants::SERVICE_ID;
use crate::sync::SyncController;

/// Shared state behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub ring: Arc<AudioRing>,
    /// Present on the transmitter; `None` for a bare reference server.
    pub controller: Option<Arc<SyncController>>,
}

/// Builds the transmitter's API router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/audio/buffer", get(audio_buffer))
        .route("/api/audio/info", get(audio_info))
        .route("/api/sync/status", get(sync_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Requested payload encoding for the buffer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BufferFormat {
    RawF32le,
    /// Accepted alias used by early receivers.
    Raw,
    Json,
}

impl Default for BufferFormat {
    fn default() -> Self {
        Self::RawF32le
    }
}

#[derive(Debug, Deserialize)]
struct BufferQuery {
    duration: f32,
    #[serde(default)]
    offset: f32,
    #[serde(default)]
    format: Option<BufferFormat>,
}

async fn audio_buffer(
    State(state): State<AppState>,
    Query(query): Query<BufferQuery>,
) -> Result<Response, SyncError> {
    let read = state.ring.read(query.duration, query.offset)?;
    let window = &read.window;

    let mut headers = HeaderMap::new();
    headers.insert("x-sample-rate", header_value(window.sample_rate()));
    headers.insert("x-channels", header_value(window.channels()));
    headers.insert("x-samples", header_value(window.frames()));
    headers.insert(
        "x-start-time",
        HeaderValue::from_str(&format!("{:.6}", read.start_time_s))
            .unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-short",
        HeaderValue::from_static(if read.short { "true" } else { "false" }),
    );

    match query.format.unwrap_or_default() {
        BufferFormat::RawF32le | BufferFormat::Raw => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            let bytes: Vec<u8> = bytemuck::cast_slice(window.samples()).to_vec();
            Ok((StatusCode::OK, headers, bytes).into_response())
        }
        BufferFormat::Json => {
            let body = json!({
                "audio_data": window.samples(),
                "sample_rate": window.sample_rate(),
                "channels": window.channels(),
                "samples": window.frames(),
                "duration": window.duration_secs(),
                "start_time_s": read.start_time_s,
                "short": read.short,
            });
            Ok((StatusCode::OK, headers, Json(body)).into_response())
        }
    }
}

async fn audio_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ring.info())
}

async fn sync_status(State(state): State<AppState>) -> Result<Response, SyncError> {
    let controller = state.controller.as_ref().ok_or_else(|| {
        SyncError::ServiceUnavailable("no sync controller on this node".to_string())
    })?;
    Ok(Json(controller.snapshot()).into_response())
}

fn header_value<T: ToString>(value: T) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or(HeaderValue::from_static("0"))
}
