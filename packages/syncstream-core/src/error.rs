//! Centralized error types for the SyncStream core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes for the reference API
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the SyncStream control plane.
///
/// The variants mirror the failure policies of the sync pipeline: transient
/// transport problems are retried by their callers, invalid measurements and
/// messages are dropped without mutating state, and only `Fatal` takes a
/// component out of service.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SyncError {
    /// Message bus disconnect, reference fetch timeout, or similar.
    /// Callers retry with backoff; individual attempts are not surfaced.
    #[error("Transport error: {0}")]
    TransientTransport(String),

    /// A drift measurement failed validation (low correlation, out of
    /// range, or jump guard). Counted, never applied.
    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    /// A protocol message failed schema or enum validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Drift or status arrived for a device that never registered.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Ring under-run or a full queue at the receiver. Oldest data is
    /// dropped and processing continues.
    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested data is not available yet (e.g. empty audio ring).
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Unrecoverable startup or allocation failure. The component enters
    /// a failed state; a supervisor may restart it.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientTransport(_) => "transient_transport",
            Self::InvalidMeasurement(_) => "invalid_measurement",
            Self::InvalidMessage(_) => "invalid_message",
            Self::UnknownDevice(_) => "unknown_device",
            Self::ResourceExhaustion(_) => "resource_exhausted",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::UnknownDevice(_) => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for SyncError {
    fn code(&self) -> &'static str {
        SyncError::code(self)
    }
}

/// Convenient Result alias for library-wide operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl From<crate::dsp::MeasurementError> for SyncError {
    fn from(err: crate::dsp::MeasurementError) -> Self {
        Self::InvalidMeasurement(err.to_string())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_maps_to_bad_request() {
        let err = SyncError::InvalidRequest("duration must be > 0".into());
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn service_unavailable_maps_to_503() {
        let err = SyncError::ServiceUnavailable("no audio written yet".into());
        assert_eq!(err.code(), "service_unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn unknown_device_maps_to_not_found() {
        let err = SyncError::UnknownDevice("kitchen".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
