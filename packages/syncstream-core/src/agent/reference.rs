//! Reference audio access for the receiver agent.
//!
//! Drift measurement needs a window of the program audio exactly as the
//! transmitter played it. Remote receivers fetch it over HTTP from the
//! reference service; a loopback receiver can read the ring directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::audio::{AudioRing, PcmWindow};
use crate::error::{SyncError, SyncResult};
use crate::protocol::constants::REFERENCE_FETCH_TIMEOUT_SECS;

/// Source of reference windows.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    /// Fetches `duration_s` seconds of reference audio ending
    /// `offset_s` seconds from the newest sample (negative = past).
    async fn fetch(&self, duration_s: f32, offset_s: f32) -> SyncResult<PcmWindow>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Client
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP client against the transmitter's reference service.
pub struct HttpReferenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpReferenceClient {
    /// Creates a client for `base_url` (e.g. `http://transmitter:8080`).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Fatal`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REFERENCE_FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Probes the transmitter's `/health` endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TransientTransport`] when the transmitter is
    /// unreachable or answers with an unexpected service id.
    pub async fn health_check(&self) -> SyncResult<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::TransientTransport(format!("health check failed: {}", e)))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::TransientTransport(format!("health check failed: {}", e)))?;
        if body.get("service").and_then(|v| v.as_str())
            == Some(crate::protocol::constants::SERVICE_ID)
        {
            Ok(())
        } else {
            Err(SyncError::TransientTransport(format!(
                "{} is not a SyncStream transmitter",
                self.base_url
            )))
        }
    }

    fn parse_header<T: std::str::FromStr>(
        response: &reqwest::Response,
        name: &str,
    ) -> Option<T> {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

#[async_trait]
impl ReferenceSource for HttpReferenceClient {
    async fn fetch(&self, duration_s: f32, offset_s: f32) -> SyncResult<PcmWindow> {
        let url = format!("{}/api/audio/buffer", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("duration", duration_s.to_string()),
                ("offset", offset_s.to_string()),
                ("format", "raw_f32le".to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                SyncError::TransientTransport(format!("reference fetch failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(SyncError::TransientTransport(format!(
                "reference fetch returned {}",
                response.status()
            )));
        }

        let sample_rate: u32 = Self::parse_header(&response, "x-sample-rate").unwrap_or(44_100);
        let channels: u16 = Self::parse_header(&response, "x-channels").unwrap_or(2);

        let bytes = response.bytes().await.map_err(|e| {
            SyncError::TransientTransport(format!("reference body read failed: {}", e))
        })?;
        if bytes.len() % 4 != 0 {
            return Err(SyncError::InvalidMessage(format!(
                "reference payload of {} bytes is not whole f32 samples",
                bytes.len()
            )));
        }

        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        PcmWindow::new(samples, channels, sample_rate).map_err(SyncError::InvalidMessage)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ring Loopback
// ─────────────────────────────────────────────────────────────────────────────

/// Reference source reading an in-process [`AudioRing`] directly (loopback
/// receivers and tests).
pub struct RingReference {
    ring: Arc<AudioRing>,
}

impl RingReference {
    /// Wraps a ring.
    #[must_use]
    pub fn new(ring: Arc<AudioRing>) -> Self {
        Self { ring }
    }
}

#[async_trait]
impl ReferenceSource for RingReference {
    async fn fetch(&self, duration_s: f32, offset_s: f32) -> SyncResult<PcmWindow> {
        let read = self.ring.read(duration_s, offset_s)?;
        Ok(read.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;

    #[tokio::test]
    async fn ring_reference_returns_windows() {
        let ring = Arc::new(
            AudioRing::new(RingConfig {
                sample_rate: 44_100,
                channels: 1,
                buffer_seconds: 5.0,
            })
            .unwrap(),
        );
        ring.write(&PcmWindow::mono(vec![0.25; 88_200], 44_100));

        let reference = RingReference::new(ring);
        let window = reference.fetch(1.0, 0.0).await.unwrap();
        assert_eq!(window.frames(), 44_100);
        assert!(window.samples().iter().all(|&s| s == 0.25));
    }

    #[test]
    fn http_client_normalizes_base_url() {
        let client = HttpReferenceClient::new("http://transmitter:8080/").unwrap();
        assert_eq!(client.base_url, "http://transmitter:8080");
    }

    #[tokio::test]
    async fn http_client_round_trips_against_reference_service() {
        use crate::api::{api_router, AppState};

        let ring = Arc::new(
            AudioRing::new(RingConfig {
                sample_rate: 44_100,
                channels: 2,
                buffer_seconds: 10.0,
            })
            .unwrap(),
        );
        ring.write(&PcmWindow::new(vec![0.5f32; 44_100 * 2], 2, 44_100).unwrap());

        let app = api_router(AppState {
            ring,
            controller: None,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = HttpReferenceClient::new(format!("http://{}", addr)).unwrap();
        client.health_check().await.unwrap();

        let window = client.fetch(0.5, 0.0).await.unwrap();
        assert_eq!(window.sample_rate(), 44_100);
        assert_eq!(window.channels(), 2);
        assert_eq!(window.frames(), 22_050);
        assert!(window.samples().iter().all(|&s| s == 0.5));
    }
}
