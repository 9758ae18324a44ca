//! QR encoding: summary text → PNG image.
//!
//! Every backend uses error-correction level **Q** (≈25 % of codewords
//! recoverable), which keeps the code readable after printing and
//! rescanning. The byte-mode capacity at that level (version 40) is checked
//! before any rendering, so an oversized payload fails fast with `too_long`
//! instead of burning a network round-trip.

use crate::error::{DocQrError, EncodingError, EncodingFailure};
use crate::output::QrArtifact;
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use reqwest::StatusCode;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Byte-mode capacity of a version-40 code at level Q.
pub const MAX_PAYLOAD_BYTES: usize = 1663;

/// Renders text into a scannable QR image.
#[async_trait]
pub trait QrEncoder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<QrArtifact, EncodingError>;
}

fn check_capacity(text: &str) -> Result<(), EncodingError> {
    if text.is_empty() {
        return Err(EncodingError::new(EncodingFailure::Render, "nothing to encode"));
    }
    if text.len() > MAX_PAYLOAD_BYTES {
        return Err(EncodingError::new(
            EncodingFailure::TooLong,
            format!(
                "{} bytes exceeds the {} byte capacity at level Q",
                text.len(),
                MAX_PAYLOAD_BYTES
            ),
        ));
    }
    Ok(())
}

// ── Local encoder ────────────────────────────────────────────────────────

/// In-process encoder built on the `qrcode` crate.
#[derive(Debug, Clone)]
pub struct LocalQrEncoder {
    /// Pixels per module.
    pub module_px: u32,
    /// Quiet-zone width in modules.
    pub quiet_zone: u32,
}

impl Default for LocalQrEncoder {
    fn default() -> Self {
        Self {
            module_px: 8,
            quiet_zone: 4,
        }
    }
}

impl LocalQrEncoder {
    /// Render `text` to PNG bytes.
    pub fn render_png(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        check_capacity(text)?;
        let code = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::Q).map_err(
            |e| match e {
                qrcode::types::QrError::DataTooLong => {
                    EncodingError::new(EncodingFailure::TooLong, e.to_string())
                }
                other => EncodingError::new(EncodingFailure::Render, other.to_string()),
            },
        )?;

        let modules = code.width() as u32;
        let colors = code.to_colors();
        let module_px = self.module_px.max(1);
        let side = (modules + 2 * self.quiet_zone) * module_px;
        let quiet = self.quiet_zone;

        let img = GrayImage::from_fn(side, side, |x, y| {
            let mx = (x / module_px).checked_sub(quiet);
            let my = (y / module_px).checked_sub(quiet);
            let dark = match (mx, my) {
                (Some(mx), Some(my)) if mx < modules && my < modules => {
                    colors[(my * modules + mx) as usize] == Color::Dark
                }
                _ => false,
            };
            Luma([if dark { 0 } else { 255 }])
        });

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| EncodingError::new(EncodingFailure::Render, e.to_string()))?;
        debug!(
            "QR rendered locally: {} modules, {}px, {} bytes",
            modules,
            side,
            png.len()
        );
        Ok(png)
    }
}

#[async_trait]
impl QrEncoder for LocalQrEncoder {
    async fn encode(&self, text: &str) -> Result<QrArtifact, EncodingError> {
        let encoder = self.clone();
        let owned = text.to_string();
        let png = tokio::task::spawn_blocking(move || encoder.render_png(&owned))
            .await
            .map_err(|e| EncodingError::new(EncodingFailure::Render, e.to_string()))??;
        Ok(QrArtifact {
            image_bytes: png.into(),
            encoded_text: text.to_string(),
        })
    }
}

// ── Remote encoder ───────────────────────────────────────────────────────

const QRSERVER_ENDPOINT: &str = "https://api.qrserver.com/v1/create-qr-code/";

/// Encoder backed by the public api.qrserver.com service.
#[derive(Debug, Clone)]
pub struct RemoteQrEncoder {
    http: reqwest::Client,
    endpoint: String,
    size_px: u32,
}

impl RemoteQrEncoder {
    pub fn new(timeout: Duration) -> Result<Self, DocQrError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DocQrError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: QRSERVER_ENDPOINT.to_string(),
            size_px: 300,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl QrEncoder for RemoteQrEncoder {
    async fn encode(&self, text: &str) -> Result<QrArtifact, EncodingError> {
        check_capacity(text)?;
        let size = format!("{0}x{0}", self.size_px);
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("data", text),
                ("size", size.as_str()),
                ("format", "png"),
                ("ecc", "Q"),
                ("qzone", "4"),
            ])
            .send()
            .await
            .map_err(|e| EncodingError::new(EncodingFailure::Network, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match status {
                StatusCode::TOO_MANY_REQUESTS => EncodingFailure::RateLimit,
                s if s.is_server_error() => EncodingFailure::Network,
                _ => EncodingFailure::Service,
            };
            return Err(EncodingError::new(reason, format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EncodingError::new(EncodingFailure::Network, e.to_string()))?;
        image::load_from_memory(&bytes).map_err(|e| {
            EncodingError::new(
                EncodingFailure::Service,
                format!("response is not an image: {e}"),
            )
        })?;
        debug!("QR rendered remotely: {} bytes", bytes.len());

        Ok(QrArtifact {
            image_bytes: bytes.to_vec().into(),
            encoded_text: text.to_string(),
        })
    }
}
