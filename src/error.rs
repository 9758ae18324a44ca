//! Error types for the edgequake-docqr library.
//!
//! Two families of errors reflect two distinct failure modes:
//!
//! * [`DocQrError`]: **fatal, outside a run**. The pipeline cannot even be
//!   set up (unreadable config, bad CLI input, history file not writable).
//!   Returned as `Err(DocQrError)` from constructors and the history API.
//!
//! * Stage errors ([`ExtractionError`], [`SummarizationError`],
//!   [`EncodingError`], [`ConversionError`], [`AnnotationError`],
//!   [`DeliveryError`]) are raised by a single pipeline stage. They never escape
//!   [`crate::Pipeline::process`]; the orchestrator classifies them through
//!   [`Retryable`] and folds their message into the run's
//!   [`crate::output::StageStatus`].

use crate::retry::Retryable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that happen outside a pipeline run.
#[derive(Debug, Error)]
pub enum DocQrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Backend errors ────────────────────────────────────────────────────
    /// A backend could not be constructed (missing API key, bad sender address…).
    #[error("Backend '{backend}' is not configured.\n{hint}")]
    BackendNotConfigured { backend: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or config-file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file exists but could not be read.
    #[error("Failed to read configuration '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::AppConfig`].
    #[error("Failed to parse configuration '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a file (config, output PDF).
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The history log could not be opened, read or appended to.
    #[error("History log '{path}' I/O error: {source}")]
    HistoryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A run record could not be serialised.
    #[error("Failed to encode run record: {0}")]
    HistoryEncode(#[from] serde_json::Error),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Extraction ───────────────────────────────────────────────────────────

/// Failure reading text out of the input document. Always unrecoverable.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    /// The bytes could not be read at all.
    #[error("Cannot read '{filename}': {detail}")]
    Unreadable { filename: String, detail: String },

    /// The file is readable but is not a `.docx` (ZIP) container.
    #[error("'{filename}' is not a Word document (first bytes: {magic:02x?})")]
    NotADocument { filename: String, magic: Vec<u8> },

    /// The container or its XML is damaged.
    #[error("'{filename}' is a corrupt Word document: {detail}")]
    Corrupt { filename: String, detail: String },

    /// The document parsed fine but has no text to summarise.
    #[error("'{filename}' contains no extractable text")]
    Empty { filename: String },
}

impl Retryable for ExtractionError {
    fn is_retryable(&self) -> bool {
        false
    }
}

// ── Summarization ────────────────────────────────────────────────────────

/// Why a summarization call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizationFailure {
    /// Credential rejected by the model provider.
    Auth,
    /// Provider returned HTTP 429 or equivalent.
    RateLimit,
    /// Timeout, connection failure or 5xx.
    Network,
    /// Nothing to summarise.
    EmptyInput,
    /// The provider answered, but with nothing usable.
    InvalidResponse,
}

impl SummarizationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::EmptyInput => "empty_input",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for SummarizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the summarization stage.
#[derive(Debug, Clone, Error)]
#[error("Summarization failed ({reason}): {detail}")]
pub struct SummarizationError {
    pub reason: SummarizationFailure,
    pub detail: String,
}

impl SummarizationError {
    pub fn new(reason: SummarizationFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl Retryable for SummarizationError {
    fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            SummarizationFailure::RateLimit | SummarizationFailure::Network
        )
    }
}

// ── QR encoding ──────────────────────────────────────────────────────────

/// Why QR encoding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingFailure {
    /// Payload exceeds the capacity of the chosen error-correction level.
    TooLong,
    /// Remote renderer throttled us.
    RateLimit,
    /// Timeout, connection failure or 5xx from the remote renderer.
    Network,
    /// Remote renderer rejected the request or returned garbage.
    Service,
    /// Local rendering or PNG encoding failed.
    Render,
}

impl EncodingFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooLong => "too_long",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Service => "service",
            Self::Render => "render",
        }
    }
}

impl fmt::Display for EncodingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the QR encoding stage.
#[derive(Debug, Clone, Error)]
#[error("QR encoding failed ({reason}): {detail}")]
pub struct EncodingError {
    pub reason: EncodingFailure,
    pub detail: String,
}

impl EncodingError {
    pub fn new(reason: EncodingFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl Retryable for EncodingError {
    fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            EncodingFailure::RateLimit | EncodingFailure::Network
        )
    }
}

// ── Conversion ───────────────────────────────────────────────────────────

/// Why DOCX → PDF conversion failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionFailure {
    /// Local converter binary missing or not executable.
    ToolUnavailable,
    /// Remote service quota or rate limit hit.
    QuotaExceeded,
    /// The converter rejected the document.
    MalformedInput,
    /// The converter did not finish in time.
    Timeout,
    /// Remote service rejected the API key.
    Auth,
    /// Remote service returned 5xx or could not be reached.
    ServiceUnavailable,
}

impl ConversionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolUnavailable => "tool_unavailable",
            Self::QuotaExceeded => "quota_exceeded",
            Self::MalformedInput => "malformed_input",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the conversion stage.
#[derive(Debug, Clone, Error)]
#[error("PDF conversion failed ({reason}): {detail}")]
pub struct ConversionError {
    pub reason: ConversionFailure,
    pub detail: String,
}

impl ConversionError {
    pub fn new(reason: ConversionFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl Retryable for ConversionError {
    fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            ConversionFailure::Timeout
                | ConversionFailure::QuotaExceeded
                | ConversionFailure::ServiceUnavailable
        )
    }
}

// ── Annotation ───────────────────────────────────────────────────────────

/// Failure inserting the QR header. Always unrecoverable.
#[derive(Debug, Clone, Error)]
pub enum AnnotationError {
    /// The PDF has no page to carry a header.
    #[error("PDF has no pages; there is no header region to annotate")]
    NoPages,

    /// The converted PDF could not be parsed or re-serialised.
    #[error("PDF could not be processed: {detail}")]
    InvalidPdf { detail: String },

    /// The QR artefact is not a decodable image.
    #[error("QR image could not be decoded: {detail}")]
    InvalidImage { detail: String },

    /// The final PDF could not be written to the output directory.
    #[error("Failed to write output PDF '{path}': {detail}")]
    OutputWrite { path: PathBuf, detail: String },
}

impl Retryable for AnnotationError {
    fn is_retryable(&self) -> bool {
        false
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────

/// Why e-mail delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// Relay rejected the credential.
    Auth,
    /// Timeout, connection failure or transient (4xx) SMTP reply.
    Network,
    /// Recipient address malformed or refused by the relay.
    RecipientInvalid,
    /// Relay permanently refused the message for another reason.
    Rejected,
}

impl DeliveryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::RecipientInvalid => "recipient_invalid",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the delivery stage.
#[derive(Debug, Clone, Error)]
#[error("E-mail delivery failed ({reason}): {detail}")]
pub struct DeliveryError {
    pub reason: DeliveryFailure,
    pub detail: String,
}

impl DeliveryError {
    pub fn new(reason: DeliveryFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        self.reason == DeliveryFailure::Network
    }
}
