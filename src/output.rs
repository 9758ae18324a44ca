//! Run outputs: stage artefacts and the [`RunRecord`] written to history.
//!
//! Every value here is immutable once produced. [`PdfArtifact`] in particular
//! is never edited in place; annotation returns a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ── Stage artefacts ──────────────────────────────────────────────────────

/// Output of the Summarize stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResult {
    /// Cleaned, truncated summary. Never empty.
    pub text: String,
    /// Characters of extracted text the summary was produced from.
    pub source_char_count: usize,
}

/// Output of the Encode-QR stage.
#[derive(Clone)]
pub struct QrArtifact {
    /// PNG image.
    pub image_bytes: Arc<[u8]>,
    /// Exactly the text the code decodes to.
    pub encoded_text: String,
}

impl fmt::Debug for QrArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrArtifact")
            .field("image_bytes", &format_args!("{} bytes", self.image_bytes.len()))
            .field("encoded_text", &self.encoded_text)
            .finish()
    }
}

/// A PDF in memory.
#[derive(Clone)]
pub struct PdfArtifact {
    pub bytes: Arc<[u8]>,
    pub page_count: usize,
    pub has_qr_header: bool,
}

impl fmt::Debug for PdfArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfArtifact")
            .field("bytes", &format_args!("{} bytes", self.bytes.len()))
            .field("page_count", &self.page_count)
            .field("has_qr_header", &self.has_qr_header)
            .finish()
    }
}

// ── Run record ───────────────────────────────────────────────────────────

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Extract,
    Summarize,
    EncodeQr,
    Convert,
    Annotate,
    Deliver,
}

impl StageName {
    /// All stages, in the order a run executes them.
    pub const ALL: [StageName; 6] = [
        StageName::Extract,
        StageName::Summarize,
        StageName::EncodeQr,
        StageName::Convert,
        StageName::Annotate,
        StageName::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Summarize => "summarize",
            Self::EncodeQr => "encode_qr",
            Self::Convert => "convert",
            Self::Annotate => "annotate",
            Self::Deliver => "deliver",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Success,
    Failed,
    Skipped,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded status of one stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: StageName,
    pub status: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Invocations of the stage's operation (0 when skipped).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StageStatus {
    pub fn skipped(stage: StageName, message: Option<String>) -> Self {
        Self {
            stage,
            status: StageState::Skipped,
            error_message: message,
            attempts: 0,
            duration_ms: 0,
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Every required stage succeeded.
    Success,
    /// A PDF was produced but something after it (or the QR) did not happen.
    Partial,
    /// No usable output.
    Failed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one pipeline invocation.
///
/// Holds exactly one [`StageStatus`] per [`StageName`], in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub input_filename: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stage_statuses: Vec<StageStatus>,
    pub final_status: FinalStatus,
    /// Path of the final PDF, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_pdf_ref: Option<String>,
    /// Path of the persisted QR image, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryResult>,
    pub email_sent: bool,
}

impl RunRecord {
    pub fn stage(&self, stage: StageName) -> Option<&StageStatus> {
        self.stage_statuses.iter().find(|s| s.stage == stage)
    }

    /// First stage that failed, if any.
    pub fn first_failure(&self) -> Option<&StageStatus> {
        self.stage_statuses
            .iter()
            .find(|s| s.status == StageState::Failed)
    }

    /// Wall-clock duration of the run in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
