//! # edgequake-docqr
//!
//! Turn legal Word documents into PDFs that carry a QR-coded AI summary in
//! the page header, and optionally e-mail them.
//!
//! ## Why this crate?
//!
//! A notary office hands out dozens of contracts, powers of attorney and
//! declarations a day. Printing a short plain-language summary as a QR code
//! on the first page lets the recipient check what a document is about with
//! a phone, without reading ten pages of legal Portuguese. This crate runs
//! that whole chain and keeps an auditable record of every run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! DOCX (path, URL or bytes)
//!  │
//!  ├─ 1. Extract    body text from word/document.xml (spawn_blocking)
//!  ├─ 2. Summarize  Gemini or any edgequake-llm provider + cleanup
//!  ├─ 3. Encode QR  level-Q QR code as PNG (local or api.qrserver.com)
//!  ├─ 4. Convert    DOCX → PDF via LibreOffice or CloudConvert
//!  ├─ 5. Annotate   QR + label in the top-right corner (lopdf)
//!  └─ 6. Deliver    optional SMTP e-mail with the PDF attached
//!                    ↓
//!               RunRecord → history.jsonl
//! ```
//!
//! Every run yields a [`RunRecord`] with one status per stage, whether it
//! succeeded or not. Network-bound stages retry with exponential backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docqr::{AppConfig, Document, HistoryStore, Pipeline, ProcessOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("config.json")?.with_env_overrides();
//!     let history = Arc::new(HistoryStore::open(config.effective_history_path()).await?);
//!     let pipeline = Pipeline::from_config(&config, history)?;
//!
//!     let doc = Document::from_path("contrato.docx")?;
//!     let options = ProcessOptions::builder().output_dir("output").build()?;
//!     let record = pipeline.process(&doc, &options).await;
//!
//!     println!("{} → {:?}", record.final_status, record.output_pdf_ref);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docqr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docqr = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AppConfig, ConverterKind, EmailConfig, ProcessOptions, ProcessOptionsBuilder, QrBackendKind,
    QrPlacement, RetrySettings,
};
pub use document::Document;
pub use error::{
    AnnotationError, ConversionError, ConversionFailure, DeliveryError, DeliveryFailure,
    DocQrError, EncodingError, EncodingFailure, ExtractionError, SummarizationError,
    SummarizationFailure,
};
pub use history::{HistoryFilter, HistoryStore};
pub use orchestrator::{Pipeline, PipelineBuilder};
pub use output::{
    FinalStatus, PdfArtifact, QrArtifact, RunRecord, StageName, StageState, StageStatus,
    SummaryResult,
};
pub use pipeline::convert::DocumentConverter;
pub use pipeline::deliver::{Notifier, OutgoingMail};
pub use pipeline::qr::QrEncoder;
pub use pipeline::summarize::Summarizer;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use retry::{RetryPolicy, Retryable};
