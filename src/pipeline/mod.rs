//! Pipeline stages for DOCX → summarised, QR-annotated PDF.
//!
//! Each submodule implements exactly one transformation step. Stages that
//! talk to the outside world sit behind a narrow trait so the orchestrator
//! can swap backends (local vs. remote) and tests can inject stubs.
//!
//! ## Data Flow
//!
//! ```text
//! Document ──▶ extract ──▶ summarize ──▶ qr ──┐
//!    │         (zip+xml)   (LLM)        (PNG) │
//!    └──────▶ convert ─────────────────────▶ annotate ──▶ deliver
//!             (LibreOffice / CloudConvert)   (lopdf)      (SMTP)
//! ```
//!
//! 1. [`extract`]    : `.docx` body text; runs in `spawn_blocking`
//! 2. [`summarize`]  : [`summarize::Summarizer`]: Gemini or any `edgequake-llm` provider
//! 3. [`postprocess`]: deterministic cleanup + boundary-aware truncation
//! 4. [`qr`]         : [`qr::QrEncoder`]: level-Q QR code as PNG
//! 5. [`convert`]    : [`convert::DocumentConverter`]: `.docx` → PDF
//! 6. [`annotate`]   : QR header on the first (or every) page
//! 7. [`deliver`]    : [`deliver::Notifier`]: e-mail with the PDF attached

pub mod annotate;
pub mod convert;
pub mod deliver;
pub mod extract;
pub mod postprocess;
pub mod qr;
pub mod summarize;
