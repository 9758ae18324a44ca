//! Pipeline orchestrator: sequences the stages of one run and records it.
//!
//! [`Pipeline::process`] is total: whatever happens inside (service outages,
//! corrupt input, a run that exceeds its time budget) it returns a complete
//! [`RunRecord`] with exactly one [`StageStatus`] per stage, and appends that
//! record to history exactly once.
//!
//! ## Failure policy
//!
//! | Stage fails            | Effect                                               |
//! |------------------------|------------------------------------------------------|
//! | Extract / Convert / Annotate | remaining stages skipped, run `failed`         |
//! | Summarize / Encode-QR  | `failed`, unless `allow_degraded_output`: then the PDF is written without a header and the run ends `partial` |
//! | Deliver                | run `partial`; the PDF stays on disk                 |
//!
//! Stages backed by external services run under their own [`RetryPolicy`].
//! The local converter always gets a single attempt.

use crate::config::{AppConfig, ConverterKind, ProcessOptions, QrBackendKind};
use crate::document::Document;
use crate::error::{DocQrError, ExtractionError};
use crate::history::HistoryStore;
use crate::output::{
    FinalStatus, PdfArtifact, QrArtifact, RunRecord, StageName, StageState, StageStatus,
    SummaryResult,
};
use crate::pipeline::annotate::annotate;
use crate::pipeline::convert::{DocumentConverter, LocalConverter, RemoteConverter};
use crate::pipeline::deliver::{Notifier, OutgoingMail, SmtpNotifier};
use crate::pipeline::extract::extract_text;
use crate::pipeline::qr::{LocalQrEncoder, QrEncoder, RemoteQrEncoder};
use crate::pipeline::summarize::{GeminiSummarizer, ProviderSummarizer, Summarizer};
use crate::progress::ProgressCallback;
use crate::prompts::{email_body, email_subject};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Message recorded on the stage that was running when the run ceiling hit.
pub const TIMEOUT_MESSAGE: &str = "timeout";

/// The document-processing pipeline with its backends.
///
/// Cheap to share behind an `Arc`; [`Pipeline::process`] takes `&self` and
/// may run concurrently for different documents.
pub struct Pipeline {
    summarizer: Arc<dyn Summarizer>,
    qr_encoder: Arc<dyn QrEncoder>,
    converter: Arc<dyn DocumentConverter>,
    notifier: Option<Arc<dyn Notifier>>,
    history: Arc<HistoryStore>,
    progress: Option<ProgressCallback>,
    summarize_retry: RetryPolicy,
    qr_retry: RetryPolicy,
    convert_retry: RetryPolicy,
    deliver_retry: RetryPolicy,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("history", &self.history.path())
            .field("converter_remote", &self.converter.is_remote())
            .field("notifier", &self.notifier.is_some())
            .field("summarize_retry", &self.summarize_retry)
            .field("qr_retry", &self.qr_retry)
            .field("convert_retry", &self.convert_retry)
            .field("deliver_retry", &self.deliver_retry)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a new builder for `Pipeline`.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Build a pipeline from the persisted configuration.
    ///
    /// * Summarizer: Gemini when `gemini_api_key` is set, otherwise any
    ///   provider `edgequake-llm` detects in the environment.
    /// * Converter: `converter`, or CloudConvert when its key is set,
    ///   otherwise LibreOffice.
    /// * QR: `qr_backend` (local by default).
    /// * Notifier: SMTP when sender and password are set.
    pub fn from_config(config: &AppConfig, history: Arc<HistoryStore>) -> Result<Self, DocQrError> {
        let summarizer: Arc<dyn Summarizer> = match config.gemini_api_key.as_deref() {
            Some(key) if !key.is_empty() => Arc::new(GeminiSummarizer::new(
                key,
                &config.gemini_model,
                Duration::from_secs(60),
            )?),
            _ => Arc::new(ProviderSummarizer::from_env()?),
        };

        let converter: Arc<dyn DocumentConverter> = match config.effective_converter() {
            ConverterKind::Local => Arc::new(LocalConverter::default()),
            ConverterKind::Remote => {
                let key = config.cloudconvert_api_key.as_deref().ok_or_else(|| {
                    DocQrError::BackendNotConfigured {
                        backend: "cloudconvert".to_string(),
                        hint: "Set cloudconvert_api_key or CLOUDCONVERT_API_KEY".to_string(),
                    }
                })?;
                Arc::new(RemoteConverter::new(key, Duration::from_secs(30))?)
            }
        };

        let qr_encoder: Arc<dyn QrEncoder> = match config.qr_backend {
            QrBackendKind::Local => Arc::new(LocalQrEncoder::default()),
            QrBackendKind::Remote => Arc::new(RemoteQrEncoder::new(Duration::from_secs(15))?),
        };

        let mut builder = Pipeline::builder()
            .summarizer(summarizer)
            .converter(converter)
            .qr_encoder(qr_encoder)
            .history(history)
            .retry(config.retry.policy());
        if config.email.is_configured() {
            builder = builder.notifier(Arc::new(SmtpNotifier::new(&config.email)?));
        }
        builder.build()
    }

    /// Attach a progress callback to an already built pipeline.
    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Run the whole pipeline for one document.
    ///
    /// Never fails: every outcome is described by the returned record, which
    /// has also been appended to history (a history write failure is logged).
    pub async fn process(&self, doc: &Document, options: &ProcessOptions) -> RunRecord {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let short_id = short(&run_id);
        info!("Run {} started for '{}'", short_id, doc.filename());
        if let Some(cb) = &self.progress {
            cb.on_run_start(doc.filename());
        }

        let mut run = RunState::new(self.progress.as_ref());
        let ctx = RunContext {
            doc,
            options,
            run_id,
            started_at,
        };

        let aborted = tokio::time::timeout(options.run_timeout(), self.run_stages(&ctx, &mut run))
            .await
            .is_err();
        if aborted {
            warn!(
                "Run {} exceeded {}s; aborting",
                short_id, options.run_timeout_secs
            );
            run.abort_in_flight();
        }
        self.finish_run(run, run_id, started_at, doc.filename(), aborted, options)
            .await
    }

    /// Record a run for an input that never became a [`Document`] (a
    /// missing file, a failed download).
    ///
    /// Extract is marked failed as unreadable and every later stage skipped,
    /// so each input leaves exactly one record in history.
    pub async fn record_unresolved(
        &self,
        filename: &str,
        detail: impl Display,
        options: &ProcessOptions,
    ) -> RunRecord {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Run {} started for '{}'", short(&run_id), filename);
        if let Some(cb) = &self.progress {
            cb.on_run_start(filename);
        }
        let mut run = RunState::new(self.progress.as_ref());
        run.begin(StageName::Extract);
        let err = ExtractionError::Unreadable {
            filename: filename.to_string(),
            detail: detail.to_string(),
        };
        run.fail(1, err.to_string());
        self.finish_run(run, run_id, started_at, filename, false, options)
            .await
    }

    /// Close out the run: skip what did not run, build the record, append it
    /// to history and notify the progress callback.
    async fn finish_run(
        &self,
        mut run: RunState<'_>,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        filename: &str,
        aborted: bool,
        options: &ProcessOptions,
    ) -> RunRecord {
        let short_id = short(&run_id);
        run.skip_remaining();

        let final_status = final_status(&run.statuses, run.output_pdf.is_some(), aborted, options);
        let email_sent = run
            .statuses
            .iter()
            .any(|s| s.stage == StageName::Deliver && s.status == StageState::Success);

        let record = RunRecord {
            run_id,
            input_filename: filename.to_string(),
            started_at,
            finished_at: Utc::now(),
            stage_statuses: run.statuses,
            final_status,
            output_pdf_ref: run.output_pdf.map(|p| p.display().to_string()),
            qr_image_ref: run.qr_image.map(|p| p.display().to_string()),
            summary: run.summary,
            email_sent,
        };

        if let Err(e) = self.history.append(&record).await {
            error!("Run {}: history write failed: {}", short_id, e);
        }
        info!(
            "Run {} finished: {} in {}ms",
            short_id,
            record.final_status,
            record.duration_ms()
        );
        if let Some(cb) = &self.progress {
            cb.on_run_complete(&record);
        }
        record
    }

    /// Synchronous wrapper around [`Pipeline::process`].
    ///
    /// Creates a temporary tokio runtime internally; do not call from inside
    /// an async context.
    pub fn process_sync(
        &self,
        doc: &Document,
        options: &ProcessOptions,
    ) -> Result<RunRecord, DocQrError> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| DocQrError::Internal(format!("Failed to create tokio runtime: {}", e)))?;
        Ok(runtime.block_on(self.process(doc, options)))
    }

    /// Stages in order. Returns early on an unrecoverable failure; the caller
    /// marks whatever did not run as skipped.
    async fn run_stages(&self, ctx: &RunContext<'_>, run: &mut RunState<'_>) {
        let opts = ctx.options;

        // ── Extract ──
        run.begin(StageName::Extract);
        let text = match extract_text(ctx.doc).await {
            Ok(text) => {
                run.succeed(1);
                text
            }
            Err(e) => {
                run.fail(1, e.to_string());
                return;
            }
        };

        // ── Summarize ──
        run.begin(StageName::Summarize);
        let summarizer = &self.summarizer;
        let text_ref = text.as_str();
        let max_chars = opts.summary_max_chars;
        let outcome = self
            .summarize_retry
            .run(
                "summarize",
                move || summarizer.summarize(text_ref, max_chars),
                retry_hook(self.progress.as_ref(), StageName::Summarize, &run.attempts),
            )
            .await;
        let summary: Option<SummaryResult> = match outcome.result {
            Ok(summary) => {
                debug!("Summary: {} chars", summary.text.chars().count());
                run.succeed(outcome.attempts);
                Some(summary)
            }
            Err(e) => {
                run.fail(outcome.attempts, e.to_string());
                if !opts.allow_degraded_output {
                    return;
                }
                warn!("Summarization failed; continuing without QR header");
                None
            }
        };
        run.summary = summary.clone();

        // ── Encode QR ──
        let qr: Option<QrArtifact> = match &summary {
            None => {
                run.skip(StageName::EncodeQr, "no summary to encode");
                None
            }
            Some(summary) => {
                run.begin(StageName::EncodeQr);
                let encoder = &self.qr_encoder;
                let summary_text = summary.text.as_str();
                let outcome = self
                    .qr_retry
                    .run(
                        "encode_qr",
                        move || encoder.encode(summary_text),
                        retry_hook(self.progress.as_ref(), StageName::EncodeQr, &run.attempts),
                    )
                    .await;
                match outcome.result {
                    Ok(artifact) => {
                        run.succeed(outcome.attempts);
                        Some(artifact)
                    }
                    Err(e) => {
                        run.fail(outcome.attempts, e.to_string());
                        if !opts.allow_degraded_output {
                            return;
                        }
                        warn!("QR encoding failed; continuing without QR header");
                        None
                    }
                }
            }
        };

        // ── Convert ──
        run.begin(StageName::Convert);
        let converter = &self.converter;
        let doc = ctx.doc;
        let policy = if converter.is_remote() {
            self.convert_retry
        } else {
            RetryPolicy::none()
        };
        let outcome = policy
            .run(
                "convert",
                move || converter.convert(doc),
                retry_hook(self.progress.as_ref(), StageName::Convert, &run.attempts),
            )
            .await;
        let pdf = match outcome.result {
            Ok(pdf) => {
                debug!("Converted: {} pages, {} bytes", pdf.page_count, pdf.bytes.len());
                run.succeed(outcome.attempts);
                pdf
            }
            Err(e) => {
                run.fail(outcome.attempts, e.to_string());
                return;
            }
        };

        // ── Annotate (+ write) ──
        let pdf_path = output_path(ctx, "final", "pdf");
        let final_pdf: PdfArtifact = match &qr {
            Some(qr) => {
                run.begin(StageName::Annotate);
                let annotated = match annotate(&pdf, qr, &opts.qr_label, opts.qr_placement).await {
                    Ok(annotated) => annotated,
                    Err(e) => {
                        run.fail(1, e.to_string());
                        return;
                    }
                };
                if let Err(e) = write_atomic(&pdf_path, &annotated.bytes).await {
                    run.fail(1, format!("Failed to write '{}': {}", pdf_path.display(), e));
                    return;
                }
                run.output_pdf = Some(pdf_path.clone());
                if opts.persist_qr_image {
                    let qr_path = output_path(ctx, "qr", "png");
                    match write_atomic(&qr_path, &qr.image_bytes).await {
                        Ok(()) => run.qr_image = Some(qr_path),
                        Err(e) => warn!("QR image not saved ({}): {}", qr_path.display(), e),
                    }
                }
                run.succeed(1);
                annotated
            }
            None => {
                // Degraded output: the converted PDF as-is.
                run.begin(StageName::Annotate);
                if let Err(e) = write_atomic(&pdf_path, &pdf.bytes).await {
                    run.fail(1, format!("Failed to write '{}': {}", pdf_path.display(), e));
                    return;
                }
                run.output_pdf = Some(pdf_path.clone());
                run.close_skipped("no QR code available; PDF written without header");
                pdf
            }
        };
        info!("Output written: {}", pdf_path.display());

        // ── Deliver ──
        if !opts.send_email {
            run.skip(StageName::Deliver, "e-mail not requested");
            return;
        }
        run.begin(StageName::Deliver);
        let Some(recipient) = opts.email_recipient.as_deref().filter(|r| !r.is_empty()) else {
            run.fail(0, "e-mail requested but no recipient given".to_string());
            return;
        };
        let Some(notifier) = self.notifier.as_ref() else {
            run.fail(0, "e-mail requested but delivery is not configured".to_string());
            return;
        };
        let attachment_name = pdf_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.pdf", ctx.doc.stem()));
        let mail = OutgoingMail {
            recipient: recipient.to_string(),
            subject: email_subject(ctx.doc.stem()),
            body: email_body(summary.as_ref().map(|s| s.text.as_str())),
            attachment_name,
        };
        let mail_ref = &mail;
        let pdf_ref = &final_pdf;
        let outcome = self
            .deliver_retry
            .run(
                "deliver",
                move || notifier.send(pdf_ref, mail_ref),
                retry_hook(self.progress.as_ref(), StageName::Deliver, &run.attempts),
            )
            .await;
        match outcome.result {
            Ok(()) => run.succeed(outcome.attempts),
            Err(e) => run.fail(outcome.attempts, e.to_string()),
        }
    }
}

/// Per-run inputs shared by all stages.
struct RunContext<'a> {
    doc: &'a Document,
    options: &'a ProcessOptions,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

/// `<output_dir>/<stem>_<kind>_<YYYYmmdd_HHMMSS>_<run8>.<ext>`
fn output_path(ctx: &RunContext<'_>, kind: &str, ext: &str) -> PathBuf {
    ctx.options.output_dir.join(format!(
        "{}_{}_{}_{}.{}",
        ctx.doc.stem(),
        kind,
        ctx.started_at.format("%Y%m%d_%H%M%S"),
        short(&ctx.run_id),
        ext
    ))
}

fn short(run_id: &Uuid) -> String {
    run_id.to_string()[..8].to_string()
}

/// Atomic write: temp file in the same directory, then rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let written = match tokio::fs::write(&tmp, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}

/// Forward retry events to the progress callback and track the attempt
/// number of the stage in flight.
fn retry_hook<'a, E: Display>(
    progress: Option<&'a ProgressCallback>,
    stage: StageName,
    attempts: &'a AtomicU32,
) -> impl FnMut(u32, Duration, &E) + 'a {
    move |attempt, delay, err| {
        attempts.store(attempt, Ordering::SeqCst);
        if let Some(cb) = progress {
            cb.on_stage_retry(stage, attempt, delay, &err.to_string());
        }
    }
}

fn final_status(
    statuses: &[StageStatus],
    pdf_written: bool,
    aborted: bool,
    options: &ProcessOptions,
) -> FinalStatus {
    if aborted || !pdf_written {
        return FinalStatus::Failed;
    }
    let all_ok = statuses.iter().all(|s| {
        s.status == StageState::Success
            || (s.stage == StageName::Deliver
                && s.status == StageState::Skipped
                && !options.send_email)
    });
    if all_ok {
        FinalStatus::Success
    } else {
        FinalStatus::Partial
    }
}

// ── Run bookkeeping ──────────────────────────────────────────────────────

/// Accumulates stage statuses in order. Each stage is closed exactly once.
struct RunState<'a> {
    progress: Option<&'a ProgressCallback>,
    statuses: Vec<StageStatus>,
    in_flight: Option<(StageName, Instant)>,
    /// Attempt number of the stage in flight (updated by retry hooks).
    attempts: AtomicU32,
    summary: Option<SummaryResult>,
    output_pdf: Option<PathBuf>,
    qr_image: Option<PathBuf>,
}

impl<'a> RunState<'a> {
    fn new(progress: Option<&'a ProgressCallback>) -> Self {
        Self {
            progress,
            statuses: Vec::with_capacity(StageName::ALL.len()),
            in_flight: None,
            attempts: AtomicU32::new(0),
            summary: None,
            output_pdf: None,
            qr_image: None,
        }
    }

    fn begin(&mut self, stage: StageName) {
        info!("Stage {} started", stage);
        self.attempts.store(1, Ordering::SeqCst);
        self.in_flight = Some((stage, Instant::now()));
        if let Some(cb) = self.progress {
            cb.on_stage_start(stage);
        }
    }

    fn succeed(&mut self, attempts: u32) {
        self.close(StageState::Success, attempts, None);
    }

    fn fail(&mut self, attempts: u32, message: String) {
        self.close(StageState::Failed, attempts, Some(message));
    }

    /// Close the stage in flight without having done its work.
    fn close_skipped(&mut self, reason: &str) {
        self.close(StageState::Skipped, 0, Some(reason.to_string()));
    }

    fn close(&mut self, status: StageState, attempts: u32, message: Option<String>) {
        let Some((stage, started)) = self.in_flight.take() else {
            return;
        };
        let detail = message.as_deref().unwrap_or("");
        match status {
            StageState::Success => {
                info!("Stage {} succeeded ({} attempt(s))", stage, attempts)
            }
            StageState::Skipped => debug!("Stage {} skipped: {}", stage, detail),
            StageState::Failed => warn!(
                "Stage {} failed after {} attempt(s): {}",
                stage, attempts, detail
            ),
        }
        let ok = status != StageState::Failed;
        if let Some(cb) = self.progress {
            cb.on_stage_finish(stage, ok, message.as_deref());
        }
        self.statuses.push(StageStatus {
            stage,
            status,
            error_message: message,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn skip(&mut self, stage: StageName, reason: &str) {
        debug!("Stage {} skipped: {}", stage, reason);
        self.statuses
            .push(StageStatus::skipped(stage, Some(reason.to_string())));
    }

    /// Close the stage that was running when the run was cut short.
    fn abort_in_flight(&mut self) {
        if self.in_flight.is_some() {
            let attempts = self.attempts.load(Ordering::SeqCst);
            self.fail(attempts, TIMEOUT_MESSAGE.to_string());
        }
    }

    /// Mark every stage not yet recorded as skipped.
    fn skip_remaining(&mut self) {
        let cause = self
            .statuses
            .iter()
            .rev()
            .find(|s| s.status == StageState::Failed)
            .map(|s| format!("not run: {} failed", s.stage));
        for stage in &StageName::ALL[self.statuses.len()..] {
            self.statuses
                .push(StageStatus::skipped(*stage, cause.clone()));
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Builder for [`Pipeline`].
///
/// A summarizer, a converter and a history store are required; the QR
/// encoder defaults to [`LocalQrEncoder`] and delivery is disabled unless a
/// notifier is supplied.
#[derive(Default)]
pub struct PipelineBuilder {
    summarizer: Option<Arc<dyn Summarizer>>,
    qr_encoder: Option<Arc<dyn QrEncoder>>,
    converter: Option<Arc<dyn DocumentConverter>>,
    notifier: Option<Arc<dyn Notifier>>,
    history: Option<Arc<HistoryStore>>,
    progress: Option<ProgressCallback>,
    summarize_retry: RetryPolicy,
    qr_retry: RetryPolicy,
    convert_retry: RetryPolicy,
    deliver_retry: RetryPolicy,
}

impl PipelineBuilder {
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn qr_encoder(mut self, encoder: Arc<dyn QrEncoder>) -> Self {
        self.qr_encoder = Some(encoder);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    /// Use the same retry policy for every external-service stage.
    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.summarize_retry(policy)
            .qr_retry(policy)
            .convert_retry(policy)
            .deliver_retry(policy)
    }

    pub fn summarize_retry(mut self, policy: RetryPolicy) -> Self {
        self.summarize_retry = policy;
        self
    }

    pub fn qr_retry(mut self, policy: RetryPolicy) -> Self {
        self.qr_retry = policy;
        self
    }

    /// Only applies to remote converters.
    pub fn convert_retry(mut self, policy: RetryPolicy) -> Self {
        self.convert_retry = policy;
        self
    }

    pub fn deliver_retry(mut self, policy: RetryPolicy) -> Self {
        self.deliver_retry = policy;
        self
    }

    pub fn build(self) -> Result<Pipeline, DocQrError> {
        let missing = |what: &str| DocQrError::InvalidConfig(format!("pipeline needs a {what}"));
        Ok(Pipeline {
            summarizer: self.summarizer.ok_or_else(|| missing("summarizer"))?,
            qr_encoder: self
                .qr_encoder
                .unwrap_or_else(|| Arc::new(LocalQrEncoder::default())),
            converter: self.converter.ok_or_else(|| missing("converter"))?,
            notifier: self.notifier,
            history: self.history.ok_or_else(|| missing("history store"))?,
            progress: self.progress,
            summarize_retry: self.summarize_retry,
            qr_retry: self.qr_retry,
            convert_retry: self.convert_retry,
            deliver_retry: self.deliver_retry,
        })
    }
}
