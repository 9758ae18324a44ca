//! Orchestrator integration tests with stub backends.
//!
//! Text extraction, QR rendering, PDF annotation and the history log are the
//! real implementations; the LLM, the DOCX → PDF converter and SMTP are stubs
//! so every failure mode can be forced deterministically.

mod common;

use common::*;
use edgequake_docqr::error::{ConversionFailure, DeliveryFailure, SummarizationFailure};
use edgequake_docqr::{
    Document, FinalStatus, HistoryFilter, PipelineProgressCallback, ProcessOptions, RunRecord,
    StageName, StageState,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn options(out: &Path) -> ProcessOptions {
    ProcessOptions::builder().output_dir(out).build().unwrap()
}

fn state(record: &RunRecord, stage: StageName) -> StageState {
    record.stage(stage).unwrap().status
}

/// Every run record has one status per stage, in order.
fn assert_total(record: &RunRecord) {
    let stages: Vec<StageName> = record.stage_statuses.iter().map(|s| s.stage).collect();
    assert_eq!(stages, StageName::ALL.to_vec(), "one status per stage, in order");
    for s in &record.stage_statuses {
        if s.status == StageState::Failed {
            assert!(s.error_message.is_some(), "{} failed without a message", s.stage);
        }
    }
}

fn files_in(dir: &Path, ext: &str) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|e| e == ext))
                .collect()
        })
        .unwrap_or_default()
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_run_writes_annotated_pdf_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("output");
    let history = history_in(dir.path()).await;
    let pipeline = builder(Arc::clone(&history)).build().unwrap();

    let record = pipeline
        .process(&contract("Contrato Locação.docx"), &options(&out))
        .await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Success);
    assert_eq!(state(&record, StageName::Deliver), StageState::Skipped);
    assert!(!record.email_sent);

    let summary = record.summary.as_ref().unwrap();
    assert_eq!(summary.text, SUMMARY);
    assert!(summary.source_char_count > 0);

    let pdf_path = PathBuf::from(record.output_pdf_ref.as_ref().unwrap());
    assert!(pdf_path.starts_with(&out));
    let name = pdf_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("Contrato Locação_final_"), "{name}");
    assert_eq!(page_count(&pdf_path), 2, "annotation preserves page count");

    assert_eq!(embedded_qr_text(&pdf_path), summary.text);

    let qr_path = PathBuf::from(record.qr_image_ref.as_ref().unwrap());
    assert!(std::fs::read(&qr_path).unwrap().starts_with(b"\x89PNG"));

    let stored = history.get(record.run_id).await.unwrap();
    assert_eq!(stored, Some(record));
}

#[tokio::test]
async fn qr_image_is_optional() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = builder(history_in(dir.path()).await).build().unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .persist_qr_image(false)
        .build()
        .unwrap();

    let record = pipeline.process(&contract("a.docx"), &opts).await;

    assert_eq!(record.final_status, FinalStatus::Success);
    assert!(record.qr_image_ref.is_none());
    assert!(files_in(dir.path(), "png").is_empty());
}

// ── Delivery ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delivered_mail_carries_summary_and_pdf() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(StubNotifier::default());
    let pipeline = builder(history_in(dir.path()).await)
        .notifier(notifier.clone())
        .build()
        .unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .send_email(true)
        .email_recipient("cliente@example.com")
        .build()
        .unwrap();

    let record = pipeline.process(&contract("contrato.docx"), &opts).await;

    assert_eq!(record.final_status, FinalStatus::Success);
    assert!(record.email_sent);

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (mail, size) = &sent[0];
    assert_eq!(mail.recipient, "cliente@example.com");
    assert_eq!(mail.subject, "Documento Processado - contrato");
    assert!(mail.body.contains(SUMMARY));
    assert!(mail.attachment_name.ends_with(".pdf"));
    let on_disk = std::fs::read(record.output_pdf_ref.as_ref().unwrap()).unwrap();
    assert_eq!(*size, on_disk.len(), "the written PDF is the one attached");
}

#[tokio::test]
async fn delivery_failure_is_partial_and_keeps_pdf() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(StubNotifier::failing(DeliveryFailure::Auth));
    let pipeline = builder(history_in(dir.path()).await)
        .notifier(notifier.clone())
        .build()
        .unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .send_email(true)
        .email_recipient("cliente@example.com")
        .build()
        .unwrap();

    let record = pipeline.process(&contract("contrato.docx"), &opts).await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Partial);
    assert!(!record.email_sent);
    let deliver = record.stage(StageName::Deliver).unwrap();
    assert_eq!(deliver.status, StageState::Failed);
    assert_eq!(deliver.attempts, 1, "auth failures are not retried");
    assert_eq!(notifier.calls(), 1);
    assert!(Path::new(record.output_pdf_ref.as_ref().unwrap()).exists());
}

#[tokio::test]
async fn network_delivery_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(StubNotifier::failing(DeliveryFailure::Network));
    let pipeline = builder(history_in(dir.path()).await)
        .notifier(notifier.clone())
        .build()
        .unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .send_email(true)
        .email_recipient("cliente@example.com")
        .build()
        .unwrap();

    let record = pipeline.process(&contract("contrato.docx"), &opts).await;

    assert_eq!(record.stage(StageName::Deliver).unwrap().attempts, 3);
    assert_eq!(notifier.calls(), 3);
    assert_eq!(record.final_status, FinalStatus::Partial);
}

#[tokio::test]
async fn email_requested_without_notifier_fails_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = builder(history_in(dir.path()).await).build().unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .send_email(true)
        .email_recipient("cliente@example.com")
        .build()
        .unwrap();

    let record = pipeline.process(&contract("contrato.docx"), &opts).await;

    assert_eq!(state(&record, StageName::Deliver), StageState::Failed);
    assert_eq!(record.final_status, FinalStatus::Partial);
}

// ── Unrecoverable failures ───────────────────────────────────────────────────

#[tokio::test]
async fn corrupt_input_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(StubSummarizer::ok());
    let converter = Arc::new(StubConverter::ok(1));
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(summarizer.clone())
        .converter(converter.clone())
        .build()
        .unwrap();

    let doc = Document::from_bytes("quebrado.docx", b"isto nao e um zip".to_vec());
    let record = pipeline.process(&doc, &options(dir.path())).await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Failed);
    assert_eq!(state(&record, StageName::Extract), StageState::Failed);
    for stage in &StageName::ALL[1..] {
        assert_eq!(state(&record, *stage), StageState::Skipped, "{stage}");
    }
    assert_eq!(summarizer.calls(), 0);
    assert_eq!(converter.calls(), 0);
    assert!(record.output_pdf_ref.is_none());
    assert!(files_in(dir.path(), "pdf").is_empty());
}

#[tokio::test]
async fn unresolved_input_still_leaves_one_history_record() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_in(dir.path()).await;
    let summarizer = Arc::new(StubSummarizer::ok());
    let pipeline = builder(Arc::clone(&history))
        .summarizer(summarizer.clone())
        .build()
        .unwrap();
    let missing = dir.path().join("ausente.docx");
    let err = Document::from_path(&missing).unwrap_err();

    let record = pipeline
        .record_unresolved("ausente.docx", err, &options(dir.path()))
        .await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Failed);
    assert_eq!(record.input_filename, "ausente.docx");
    let extract = record.stage(StageName::Extract).unwrap();
    assert_eq!(extract.status, StageState::Failed);
    assert!(extract
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Cannot read 'ausente.docx'"));
    for stage in &StageName::ALL[1..] {
        assert_eq!(state(&record, *stage), StageState::Skipped, "{stage}");
    }
    assert_eq!(summarizer.calls(), 0);

    let stored = history.list(&HistoryFilter::default()).await.unwrap();
    assert_eq!(stored, vec![record]);
}

#[tokio::test]
async fn empty_document_fails_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = builder(history_in(dir.path()).await).build().unwrap();
    let doc = Document::from_bytes("vazio.docx", docx(&["", "   "]));

    let record = pipeline.process(&doc, &options(dir.path())).await;

    assert_eq!(state(&record, StageName::Extract), StageState::Failed);
    assert_eq!(record.final_status, FinalStatus::Failed);
}

#[tokio::test]
async fn conversion_failure_fails_run_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Arc::new(StubConverter::failing(ConversionFailure::MalformedInput));
    let pipeline = builder(history_in(dir.path()).await)
        .converter(converter.clone())
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &options(dir.path())).await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Failed);
    assert_eq!(state(&record, StageName::Convert), StageState::Failed);
    assert_eq!(state(&record, StageName::Annotate), StageState::Skipped);
    assert_eq!(converter.calls(), 1, "malformed input is not retried");
    assert!(files_in(dir.path(), "pdf").is_empty());
}

// ── Retry ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limited_summarizer_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(StubSummarizer::always(SummarizationFailure::RateLimit));
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(summarizer.clone())
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &options(dir.path())).await;

    let summarize = record.stage(StageName::Summarize).unwrap();
    assert_eq!(summarize.status, StageState::Failed);
    assert_eq!(summarize.attempts, 3);
    assert!(summarize.error_message.as_ref().unwrap().contains("rate_limit"));
    assert_eq!(summarizer.calls(), 3);
    assert_eq!(record.final_status, FinalStatus::Failed);
}

#[tokio::test]
async fn transient_summarizer_failures_recover() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(StubSummarizer::failing(2, SummarizationFailure::Network));
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(summarizer.clone())
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &options(dir.path())).await;

    assert_eq!(record.final_status, FinalStatus::Success);
    assert_eq!(record.stage(StageName::Summarize).unwrap().attempts, 3);
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(StubSummarizer::always(SummarizationFailure::Auth));
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(summarizer.clone())
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &options(dir.path())).await;

    assert_eq!(summarizer.calls(), 1);
    assert_eq!(record.stage(StageName::Summarize).unwrap().attempts, 1);
}

// ── Degraded output ──────────────────────────────────────────────────────────

#[tokio::test]
async fn degraded_output_writes_plain_pdf() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(Arc::new(StubSummarizer::always(SummarizationFailure::Auth)))
        .build()
        .unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .allow_degraded_output(true)
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &opts).await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Partial);
    assert_eq!(state(&record, StageName::Summarize), StageState::Failed);
    assert_eq!(state(&record, StageName::EncodeQr), StageState::Skipped);
    assert_eq!(state(&record, StageName::Convert), StageState::Success);
    let annotate = record.stage(StageName::Annotate).unwrap();
    assert_eq!(annotate.status, StageState::Skipped);
    assert_eq!(
        annotate.error_message.as_deref(),
        Some("no QR code available; PDF written without header")
    );
    assert!(record.summary.is_none());

    let written = PathBuf::from(record.output_pdf_ref.as_ref().unwrap());
    assert_eq!(page_count(&written), 2);
    let raw = std::fs::read(&written).unwrap();
    assert!(
        !raw.windows(8).any(|w| w == b"DocQrImg"),
        "no QR header in degraded output"
    );
}

#[tokio::test]
async fn without_degraded_output_summary_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Arc::new(StubConverter::ok(1));
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(Arc::new(StubSummarizer::always(SummarizationFailure::Auth)))
        .converter(converter.clone())
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &options(dir.path())).await;

    assert_eq!(record.final_status, FinalStatus::Failed);
    assert_eq!(converter.calls(), 0);
    assert!(files_in(dir.path(), "pdf").is_empty());
}

// ── Timeout ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_timeout_fails_in_flight_stage() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_in(dir.path()).await;
    let pipeline = builder(Arc::clone(&history))
        .summarizer(Arc::new(StubSummarizer::slow(Duration::from_secs(30))))
        .build()
        .unwrap();
    let opts = ProcessOptions::builder()
        .output_dir(dir.path())
        .run_timeout_secs(1)
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &opts).await;

    assert_total(&record);
    assert_eq!(record.final_status, FinalStatus::Failed);
    let summarize = record.stage(StageName::Summarize).unwrap();
    assert_eq!(summarize.status, StageState::Failed);
    assert_eq!(summarize.error_message.as_deref(), Some("timeout"));
    for stage in &StageName::ALL[2..] {
        assert_eq!(state(&record, *stage), StageState::Skipped, "{stage}");
    }
    assert!(record.duration_ms() < 10_000);
    assert!(history.get(record.run_id).await.unwrap().is_some());
}

// ── Concurrency & history ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_each_get_one_history_line() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_in(dir.path()).await;
    let pipeline = Arc::new(builder(Arc::clone(&history)).build().unwrap());
    let opts = options(&dir.path().join("out"));

    let mut handles = Vec::new();
    for i in 0..8 {
        let pipeline = Arc::clone(&pipeline);
        let opts = opts.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .process(&contract(&format!("contrato_{i}.docx")), &opts)
                .await
        }));
    }
    let mut records = Vec::new();
    for h in handles {
        records.push(h.await.unwrap());
    }

    assert!(records.iter().all(|r| r.final_status == FinalStatus::Success));
    let raw = std::fs::read_to_string(history.path()).unwrap();
    assert_eq!(raw.lines().count(), 8);

    let mut pdfs: Vec<&String> = records.iter().filter_map(|r| r.output_pdf_ref.as_ref()).collect();
    pdfs.sort();
    pdfs.dedup();
    assert_eq!(pdfs.len(), 8, "output paths are unique per run");
}

#[tokio::test]
async fn history_lists_failed_runs() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_in(dir.path()).await;
    let pipeline = builder(Arc::clone(&history)).build().unwrap();
    let opts = options(dir.path());

    pipeline.process(&contract("bom.docx"), &opts).await;
    let bad = Document::from_bytes("ruim.docx", b"junk".to_vec());
    let failed = pipeline.process(&bad, &opts).await;

    let listed = history
        .list(&HistoryFilter {
            status: Some(FinalStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, failed.run_id);
    assert_eq!(listed[0].input_filename, "ruim.docx");
}

// ── Progress events ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    started: Mutex<Vec<StageName>>,
    retries: AtomicUsize,
    completed: AtomicUsize,
}

impl PipelineProgressCallback for Recorder {
    fn on_stage_start(&self, stage: StageName) {
        self.started.lock().unwrap().push(stage);
    }

    fn on_stage_retry(&self, _stage: StageName, attempt: u32, _delay: Duration, _error: &str) {
        assert!(attempt >= 2);
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run_complete(&self, _record: &RunRecord) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_callback_sees_started_stages_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let pipeline = builder(history_in(dir.path()).await)
        .summarizer(Arc::new(StubSummarizer::failing(1, SummarizationFailure::Network)))
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let record = pipeline.process(&contract("c.docx"), &options(dir.path())).await;

    assert_eq!(record.final_status, FinalStatus::Success);
    assert_eq!(
        *recorder.started.lock().unwrap(),
        vec![
            StageName::Extract,
            StageName::Summarize,
            StageName::EncodeQr,
            StageName::Convert,
            StageName::Annotate,
        ],
        "skipped stages never start"
    );
    assert_eq!(recorder.retries.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
}

// ── Sync wrapper ─────────────────────────────────────────────────────────────

#[test]
fn process_sync_runs_outside_a_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let history = tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(history_in(dir.path()));
    let pipeline = builder(history).build().unwrap();

    let record = pipeline
        .process_sync(&contract("c.docx"), &options(dir.path()))
        .unwrap();

    assert_eq!(record.final_status, FinalStatus::Success);
}
