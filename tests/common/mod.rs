//! Shared fixtures and stub backends for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_docqr::error::{
    ConversionError, ConversionFailure, DeliveryError, DeliveryFailure, SummarizationError,
    SummarizationFailure,
};
use edgequake_docqr::{
    Document, DocumentConverter, HistoryStore, Notifier, OutgoingMail, PdfArtifact, Pipeline,
    PipelineBuilder, RetryPolicy, Summarizer, SummaryResult,
};
use lopdf::{dictionary, Object, Stream};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zip::write::SimpleFileOptions;

pub const SUMMARY: &str = "Contrato de locação residencial entre Maria Silva e João Souza, \
                           prazo de 30 meses, aluguel de R$ 2.500,00.";

// ── Fixtures ─────────────────────────────────────────────────────────────────

/// A minimal `.docx` whose body holds `paragraphs`.
pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{p}</w:t></w:r></w:p>"))
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
         <w:body>{body}</w:body></w:document>"
    );
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("[Content_Types].xml", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"<Types/>").unwrap();
    writer
        .start_file("word/document.xml", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn contract(name: &str) -> Document {
    Document::from_bytes(
        name,
        docx(&[
            "CONTRATO DE LOCAÇÃO RESIDENCIAL",
            "LOCADORA: Maria Silva, brasileira, CPF 000.000.000-00.",
            "LOCATÁRIO: João Souza, brasileiro, CPF 111.111.111-11.",
            "Cláusula 1ª: O prazo da locação é de 30 meses.",
        ]),
    )
}

/// A PDF with one Helvetica text line per page.
pub fn pdf(pages: usize) -> Vec<u8> {
    let mut doc = lopdf::Document::with_version("1.5");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for n in 1..=pages {
        let content = format!("BT /F1 12 Tf 72 720 Td (Pagina {n}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

pub fn page_count(path: &Path) -> usize {
    lopdf::Document::load(path).unwrap().get_pages().len()
}

/// Decode the QR image the annotator placed on the first page of `path`.
pub fn embedded_qr_text(path: &Path) -> String {
    let doc = lopdf::Document::load(path).unwrap();
    let first = *doc.get_pages().values().next().unwrap();
    let page = doc.get_dictionary(first).unwrap();
    let resources = page.get(b"Resources").and_then(Object::as_dict).unwrap();
    let xobjects = resources.get(b"XObject").and_then(Object::as_dict).unwrap();
    let image_id = xobjects
        .get(b"DocQrImg")
        .and_then(Object::as_reference)
        .unwrap();
    let stream = doc.get_object(image_id).and_then(Object::as_stream).unwrap();
    let dim = |key: &[u8]| stream.dict.get(key).and_then(Object::as_i64).unwrap() as u32;
    let (width, height) = (dim(b"Width"), dim(b"Height"));
    let pixels = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());
    let img = image::GrayImage::from_raw(width, height, pixels).unwrap();

    let mut prepared =
        rqrr::PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
            img.get_pixel(x as u32, y as u32)[0]
        });
    let grids = prepared.detect_grids();
    assert_eq!(grids.len(), 1, "exactly one QR code on the page");
    grids[0].decode().unwrap().1
}

/// Fast retries so failure tests do not sleep for seconds.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

pub async fn history_in(dir: &Path) -> Arc<HistoryStore> {
    Arc::new(HistoryStore::open(dir.join("history.jsonl")).await.unwrap())
}

/// Builder preloaded with well-behaved stubs.
pub fn builder(history: Arc<HistoryStore>) -> PipelineBuilder {
    Pipeline::builder()
        .summarizer(Arc::new(StubSummarizer::ok()))
        .converter(Arc::new(StubConverter::ok(2)))
        .history(history)
        .retry(fast_retry())
}

// ── Stub summarizer ──────────────────────────────────────────────────────────

pub struct StubSummarizer {
    /// Failures returned before the first success (`u32::MAX`: always fail).
    failures: u32,
    reason: SummarizationFailure,
    delay: Duration,
    pub calls: AtomicU32,
}

impl StubSummarizer {
    pub fn ok() -> Self {
        Self::failing(0, SummarizationFailure::Network)
    }

    pub fn failing(failures: u32, reason: SummarizationFailure) -> Self {
        Self {
            failures,
            reason,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always(reason: SummarizationFailure) -> Self {
        Self::failing(u32::MAX, reason)
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(
        &self,
        text: &str,
        max_chars: usize,
    ) -> Result<SummaryResult, SummarizationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.failures {
            return Err(SummarizationError::new(self.reason, "stubbed failure"));
        }
        Ok(SummaryResult {
            text: SUMMARY.chars().take(max_chars).collect(),
            source_char_count: text.chars().count(),
        })
    }
}

// ── Stub converter ───────────────────────────────────────────────────────────

pub struct StubConverter {
    pages: usize,
    fail_with: Option<ConversionFailure>,
    pub calls: AtomicU32,
}

impl StubConverter {
    pub fn ok(pages: usize) -> Self {
        Self {
            pages,
            fail_with: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(reason: ConversionFailure) -> Self {
        Self {
            pages: 0,
            fail_with: Some(reason),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentConverter for StubConverter {
    async fn convert(&self, _doc: &Document) -> Result<PdfArtifact, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_with {
            return Err(ConversionError::new(reason, "stubbed failure"));
        }
        Ok(PdfArtifact {
            bytes: pdf(self.pages).into(),
            page_count: self.pages,
            has_qr_header: false,
        })
    }

    fn is_remote(&self) -> bool {
        true
    }
}

// ── Stub notifier ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct StubNotifier {
    fail_with: Option<DeliveryFailure>,
    pub sent: Mutex<Vec<(OutgoingMail, usize)>>,
    pub calls: AtomicU32,
}

impl StubNotifier {
    pub fn failing(reason: DeliveryFailure) -> Self {
        Self {
            fail_with: Some(reason),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for StubNotifier {
    async fn send(&self, pdf: &PdfArtifact, mail: &OutgoingMail) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_with {
            return Err(DeliveryError::new(reason, "stubbed failure"));
        }
        self.sent.lock().unwrap().push((mail.clone(), pdf.bytes.len()));
        Ok(())
    }
}
