//! Text extraction from `.docx` documents.
//!
//! A `.docx` file is a ZIP container; the body text lives in
//! `word/document.xml`. We read that single part and walk its paragraphs
//! (`w:p`), keeping run text (`w:t`) and turning `w:tab` / `w:br` into their
//! plain-text equivalents. Empty paragraphs are dropped and the rest are
//! joined with `\n`.
//!
//! ZIP inflation and XML parsing are CPU-bound, so [`extract_text`] moves
//! them onto the blocking pool.

use crate::document::Document;
use crate::error::ExtractionError;
use std::io::Read;
use tracing::debug;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const BODY_PART: &str = "word/document.xml";

/// Extract the plain text of a document.
pub async fn extract_text(doc: &Document) -> Result<String, ExtractionError> {
    let filename = doc.filename().to_string();
    let bytes = doc
        .read_bytes()
        .await
        .map_err(|e| ExtractionError::Unreadable {
            filename: filename.clone(),
            detail: e.to_string(),
        })?;

    let text = tokio::task::spawn_blocking(move || extract_from_bytes(&filename, &bytes))
        .await
        .map_err(|e| ExtractionError::Corrupt {
            filename: doc.filename().to_string(),
            detail: format!("extraction task panicked: {e}"),
        })??;

    debug!("Extracted {} chars from {}", text.chars().count(), doc.filename());
    Ok(text)
}

/// Synchronous core of [`extract_text`].
pub fn extract_from_bytes(filename: &str, bytes: &[u8]) -> Result<String, ExtractionError> {
    if bytes.len() < ZIP_MAGIC.len() || &bytes[..ZIP_MAGIC.len()] != ZIP_MAGIC {
        return Err(ExtractionError::NotADocument {
            filename: filename.to_string(),
            magic: bytes.iter().take(4).copied().collect(),
        });
    }

    let corrupt = |detail: String| ExtractionError::Corrupt {
        filename: filename.to_string(),
        detail,
    };

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| corrupt(format!("zip open failed: {e}")))?;
    let mut part = archive
        .by_name(BODY_PART)
        .map_err(|e| corrupt(format!("{BODY_PART} missing: {e}")))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)
        .map_err(|e| corrupt(format!("cannot read {BODY_PART}: {e}")))?;

    let xml_doc = roxmltree::Document::parse(&xml)
        .map_err(|e| corrupt(format!("{BODY_PART} parse failed: {e}")))?;

    let paragraphs: Vec<String> = xml_doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "p")
        // Paragraphs nested in text boxes are also reached through their
        // enclosing paragraph; keep only the outermost.
        .filter(|p| {
            !p.ancestors()
                .skip(1)
                .any(|a| a.is_element() && a.tag_name().name() == "p")
        })
        .map(paragraph_text)
        .filter(|t| !t.is_empty())
        .collect();

    if paragraphs.is_empty() {
        return Err(ExtractionError::Empty {
            filename: filename.to_string(),
        });
    }
    Ok(paragraphs.join("\n"))
}

fn paragraph_text(para: roxmltree::Node<'_, '_>) -> String {
    let mut buf = String::new();
    for node in para.descendants().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "t" => {
                if let Some(text) = node.text() {
                    buf.push_str(text);
                }
            }
            "tab" => buf.push('\t'),
            "br" | "cr" => buf.push('\n'),
            _ => {}
        }
    }
    buf.trim().to_string()
}
