//! QR header insertion.
//!
//! For each target page we add two resources (an image XObject holding the
//! QR code and a Helvetica-Bold font for the label) and append an overlay
//! content stream that draws them in the top-right corner.
//!
//! Existing content streams are left byte-for-byte intact. They are
//! bracketed by a `q` stream before and a `Q` at the start of the overlay
//! stream, so any graphics state the original content leaves behind (a
//! transformation matrix, a clip) cannot displace the header.
//!
//! lopdf parsing and serialisation are CPU-bound; [`annotate`] runs them on
//! the blocking pool.

use crate::config::QrPlacement;
use crate::error::AnnotationError;
use crate::output::{PdfArtifact, QrArtifact};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::debug;

/// Side of the QR square, in points.
pub const QR_SIZE_PT: f32 = 80.0;
/// Distance from the top and right page edges, in points.
pub const MARGIN_PT: f32 = 50.0;
/// Label baseline offset above the QR square's top edge, in points.
pub const LABEL_OFFSET_PT: f32 = 15.0;
const LABEL_FONT_SIZE: f32 = 10.0;

/// US Letter, used when no MediaBox is found anywhere in the page tree.
const DEFAULT_MEDIA_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

/// Return a new PDF with the QR header applied to the pages selected by
/// `placement`. The input artefact is not modified.
pub async fn annotate(
    pdf: &PdfArtifact,
    qr: &QrArtifact,
    label: &str,
    placement: QrPlacement,
) -> Result<PdfArtifact, AnnotationError> {
    let pdf_bytes = pdf.bytes.clone();
    let qr_bytes = qr.image_bytes.clone();
    let label = label.to_string();

    let (bytes, page_count) = tokio::task::spawn_blocking(move || {
        annotate_bytes(&pdf_bytes, &qr_bytes, &label, placement)
    })
    .await
    .map_err(|e| AnnotationError::InvalidPdf {
        detail: format!("annotation task panicked: {e}"),
    })??;

    Ok(PdfArtifact {
        bytes: bytes.into(),
        page_count,
        has_qr_header: true,
    })
}

/// Count the pages of a PDF.
pub fn page_count(pdf: &[u8]) -> Result<usize, lopdf::Error> {
    Ok(Document::load_mem(pdf)?.get_pages().len())
}

/// Synchronous core of [`annotate`]. Returns the new bytes and page count.
pub fn annotate_bytes(
    pdf: &[u8],
    qr_png: &[u8],
    label: &str,
    placement: QrPlacement,
) -> Result<(Vec<u8>, usize), AnnotationError> {
    let invalid = |e: lopdf::Error| AnnotationError::InvalidPdf {
        detail: e.to_string(),
    };

    let mut doc = Document::load_mem(pdf).map_err(invalid)?;
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    if pages.is_empty() {
        return Err(AnnotationError::NoPages);
    }

    let qr = image::load_from_memory(qr_png)
        .map_err(|e| AnnotationError::InvalidImage {
            detail: e.to_string(),
        })?
        .to_luma8();
    let (width, height) = qr.dimensions();
    let mut image_stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        qr.into_raw(),
    );
    image_stream.compress().map_err(invalid)?;
    let image_id = doc.add_object(image_stream);
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });

    let targets: &[ObjectId] = match placement {
        QrPlacement::FirstPage => &pages[..1],
        QrPlacement::EveryPage => &pages,
    };
    for &page_id in targets {
        annotate_page(&mut doc, page_id, image_id, font_id, label).map_err(invalid)?;
    }

    let mut out = Vec::with_capacity(pdf.len() + 16 * 1024);
    doc.save_to(&mut out)
        .map_err(|e| AnnotationError::InvalidPdf {
            detail: format!("serialisation failed: {e}"),
        })?;
    debug!(
        "Annotated {}/{} pages, {} → {} bytes",
        targets.len(),
        pages.len(),
        pdf.len(),
        out.len()
    );
    Ok((out, pages.len()))
}

fn annotate_page(
    doc: &mut Document,
    page_id: ObjectId,
    image_id: ObjectId,
    font_id: ObjectId,
    label: &str,
) -> lopdf::Result<()> {
    let [llx, lly, urx, ury] = media_box(doc, page_id);

    // Resources: inline a copy so shared (inherited) dictionaries are untouched.
    let mut resources = inherited(doc, page_id, b"Resources")
        .and_then(|obj| resolve_dict(doc, obj))
        .unwrap_or_default();
    let mut xobjects = resources
        .get(b"XObject")
        .ok()
        .and_then(|obj| resolve_dict(doc, obj))
        .unwrap_or_default();
    let mut fonts = resources
        .get(b"Font")
        .ok()
        .and_then(|obj| resolve_dict(doc, obj))
        .unwrap_or_default();
    let image_name = unused_name(&xobjects, "DocQrImg");
    let font_name = unused_name(&fonts, "DocQrFont");
    xobjects.set(image_name.as_bytes().to_vec(), image_id);
    fonts.set(font_name.as_bytes().to_vec(), font_id);
    resources.set("XObject", xobjects);
    resources.set("Font", fonts);

    let qr_x = urx - MARGIN_PT - QR_SIZE_PT;
    let qr_y = ury - MARGIN_PT - QR_SIZE_PT;
    let label_y = ury - MARGIN_PT + LABEL_OFFSET_PT;
    debug!(
        "Page {:?}: box [{llx} {lly} {urx} {ury}], QR at ({qr_x}, {qr_y})",
        page_id
    );

    let overlay = Content {
        operations: vec![
            Operation::new("Q", vec![]),
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    QR_SIZE_PT.into(),
                    0.into(),
                    0.into(),
                    QR_SIZE_PT.into(),
                    qr_x.into(),
                    qr_y.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(image_name.into_bytes())]),
            Operation::new("Q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![Object::Name(font_name.into_bytes()), LABEL_FONT_SIZE.into()],
            ),
            Operation::new("Td", vec![qr_x.into(), label_y.into()]),
            Operation::new("Tj", vec![Object::string_literal(win_ansi(label))]),
            Operation::new("ET", vec![]),
        ],
    };
    let save_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    let overlay_id = doc.add_object(Stream::new(dictionary! {}, overlay.encode()?));

    let mut contents: Vec<Object> = vec![save_id.into()];
    contents.extend(existing_contents(doc, page_id));
    contents.push(overlay_id.into());

    let page = doc.get_dictionary_mut(page_id)?;
    page.set("Resources", resources);
    page.set("Contents", contents);
    Ok(())
}

/// Look a key up on the page, then up the Pages tree.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    // The page tree is shallow in practice; the bound guards against cycles.
    for _ in 0..32 {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn resolve_dict(doc: &Document, obj: &Object) -> Option<Dictionary> {
    match obj {
        Object::Dictionary(d) => Some(d.clone()),
        Object::Reference(id) => doc.get_dictionary(*id).ok().cloned(),
        _ => None,
    }
}

fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let array = match inherited(doc, page_id, b"MediaBox") {
        Some(Object::Array(a)) => Some(a.clone()),
        Some(Object::Reference(id)) => doc
            .get_object(*id)
            .ok()
            .and_then(|o| o.as_array().ok())
            .cloned(),
        _ => None,
    };
    let numbers: Vec<f32> = array
        .unwrap_or_default()
        .iter()
        .filter_map(number)
        .collect();
    match numbers.as_slice() {
        [a, b, c, d] => [a.min(*c), b.min(*d), a.max(*c), b.max(*d)],
        _ => DEFAULT_MEDIA_BOX,
    }
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Current content stream references of a page, in order.
fn existing_contents(doc: &Document, page_id: ObjectId) -> Vec<Object> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    match page.get(b"Contents") {
        Ok(Object::Array(items)) => items.clone(),
        Ok(Object::Reference(id)) => match doc.get_object(*id) {
            // A reference to an array of streams, not to a stream.
            Ok(Object::Array(items)) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(Object::Stream(stream)) => {
            vec![Object::Stream(stream.clone())]
        }
        _ => Vec::new(),
    }
}

fn unused_name(dict: &Dictionary, base: &str) -> String {
    if !dict.has(base.as_bytes()) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}{n}"))
        .find(|candidate| !dict.has(candidate.as_bytes()))
        .unwrap_or_else(|| base.to_string())
}

/// Encode a label for a WinAnsi Type1 font; unmappable characters become `?`.
fn win_ansi(label: &str) -> Vec<u8> {
    label
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
