// =============================================================================
// extractor.rs - PDF BYTES IN, PLAIN TEXT OUT
// =============================================================================
//
// Value-up filings are PDFs of wildly varying quality. Some are clean text
// exports, some are slide decks flattened to images, some carry fonts that
// make pdf-extract panic outright. So:
//
// 1. pdf-extract, page by page. It understands font encodings and CMaps,
//    which matters for Korean text. It is also the one that panics, so it
//    runs inside catch_unwind.
//
// 2. lopdf, walking each page's content stream for text-showing operators
//    (Tj, TJ, ', "). Cruder, but it survives files pdf-extract chokes on.
//
// 3. Nothing. Empty text is a valid answer: the analyzer can still send the
//    raw document to a provider that reads PDFs natively.
//
// Every page that yields text is tagged `[페이지 N]` so the model can cite
// where a figure came from.
// =============================================================================

use std::panic::{self, AssertUnwindSafe};

use lopdf::content::Content;
use lopdf::{Document, Object};
use tracing::{debug, warn};

/// Above this many characters the text itself is the best size signal.
pub const TEXT_THRESHOLD_CHARS: usize = 500;
/// Mixed Korean/English runs close to two tokens per character.
pub const TOKENS_PER_CHAR: u64 = 2;
/// Image-only pages still cost the model a rendered page.
pub const TOKENS_PER_PAGE: u64 = 300;
pub const TOKENS_PER_KB: u64 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ExtractionMethod {
    PdfExtract,
    Lopdf,
    Unreadable,
}

#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub text: String,
    pub page_count: Option<usize>,
    pub byte_len: usize,
    pub method: ExtractionMethod,
}

impl ExtractedDocument {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(self.char_count(), self.page_count, self.byte_len)
    }
}

/// Rough input-token estimate used only for per-minute budgeting.
pub fn estimate_tokens(text_chars: usize, page_count: Option<usize>, byte_len: usize) -> u64 {
    if text_chars >= TEXT_THRESHOLD_CHARS {
        return text_chars as u64 * TOKENS_PER_CHAR;
    }
    if let Some(pages) = page_count.filter(|p| *p > 0) {
        return pages as u64 * TOKENS_PER_PAGE;
    }
    (byte_len as u64 * TOKENS_PER_KB).div_ceil(1024)
}

/// Extract text, trying pdf-extract first and lopdf second.
pub fn extract(bytes: &[u8]) -> ExtractedDocument {
    let lopdf_doc = Document::load_mem(bytes).ok();
    let page_count = lopdf_doc.as_ref().map(|d| d.get_pages().len());

    if let Some(pages) = extract_with_pdf_extract(bytes) {
        let text = join_pages(&pages);
        if !text.is_empty() {
            debug!(pages = pages.len(), chars = text.len(), "pdf-extract succeeded");
            return ExtractedDocument {
                text,
                page_count: page_count.or(Some(pages.len())),
                byte_len: bytes.len(),
                method: ExtractionMethod::PdfExtract,
            };
        }
    }

    if let Some(doc) = &lopdf_doc {
        let pages: Vec<String> = doc
            .get_pages()
            .values()
            .map(|&page_id| extract_page_operators(doc, page_id).unwrap_or_default())
            .collect();
        let text = join_pages(&pages);
        if !text.is_empty() {
            debug!(pages = pages.len(), chars = text.len(), "lopdf fallback succeeded");
            return ExtractedDocument {
                text,
                page_count,
                byte_len: bytes.len(),
                method: ExtractionMethod::Lopdf,
            };
        }
    }

    warn!(bytes = bytes.len(), ?page_count, "No text could be extracted from the document");
    ExtractedDocument {
        text: String::new(),
        page_count,
        byte_len: bytes.len(),
        method: ExtractionMethod::Unreadable,
    }
}

/// `extract` on the blocking pool; PDF parsing is CPU-bound.
pub async fn extract_async(bytes: Vec<u8>) -> ExtractedDocument {
    let byte_len = bytes.len();
    match tokio::task::spawn_blocking(move || extract(&bytes)).await {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "Extraction task failed");
            ExtractedDocument {
                text: String::new(),
                page_count: None,
                byte_len,
                method: ExtractionMethod::Unreadable,
            }
        }
    }
}

fn extract_with_pdf_extract(bytes: &[u8]) -> Option<Vec<String>> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem_by_pages(bytes)));
    match outcome {
        Ok(Ok(pages)) => Some(pages),
        Ok(Err(e)) => {
            debug!(error = %e, "pdf-extract failed, falling back to lopdf");
            None
        }
        Err(_) => {
            warn!("pdf-extract panicked, falling back to lopdf");
            None
        }
    }
}

fn join_pages(pages: &[String]) -> String {
    pages
        .iter()
        .enumerate()
        .filter_map(|(i, page)| {
            let trimmed = page.trim();
            (!trimmed.is_empty()).then(|| format!("[페이지 {}]\n{}", i + 1, trimmed))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn extract_page_operators(doc: &Document, page_id: lopdf::ObjectId) -> Option<String> {
    let content_bytes = doc.get_page_content(page_id).ok()?;
    let content = Content::decode(&content_bytes).ok()?;

    let mut text = String::new();
    for operation in &content.operations {
        match operation.operator.as_str() {
            "Tj" | "TJ" | "'" | "\"" => {
                for operand in &operation.operands {
                    if let Some(s) = string_from_object(operand) {
                        text.push_str(&s);
                        text.push(' ');
                    }
                }
            }
            "Td" | "TD" | "T*" => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            _ => {}
        }
    }
    Some(text)
}

fn string_from_object(obj: &Object) -> Option<String> {
    match obj {
        Object::String(bytes, _) => {
            if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
                let utf16: Vec<u16> = bytes[2..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&utf16).ok()
            } else {
                Some(bytes.iter().map(|&b| b as char).collect())
            }
        }
        // TJ arrays interleave strings with kerning offsets.
        Object::Array(items) => {
            let joined: String = items.iter().filter_map(string_from_object).collect();
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

/// A minimal one-page PDF with one Courier line per entry.
#[cfg(test)]
pub(crate) fn synthetic_pdf(lines: &[&str]) -> Vec<u8> {
    use lopdf::content::Operation;
    use lopdf::{dictionary, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 14.into()]),
        Operation::new("Td", vec![72.into(), 760.into()]),
    ];
    for line in lines {
        operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
        operations.push(Operation::new("Td", vec![0.into(), (-18).into()]));
    }
    operations.push(Operation::new("ET", vec![]));

    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_text_from_generated_pdf() {
        let pdf = synthetic_pdf(&["ROE 15% target by 2027", "Dividend payout 30%"]);
        assert!(pdf.starts_with(b"%PDF"));

        let doc = extract(&pdf);
        assert_ne!(doc.method, ExtractionMethod::Unreadable);
        assert_eq!(doc.page_count, Some(1));
        assert!(doc.text.starts_with("[페이지 1]"));
        assert!(doc.text.contains("ROE 15%"));
        assert!(doc.text.contains("2027"));
    }

    #[test]
    fn test_lopdf_operator_walk_reads_tj() {
        let pdf = synthetic_pdf(&["Hello World!"]);
        let doc = Document::load_mem(&pdf).unwrap();
        let (_, &page_id) = doc.get_pages().iter().next().unwrap();
        let text = extract_page_operators(&doc, page_id).unwrap();
        assert!(text.contains("Hello World!"));
    }

    #[test]
    fn test_garbage_bytes_yield_empty_text_not_panic() {
        let doc = extract(b"this is not a pdf at all");
        assert_eq!(doc.method, ExtractionMethod::Unreadable);
        assert!(doc.text.is_empty());
        assert_eq!(doc.page_count, None);
        assert_eq!(doc.estimated_tokens(), 2);
    }

    #[test]
    fn test_utf16_strings_are_decoded() {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in "배당".encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        let obj = Object::String(bytes, lopdf::StringFormat::Hexadecimal);
        assert_eq!(string_from_object(&obj).as_deref(), Some("배당"));
    }

    #[test]
    fn test_estimate_prefers_text_then_pages_then_bytes() {
        assert_eq!(estimate_tokens(1_000, Some(10), 50_000), 2_000);
        assert_eq!(estimate_tokens(100, Some(10), 50_000), 3_000);
        assert_eq!(estimate_tokens(100, None, 2048), 150);
        assert_eq!(estimate_tokens(0, Some(0), 1024), 75);
    }

    #[test]
    fn test_estimate_counts_text_from_the_threshold() {
        let at = estimate_tokens(TEXT_THRESHOLD_CHARS, Some(10), 0);
        let above = estimate_tokens(TEXT_THRESHOLD_CHARS + 1, Some(10), 0);
        assert_eq!(at, TEXT_THRESHOLD_CHARS as u64 * TOKENS_PER_CHAR);
        assert!(above >= at);
        assert_eq!(estimate_tokens(TEXT_THRESHOLD_CHARS - 1, Some(10), 0), 3_000);
    }

    #[test]
    fn test_estimate_is_monotonic_in_text_length() {
        let mut previous = 0;
        for chars in (TEXT_THRESHOLD_CHARS..20_000).step_by(997) {
            let estimate = estimate_tokens(chars, Some(3), 10_000);
            assert!(estimate >= previous);
            previous = estimate;
        }
    }

    #[tokio::test]
    async fn test_extract_async_matches_sync() {
        let pdf = synthetic_pdf(&["async path"]);
        let doc = extract_async(pdf.clone()).await;
        assert_eq!(doc.byte_len, pdf.len());
        assert!(doc.text.contains("async path"));
    }
}
