//! PDF text extraction with an OCR fallback for scanned documents.

use std::fs;
use std::io::{ErrorKind, Write};
use std::process::Command;

use pdfium_render::prelude::*;
use tempfile::NamedTempFile;
use tracing::warn;

use super::{Extraction, ExtractError, ExtractionMetadata, PageText};

/// Below this average of printable characters per page the embedded text
/// layer is assumed missing and the document is OCRed.
const OCR_THRESHOLD_CHARS_PER_PAGE: usize = 50;

pub fn extract(bytes: &[u8]) -> Result<Extraction, ExtractError> {
    let embedded = extract_embedded_text(bytes)?;

    let page_count = embedded.pages.len().max(1);
    let printable: usize = embedded
        .pages
        .iter()
        .map(|page| page.text.chars().filter(|ch| !ch.is_whitespace()).count())
        .sum();

    if printable / page_count >= OCR_THRESHOLD_CHARS_PER_PAGE {
        return Ok(embedded.into_extraction("pdf-text"));
    }

    match run_ocr(bytes) {
        Ok(Some(text)) => {
            let mut metadata = embedded.metadata.clone();
            metadata.extraction_method = Some("ocr");
            Ok(Extraction {
                text,
                metadata,
                pages: None,
            })
        }
        Ok(None) => Ok(embedded.into_extraction("pdf-text")),
        Err(OcrError::BinaryMissing) => {
            warn!("ocrmypdf not installed; falling back to embedded text layer");
            Ok(embedded.into_extraction("pdf-text"))
        }
        Err(OcrError::Failed(message)) => {
            warn!(error = %message, "ocr failed; falling back to embedded text layer");
            Ok(embedded.into_extraction("pdf-text"))
        }
    }
}

struct EmbeddedText {
    pages: Vec<PageText>,
    metadata: ExtractionMetadata,
}

impl EmbeddedText {
    fn into_extraction(self, method: &'static str) -> Extraction {
        let text = self
            .pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut metadata = self.metadata;
        metadata.extraction_method = Some(method);
        Extraction {
            text,
            metadata,
            pages: Some(self.pages),
        }
    }
}

fn extract_embedded_text(bytes: &[u8]) -> Result<EmbeddedText, ExtractError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| ExtractError::Unreadable(format!("load pdf: {err}")))?;

    let mut metadata = ExtractionMetadata {
        page_count: Some(document.pages().len() as usize),
        ..Default::default()
    };
    for entry in document.metadata().iter() {
        match entry.tag_type() {
            PdfDocumentMetadataTagType::Author => metadata.author = Some(entry.value().to_string()),
            PdfDocumentMetadataTagType::CreationDate => {
                metadata.created = Some(entry.value().to_string())
            }
            PdfDocumentMetadataTagType::ModificationDate => {
                metadata.modified = Some(entry.value().to_string())
            }
            _ => {}
        }
    }

    let mut pages = Vec::new();
    let page_handles = document.pages();
    for page_index in 0..page_handles.len() {
        let page = page_handles
            .get(page_index)
            .map_err(|err| ExtractError::Unreadable(format!("load page {page_index}: {err}")))?;
        let mut combined = String::new();
        if let Ok(page_text) = page.text() {
            for segment in page_text.segments().iter() {
                combined.push_str(&segment.text());
                combined.push('\n');
            }
        }
        pages.push(PageText {
            page_number: page_index as usize + 1,
            text: combined,
        });
    }

    Ok(EmbeddedText { pages, metadata })
}

#[derive(Debug)]
enum OcrError {
    BinaryMissing,
    Failed(String),
}

fn run_ocr(bytes: &[u8]) -> Result<Option<String>, OcrError> {
    let mut input = NamedTempFile::new().map_err(|err| OcrError::Failed(err.to_string()))?;
    input
        .write_all(bytes)
        .map_err(|err| OcrError::Failed(err.to_string()))?;
    input
        .flush()
        .map_err(|err| OcrError::Failed(err.to_string()))?;

    let output_pdf = NamedTempFile::new().map_err(|err| OcrError::Failed(err.to_string()))?;
    let sidecar = NamedTempFile::new().map_err(|err| OcrError::Failed(err.to_string()))?;

    let status = Command::new("ocrmypdf")
        .arg("--sidecar")
        .arg(sidecar.path())
        .arg("--skip-text")
        .arg(input.path())
        .arg(output_pdf.path())
        .output();

    match status {
        Ok(output) => {
            if !output.status.success() {
                return Err(OcrError::Failed(format!(
                    "ocrmypdf failed: exit={} stderr={}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let text = fs::read_to_string(sidecar.path())
                .map_err(|err| OcrError::Failed(err.to_string()))?;
            if text.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(text))
            }
        }
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                Err(OcrError::BinaryMissing)
            } else {
                Err(OcrError::Failed(err.to_string()))
            }
        }
    }
}
