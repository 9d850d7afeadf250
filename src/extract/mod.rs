//! Text extraction from uploaded documents.
//!
//! Dispatch is by the declared file type, re-verified against magic bytes so
//! a mislabeled upload never reaches the wrong parser.

mod csv;
mod docx;
mod pdf;
mod text;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Pdf,
    Docx,
    Txt,
    Md,
    Csv,
}

impl FileType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "txt" => Some(FileType::Txt),
            "md" => Some(FileType::Md),
            "csv" => Some(FileType::Csv),
            _ => None,
        }
    }

    pub fn from_filename(filename: &str) -> Option<Self> {
        filename.rsplit('.').next().and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Txt => "txt",
            FileType::Md => "md",
            FileType::Csv => "csv",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::from_extension(value)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileType::Txt => "text/plain",
            FileType::Md => "text/markdown",
            FileType::Csv => "text/csv",
        }
    }

    /// Checks the leading bytes against the declared type. Plain-text types
    /// only need to not be a known binary container.
    pub fn matches_magic(&self, bytes: &[u8]) -> bool {
        let is_pdf = bytes.starts_with(b"%PDF-");
        let is_zip = bytes.starts_with(b"PK\x03\x04");
        match self {
            FileType::Pdf => is_pdf,
            FileType::Docx => is_zip,
            FileType::Txt | FileType::Md | FileType::Csv => !is_pdf && !is_zip,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document is empty after extraction")]
    EmptyDocument,
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("declared type {declared} does not match file contents")]
    TypeMismatch { declared: &'static str },
    #[error("failed to read document: {0}")]
    Unreadable(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    pub char_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct PageText {
    pub page_number: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub metadata: ExtractionMetadata,
    pub pages: Option<Vec<PageText>>,
}

impl Extraction {
    fn finish(mut self) -> Result<Self, ExtractError> {
        if self.text.trim().is_empty() {
            return Err(ExtractError::EmptyDocument);
        }
        self.metadata.char_count = self.text.chars().count();
        Ok(self)
    }
}

pub fn extract(bytes: &[u8], file_type: FileType) -> Result<Extraction, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::EmptyDocument);
    }
    if !file_type.matches_magic(bytes) {
        return Err(ExtractError::TypeMismatch {
            declared: file_type.as_str(),
        });
    }

    let extraction = match file_type {
        FileType::Pdf => pdf::extract(bytes)?,
        FileType::Docx => docx::extract(bytes)?,
        FileType::Txt | FileType::Md => text::extract(bytes),
        FileType::Csv => csv::extract(bytes)?,
    };

    extraction.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_file_is_empty_document() {
        assert!(matches!(
            extract(&[], FileType::Txt),
            Err(ExtractError::EmptyDocument)
        ));
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let err = extract(b"%PDF-1.7 rest", FileType::Txt).unwrap_err();
        assert!(matches!(err, ExtractError::TypeMismatch { declared: "txt" }));

        let err = extract(b"plain words", FileType::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::TypeMismatch { declared: "pdf" }));
    }

    #[test]
    fn txt_extraction_counts_chars() {
        let extraction = extract("hello world".as_bytes(), FileType::Txt).unwrap();
        assert_eq!(extraction.text, "hello world");
        assert_eq!(extraction.metadata.char_count, 11);
    }

    #[test]
    fn whitespace_only_text_is_empty() {
        assert!(matches!(
            extract(b"   \n\t ", FileType::Txt),
            Err(ExtractError::EmptyDocument)
        ));
    }

    #[test]
    fn file_types_round_trip_their_names() {
        for ty in [
            FileType::Pdf,
            FileType::Docx,
            FileType::Txt,
            FileType::Md,
            FileType::Csv,
        ] {
            assert_eq!(FileType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(FileType::parse("exe"), None);
        assert_eq!(FileType::from_filename("report.final.PDF"), Some(FileType::Pdf));
    }
}
