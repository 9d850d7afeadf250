//! Plain text and markdown: read as UTF-8, lossy-replacing invalid bytes.

use super::{Extraction, ExtractionMetadata};

pub fn extract(bytes: &[u8]) -> Extraction {
    let text = String::from_utf8_lossy(bytes).into_owned();
    Extraction {
        text,
        metadata: ExtractionMetadata {
            extraction_method: Some("text"),
            ..Default::default()
        },
        pages: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let bytes = [b'o', b'k', 0xFF, b'!' ];
        let extraction = extract(&bytes);
        assert!(extraction.text.starts_with("ok"));
        assert!(extraction.text.contains('\u{FFFD}'));
    }
}
