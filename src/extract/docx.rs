//! DOCX extraction: paragraphs and tables from the WordprocessingML body,
//! document properties from `docProps/core.xml`.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use super::{Extraction, ExtractError, ExtractionMetadata};

pub fn extract(bytes: &[u8]) -> Result<Extraction, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| ExtractError::Unreadable(format!("open docx archive: {err}")))?;

    let body_xml = read_archive_file(&mut archive, "word/document.xml")?
        .ok_or_else(|| ExtractError::Unreadable("docx missing word/document.xml".to_string()))?;
    let text = parse_document_body(&body_xml)?;

    let mut metadata = ExtractionMetadata {
        extraction_method: Some("docx"),
        ..Default::default()
    };
    if let Some(core_xml) = read_archive_file(&mut archive, "docProps/core.xml")? {
        parse_core_properties(&core_xml, &mut metadata);
    }

    Ok(Extraction {
        text,
        metadata,
        pages: None,
    })
}

fn read_archive_file(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ExtractError> {
    match archive.by_name(name) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)
                .map_err(|err| ExtractError::Unreadable(format!("read {name}: {err}")))?;
            Ok(Some(contents))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(ExtractError::Unreadable(format!("read {name}: {err}"))),
    }
}

/// Walks the body emitting one line per paragraph; table rows are flattened
/// row-major with ` | ` between cells.
fn parse_document_body(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);

    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut in_table_row = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.name().as_ref() {
                b"w:tr" => {
                    in_table_row = true;
                    row_cells.clear();
                }
                b"w:tc" => current.clear(),
                b"w:p" if !in_table_row => current.clear(),
                _ => {}
            },
            Ok(Event::End(element)) => match element.name().as_ref() {
                b"w:p" if !in_table_row => {
                    let line = current.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                    current.clear();
                }
                b"w:tc" => {
                    row_cells.push(current.trim().to_string());
                    current.clear();
                }
                b"w:tr" => {
                    in_table_row = false;
                    let row = row_cells.join(" | ");
                    if !row.trim().is_empty() {
                        lines.push(row);
                    }
                    row_cells.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(element)) => {
                // Explicit breaks and tabs inside runs become whitespace.
                match element.name().as_ref() {
                    b"w:br" | b"w:cr" => current.push('\n'),
                    b"w:tab" => current.push('\t'),
                    _ => {}
                }
            }
            Ok(Event::Text(text)) => {
                let decoded = text
                    .unescape()
                    .map_err(|err| ExtractError::Unreadable(format!("decode docx text: {err}")))?;
                current.push_str(&decoded);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(ExtractError::Unreadable(format!("parse docx body: {err}")));
            }
        }
    }

    Ok(lines.join("\n\n"))
}

fn parse_core_properties(xml: &str, metadata: &mut ExtractionMetadata) {
    let mut reader = Reader::from_str(xml);
    let mut field: Option<&'static str> = None;

    while let Ok(event) = reader.read_event() {
        match event {
            Event::Start(element) => {
                field = match element.name().as_ref() {
                    b"dc:creator" => Some("author"),
                    b"dcterms:created" => Some("created"),
                    b"dcterms:modified" => Some("modified"),
                    _ => None,
                };
            }
            Event::Text(text) => {
                if let (Some(name), Ok(value)) = (field, text.unescape()) {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        match name {
                            "author" => metadata.author = Some(value),
                            "created" => metadata.created = Some(value),
                            "modified" => metadata.modified = Some(value),
                            _ => {}
                        }
                    }
                }
            }
            Event::End(_) => field = None,
            Event::Eof => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn docx_with(body: &str, core: Option<&str>) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = FileOptions::default();
            writer.start_file("word/document.xml", options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
            if let Some(core) = core {
                writer.start_file("docProps/core.xml", options).unwrap();
                writer.write_all(core.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn extracts_paragraphs_and_tables() {
        let body = r#"<w:document><w:body>
            <w:p><w:r><w:t>Heading text</w:t></w:r></w:p>
            <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
            <w:tbl><w:tr>
                <w:tc><w:p><w:r><w:t>Name</w:t></w:r></w:p></w:tc>
                <w:tc><w:p><w:r><w:t>Role</w:t></w:r></w:p></w:tc>
            </w:tr></w:tbl>
        </w:body></w:document>"#;
        let bytes = docx_with(body, None);
        let extraction = extract(&bytes).unwrap();
        assert!(extraction.text.contains("Heading text"));
        assert!(extraction.text.contains("First paragraph."));
        assert!(extraction.text.contains("Name | Role"));
    }

    #[test]
    fn reads_core_properties() {
        let body = r#"<w:document><w:body><w:p><w:r><w:t>x</w:t></w:r></w:p></w:body></w:document>"#;
        let core = r#"<cp:coreProperties>
            <dc:creator>Ada Lovelace</dc:creator>
            <dcterms:created>2024-01-05T10:00:00Z</dcterms:created>
        </cp:coreProperties>"#;
        let bytes = docx_with(body, Some(core));
        let extraction = extract(&bytes).unwrap();
        assert_eq!(extraction.metadata.author.as_deref(), Some("Ada Lovelace"));
        assert_eq!(
            extraction.metadata.created.as_deref(),
            Some("2024-01-05T10:00:00Z")
        );
    }

    #[test]
    fn missing_body_is_unreadable() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("other.xml", FileOptions::default())
                .unwrap();
            writer.write_all(b"<x/>").unwrap();
            writer.finish().unwrap();
        }
        let bytes = buffer.into_inner();
        assert!(matches!(extract(&bytes), Err(ExtractError::Unreadable(_))));
    }
}
