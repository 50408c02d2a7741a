//! Text extraction for plain text, PDF and DOCX documents.

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Value, json};
use std::io::{Cursor, Read};

use super::{Extraction, Extractor};
use crate::error::CapabilityError;

/// Decompressed size limit for `word/document.xml`
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceType {
    Pdf,
    Docx,
    Txt,
}

impl SourceType {
    fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Docx => "docx",
            SourceType::Txt => "txt",
        }
    }

    /// Decide by extension, falling back to magic bytes for unnamed uploads
    fn detect(bytes: &[u8], filename: &str) -> Self {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match ext.as_deref() {
            Some("pdf") => SourceType::Pdf,
            Some("docx") => SourceType::Docx,
            Some("txt") => SourceType::Txt,
            _ if bytes.starts_with(b"%PDF") => SourceType::Pdf,
            _ if bytes.starts_with(b"PK\x03\x04") => SourceType::Docx,
            _ => SourceType::Txt,
        }
    }
}

/// Extractor for the text modality
#[derive(Debug, Default)]
pub struct DocumentTextExtractor;

impl DocumentTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for DocumentTextExtractor {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Extraction, CapabilityError> {
        let source_type = SourceType::detect(bytes, filename);
        let data = bytes.to_vec();

        // PDF and ZIP parsing are CPU bound
        let (text, pages) = tokio::task::spawn_blocking(move || match source_type {
            SourceType::Pdf => extract_pdf(&data).map(|pages| {
                let count = pages.len();
                (pages.join("\n").trim().to_string(), Some(count))
            }),
            SourceType::Docx => extract_docx(&data).map(|text| (text, None)),
            SourceType::Txt => Ok((String::from_utf8_lossy(&data).trim().to_string(), None)),
        })
        .await
        .map_err(|e| CapabilityError::failed(format!("Extraction task failed: {}", e)))??;

        let mut metadata = serde_json::Map::new();
        metadata.insert("source_type".to_string(), json!(source_type.as_str()));
        metadata.insert(
            "pages".to_string(),
            pages.map(Value::from).unwrap_or(Value::Null),
        );

        Ok(Extraction {
            text,
            captions: Vec::new(),
            metadata,
        })
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>, CapabilityError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| CapabilityError::failed(format!("PDF extraction failed: {}", e)))
}

fn extract_docx(bytes: &[u8]) -> Result<String, CapabilityError> {
    let docx_error = |e: &dyn std::fmt::Display| {
        CapabilityError::failed(format!("DOCX extraction failed: {}", e))
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| docx_error(&e))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| docx_error(&e))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| docx_error(&e))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(docx_error(&"word/document.xml exceeds size limit"));
    }

    paragraphs_from_document_xml(&xml).map_err(|e| docx_error(&e))
}

/// Collect `w:t` runs, one line per `w:p` paragraph
fn paragraphs_from_document_xml(xml: &[u8]) -> Result<String, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| e.to_string())?
        {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Event::Text(t) if in_text => {
                out.push_str(&t.unescape().map_err(|e| e.to_string())?);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            writer
                .start_file(
                    "word/document.xml",
                    zip::write::SimpleFileOptions::default(),
                )
                .unwrap();
            write!(
                writer,
                r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
                body
            )
            .unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_plain_text_extraction() {
        let extraction = DocumentTextExtractor::new()
            .extract(b"  hello world \n", "notes.txt")
            .await
            .unwrap();

        assert_eq!(extraction.text, "hello world");
        assert!(extraction.captions.is_empty());
        assert_eq!(extraction.metadata["source_type"], "txt");
        assert_eq!(extraction.metadata["pages"], Value::Null);
    }

    #[tokio::test]
    async fn test_docx_paragraphs() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space=\"preserve\"> line</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Tom &amp; Jerry</w:t></w:r></w:p>",
        );

        let extraction = DocumentTextExtractor::new()
            .extract(&bytes, "report.docx")
            .await
            .unwrap();

        assert_eq!(extraction.text, "First line\nTom & Jerry");
        assert_eq!(extraction.metadata["source_type"], "docx");
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_an_error() {
        let result = DocumentTextExtractor::new()
            .extract(b"%PDF-1.7 truncated", "upload")
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_source_type_detection() {
        assert_eq!(SourceType::detect(b"", "A.PDF"), SourceType::Pdf);
        assert_eq!(SourceType::detect(b"%PDF-1.4", "blob"), SourceType::Pdf);
        assert_eq!(SourceType::detect(b"PK\x03\x04", "blob"), SourceType::Docx);
        assert_eq!(SourceType::detect(b"plain", "readme.md"), SourceType::Txt);
    }
}
