//! Text extraction for uploaded documents.
//!
//! The document kind is taken from the file extension and, failing that,
//! from the leading bytes. Supported kinds:
//!
//! - PDF via `pdf-extract`
//! - DOCX via `zip` + `quick-xml`: `w:t` runs, one line per paragraph
//! - plain text (`.txt`, `.md`, `.csv`, ... or any valid UTF-8)
//!
//! An empty result is not an error here; callers decide what to do with a
//! document that has no text.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv", "log", "rst", "text"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    UnsupportedType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("failed to read document: {0}")]
    Io(#[from] std::io::Error),
}

/// Kinds of document this module can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Text,
}

impl DocumentKind {
    /// Decide the kind from `file_name`, falling back to the content.
    pub fn detect(file_name: &str, bytes: &[u8]) -> Result<Self, ExtractError> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("pdf") => return Ok(DocumentKind::Pdf),
            Some("docx") => return Ok(DocumentKind::Docx),
            Some(e) if TEXT_EXTENSIONS.contains(&e) => return Ok(DocumentKind::Text),
            _ => {}
        }
        if bytes.starts_with(b"%PDF-") {
            Ok(DocumentKind::Pdf)
        } else if bytes.starts_with(b"PK\x03\x04") {
            Ok(DocumentKind::Docx)
        } else if std::str::from_utf8(bytes).is_ok() {
            Ok(DocumentKind::Text)
        } else {
            Err(ExtractError::UnsupportedType(
                ext.unwrap_or_else(|| file_name.to_string()),
            ))
        }
    }
}

/// Extract plain text from an in-memory document.
pub fn extract_document(file_name: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = DocumentKind::detect(file_name, bytes)?;
    let text = match kind {
        DocumentKind::Pdf => extract_pdf(bytes)?,
        DocumentKind::Docx => extract_docx(bytes)?,
        DocumentKind::Text => String::from_utf8_lossy(bytes).into_owned(),
    };
    tracing::debug!(file_name, ?kind, chars = text.chars().count(), "extracted text");
    Ok(text)
}

/// Read and extract a document stored on disk.
pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    extract_document(name, &bytes)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_body_text(&xml)
}

/// Concatenate `w:t` runs; `w:p` ends a line, `w:tab` and `w:br` map to
/// their characters.
fn docx_body_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with(body: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
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
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn detects_by_extension_then_content() {
        assert_eq!(DocumentKind::detect("a.PDF", b"").unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::detect("notes.md", b"").unwrap(), DocumentKind::Text);
        assert_eq!(DocumentKind::detect("upload", b"%PDF-1.7").unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::detect("upload", b"PK\x03\x04..").unwrap(), DocumentKind::Docx);
        assert_eq!(DocumentKind::detect("upload.bin", b"plain").unwrap(), DocumentKind::Text);
    }

    #[test]
    fn binary_without_known_type_is_unsupported() {
        let err = extract_document("blob.bin", &[0xff, 0xfe, 0x00, 0x81]).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedType(ref t) if t == "bin"));
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(extract_document("a.txt", "héllo\nworld".as_bytes()).unwrap(), "héllo\nworld");
        assert_eq!(extract_document("empty.txt", b"").unwrap(), "");
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = docx_with(
            "<w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space=\"preserve\"> para</w:t></w:r></w:p>\
             <w:p><w:r><w:t>A &amp; B</w:t><w:tab/><w:t>C</w:t></w:r></w:p>",
        );
        assert_eq!(
            extract_document("report.docx", &bytes).unwrap(),
            "First para\nA & B\tC"
        );
    }

    #[test]
    fn docx_without_body_is_error() {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("other.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(
            extract_document("x.docx", &bytes),
            Err(ExtractError::Docx(_))
        ));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_document("x.pdf", b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn extract_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "on disk").unwrap();
        assert_eq!(extract_file(&path).unwrap(), "on disk");
        assert!(matches!(
            extract_file(&dir.path().join("missing.txt")),
            Err(ExtractError::Io(_))
        ));
    }
}
