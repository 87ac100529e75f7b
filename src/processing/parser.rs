//! Document parsing capability.
//!
//! PDF/DOCX extraction is an external collaborator; the pipeline consumes
//! it through this trait. A plain-text implementation ships for `.txt`
//! uploads and for tests.

use async_trait::async_trait;

/// `ParseDocument(bytes, filename) → text` capability.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, bytes: &[u8], filename: &str) -> anyhow::Result<String>;
}

/// Supported upload extensions.
pub fn is_supported_file_type(extension: &str) -> bool {
    matches!(extension, "pdf" | "docx" | "txt")
}

pub fn file_extension(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .filter(|ext| *ext != filename)
        .unwrap_or("")
        .to_lowercase()
}

/// Decodes `.txt` uploads; rejects everything else.
pub struct PlainTextParser;

#[async_trait]
impl DocumentParser for PlainTextParser {
    async fn parse(&self, bytes: &[u8], filename: &str) -> anyhow::Result<String> {
        let ext = file_extension(filename);
        if ext != "txt" {
            anyhow::bail!("unsupported file type: {filename}");
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_extraction() {
        assert_eq!(file_extension("ГОСТ 27751-2014.pdf"), "pdf");
        assert_eq!(file_extension("report.DOCX"), "docx");
        assert_eq!(file_extension("noext"), "");
    }

    #[tokio::test]
    async fn plain_text_parser_accepts_only_txt() {
        let parser = PlainTextParser;
        let ok = parser.parse("привет".as_bytes(), "note.txt").await.unwrap();
        assert_eq!(ok, "привет");
        assert!(parser.parse(b"%PDF-1.4", "doc.pdf").await.is_err());
    }
}
