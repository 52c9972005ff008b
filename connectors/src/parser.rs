use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use common::error::AppError;

use crate::retry::{check_response, transport_error, with_backoff, RetryPolicy};

/// Extensions decoded directly as text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "log", "json", "yaml", "yml", "toml", "xml", "html",
    "htm",
];
/// Extensions routed to the hosted document parser.
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "rtf"];
/// Extensions routed to the hosted image parser (OCR).
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp"];

/// bytes + filename + extension → text.
///
/// Unknown extensions yield empty text rather than an error; the caller
/// records the document without content and moves on.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, bytes: &Bytes, filename: &str, extension: &str)
        -> Result<String, AppError>;
}

/// Extension-routed parser: plain text inline, documents and images via the
/// two hosted endpoints when configured.
pub struct DefaultDocumentParser {
    http: reqwest::Client,
    document_endpoint: Option<String>,
    image_endpoint: Option<String>,
    retry: RetryPolicy,
}

impl DefaultDocumentParser {
    pub fn new(document_endpoint: Option<String>, image_endpoint: Option<String>) -> Self {
        Self {
            http: crate::retry::http_client(),
            document_endpoint,
            image_endpoint,
            retry: RetryPolicy::default(),
        }
    }

    async fn parse_hosted(
        &self,
        endpoint: &str,
        bytes: &Bytes,
        filename: &str,
    ) -> Result<String, AppError> {
        let mime = mime_guess::from_path(filename).first_or_octet_stream();

        let text = with_backoff(&self.retry, || {
            let request = self
                .http
                .post(endpoint)
                .header(reqwest::header::CONTENT_TYPE, mime.essence_str())
                .header("x-filename", filename)
                .body(bytes.clone());
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "hosted parser"))?;
                check_response(&response, "hosted parser")?;
                response
                    .text()
                    .await
                    .map_err(|e| transport_error(&e, "hosted parser body"))
            }
        })
        .await?;

        Ok(text)
    }
}

#[async_trait]
impl DocumentParser for DefaultDocumentParser {
    async fn parse(
        &self,
        bytes: &Bytes,
        filename: &str,
        extension: &str,
    ) -> Result<String, AppError> {
        let ext = extension.trim_start_matches('.').to_lowercase();

        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(decode_text(bytes));
        }

        if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            if let Some(endpoint) = &self.document_endpoint {
                return self.parse_hosted(endpoint, bytes, filename).await;
            }
            warn!(filename, "no document parser endpoint configured; skipping content");
            return Ok(String::new());
        }

        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            if let Some(endpoint) = &self.image_endpoint {
                return self.parse_hosted(endpoint, bytes, filename).await;
            }
            warn!(filename, "no image parser endpoint configured; skipping content");
            return Ok(String::new());
        }

        debug!(filename, extension = %ext, "unknown extension; returning empty text");
        Ok(String::new())
    }
}

/// Lossy UTF-8 decode; parser inputs are already size-capped upstream.
fn decode_text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> DefaultDocumentParser {
        DefaultDocumentParser::new(None, None)
    }

    #[tokio::test]
    async fn plain_text_extensions_decode_inline() {
        let bytes = Bytes::from_static("release notes\nline two".as_bytes());
        let text = parser()
            .parse(&bytes, "notes.txt", "txt")
            .await
            .expect("parse");
        assert_eq!(text, "release notes\nline two");

        let text = parser()
            .parse(&bytes, "notes.md", ".md")
            .await
            .expect("dotted extension also accepted");
        assert!(!text.is_empty());
    }

    #[tokio::test]
    async fn unknown_extensions_return_empty_text() {
        let bytes = Bytes::from_static(b"\x00\x01\x02");
        let text = parser()
            .parse(&bytes, "blob.bin", "bin")
            .await
            .expect("parse");
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn hosted_formats_without_endpoint_degrade_to_empty() {
        let bytes = Bytes::from_static(b"%PDF-1.7 ...");
        let text = parser()
            .parse(&bytes, "report.pdf", "pdf")
            .await
            .expect("parse");
        assert!(text.is_empty());

        let text = parser()
            .parse(&bytes, "scan.png", "png")
            .await
            .expect("parse");
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let bytes = Bytes::from(vec![0x68, 0x69, 0xFF, 0x21]);
        let text = parser().parse(&bytes, "weird.txt", "txt").await.expect("parse");
        assert!(text.starts_with("hi"));
        assert!(text.ends_with('!'));
    }
}
