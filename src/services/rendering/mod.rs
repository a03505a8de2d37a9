use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::core::types::{Blob, OutputFormat, RenderedDocument};
use crate::services::engines::DocumentRenderer;

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static TRAILING_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+\n").unwrap());

/// Canonical form of text handed to a renderer.
///
/// CRLF and CR become LF, trailing spaces are dropped, runs of blank lines collapse
/// to one and the whole text is trimmed. Text that differs only in these ways
/// renders identically.
pub fn normalize_document_text(text: &str) -> String {
    let unix = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_lines = TRAILING_SPACE.replace_all(&unix, "\n");
    BLANK_RUNS.replace_all(&trimmed_lines, "\n\n").trim().to_string()
}

/// UTF-8 text document
#[derive(Debug, Clone, Default)]
pub struct PlainTextRenderer;

#[async_trait]
impl DocumentRenderer for PlainTextRenderer {
    async fn render(&self, text: &str, title: &str) -> Result<RenderedDocument> {
        Ok(RenderedDocument {
            bytes: Blob(text.as_bytes().to_vec()),
            mime: OutputFormat::Txt.mime().to_string(),
            filename: OutputFormat::Txt.filename(title),
        })
    }
}

/// One renderer slot per [`OutputFormat`].
///
/// Plain text is always available; PDF and word-processor renderers are supplied by
/// the embedding service.
#[derive(Clone)]
pub struct Renderers {
    pdf: Option<Arc<dyn DocumentRenderer>>,
    docx: Option<Arc<dyn DocumentRenderer>>,
    txt: Arc<dyn DocumentRenderer>,
}

impl Renderers {
    pub fn new() -> Self {
        Self {
            pdf: None,
            docx: None,
            txt: Arc::new(PlainTextRenderer),
        }
    }

    pub fn with_pdf(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.pdf = Some(renderer);
        self
    }

    pub fn with_docx(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.docx = Some(renderer);
        self
    }

    pub fn with_txt(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.txt = renderer;
        self
    }

    pub fn for_format(&self, format: OutputFormat) -> Option<&Arc<dyn DocumentRenderer>> {
        match format {
            OutputFormat::Pdf => self.pdf.as_ref(),
            OutputFormat::Docx => self.docx.as_ref(),
            OutputFormat::Txt => Some(&self.txt),
        }
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        self.for_format(format).is_some()
    }
}

impl Default for Renderers {
    fn default() -> Self {
        Self::new()
    }
}
