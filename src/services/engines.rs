// Contracts for the external engines the pipeline drives
//
// Implementations are free to call remote services; the pipeline wraps OCR and
// translation calls in circuit breakers. Errors are engine failures unless they carry
// an `InvalidInput`, which fails the job without re-delivery.

use anyhow::Result;
use async_trait::async_trait;

pub use crate::core::errors::InvalidInput;
use crate::core::types::RenderedDocument;
use crate::services::cache::StagePayload;

#[async_trait]
pub trait ImagePreprocessor: Send + Sync {
    /// Normalize raw image bytes for recognition.
    async fn preprocess(&self, image: &[u8]) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize text in a (preprocessed) image. `lang` is a hint such as `eng+vie`.
    async fn recognize(&self, image: &[u8], lang: &str) -> Result<String>;
}

#[async_trait]
pub trait TranslationEngine: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String>;
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Render normalized text into a document titled `title`.
    async fn render(&self, text: &str, title: &str) -> Result<RenderedDocument>;
}

impl StagePayload for RenderedDocument {
    fn from_legacy(_raw: &[u8]) -> Option<Self> {
        // bare bytes carry no mime or filename
        None
    }
}
