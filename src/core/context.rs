use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{normalize_lang_code, OutputFormat, RenderedDocument, StageFlags, StageName};
use crate::utils::hash_chain::{fingerprint_bytes, fingerprint_text, ContentHash};

/// State threaded through the pipeline for one job.
///
/// Stage outputs and their fingerprints are written together through the `set_*`
/// methods, at most once each, so a hash that has been used as a cache key always
/// describes the value stored next to it.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    raw: Vec<u8>,
    raw_hash: ContentHash,
    pub lang: String,
    target_lang: Option<String>,
    pub output_format: OutputFormat,
    pub title: String,
    pub use_cache: bool,

    preprocessed: Option<(Vec<u8>, ContentHash)>,
    text: Option<(String, ContentHash)>,
    translated: Option<(String, ContentHash)>,
    output: Option<RenderedDocument>,

    flags: [StageFlags; 4],
    /// Set by the whole-result lookup; the runner stops once this is true
    pub result_from_cache: bool,
}

impl ProcessingContext {
    pub fn new(
        raw: Vec<u8>,
        lang: impl Into<String>,
        output_format: OutputFormat,
        title: impl Into<String>,
    ) -> PipelineResult<Self> {
        if raw.is_empty() {
            return Err(PipelineError::Validation("image is empty".to_string()));
        }
        Ok(Self {
            raw_hash: fingerprint_bytes(&raw),
            raw,
            lang: lang.into(),
            target_lang: None,
            output_format,
            title: title.into(),
            use_cache: true,
            preprocessed: None,
            text: None,
            translated: None,
            output: None,
            flags: [StageFlags::default(); 4],
            result_from_cache: false,
        })
    }

    /// Set the translation target; blank targets mean "no translation".
    pub fn with_target_lang(mut self, target: Option<&str>) -> Self {
        self.target_lang = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(normalize_lang_code);
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_hash(&self) -> &ContentHash {
        &self.raw_hash
    }

    pub fn target_lang(&self) -> Option<&str> {
        self.target_lang.as_deref()
    }

    pub fn preprocessed(&self) -> Option<&[u8]> {
        self.preprocessed.as_ref().map(|(b, _)| b.as_slice())
    }

    pub fn preprocessed_hash(&self) -> Option<&ContentHash> {
        self.preprocessed.as_ref().map(|(_, h)| h)
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_ref().map(|(t, _)| t.as_str())
    }

    pub fn text_hash(&self) -> Option<&ContentHash> {
        self.text.as_ref().map(|(_, h)| h)
    }

    pub fn translated(&self) -> Option<&str> {
        self.translated.as_ref().map(|(t, _)| t.as_str())
    }

    pub fn translated_hash(&self) -> Option<&ContentHash> {
        self.translated.as_ref().map(|(_, h)| h)
    }

    /// Translated text when present, otherwise the recognized text
    pub fn best_text(&self) -> Option<&str> {
        self.translated().or_else(|| self.text())
    }

    /// Hash of [`Self::best_text`]
    pub fn best_text_hash(&self) -> Option<&ContentHash> {
        self.translated_hash().or_else(|| self.text_hash())
    }

    pub fn output(&self) -> Option<&RenderedDocument> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<RenderedDocument> {
        self.output.take()
    }

    pub fn set_preprocessed(&mut self, bytes: Vec<u8>) -> PipelineResult<()> {
        if self.preprocessed.is_some() {
            return Err(already_set("preprocessed image"));
        }
        let hash = fingerprint_bytes(&bytes);
        self.preprocessed = Some((bytes, hash));
        Ok(())
    }

    pub fn set_text(&mut self, text: String) -> PipelineResult<()> {
        if self.text.is_some() {
            return Err(already_set("recognized text"));
        }
        let hash = fingerprint_text(&text);
        self.text = Some((text, hash));
        Ok(())
    }

    pub fn set_translated(&mut self, translated: String) -> PipelineResult<()> {
        if self.translated.is_some() {
            return Err(already_set("translated text"));
        }
        let hash = fingerprint_text(&translated);
        self.translated = Some((translated, hash));
        Ok(())
    }

    pub fn set_output(&mut self, document: RenderedDocument) -> PipelineResult<()> {
        if self.output.is_some() {
            return Err(already_set("rendered output"));
        }
        self.output = Some(document);
        Ok(())
    }

    pub fn flags(&self, stage: StageName) -> StageFlags {
        self.flags[stage.index()]
    }

    pub fn flags_mut(&mut self, stage: StageName) -> &mut StageFlags {
        &mut self.flags[stage.index()]
    }

    /// True when any stage served a cached value in place of a failed engine call
    pub fn cache_fallback_used(&self) -> bool {
        self.flags.iter().any(|f| f.cache_fallback_used)
    }
}

fn already_set(what: &str) -> PipelineError {
    PipelineError::Invariant(format!("{} was already published", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ProcessingContext {
        ProcessingContext::new(b"img".to_vec(), "eng", OutputFormat::Txt, "Doc").unwrap()
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let result = ProcessingContext::new(Vec::new(), "eng", OutputFormat::Pdf, "Doc");
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_outputs_are_published_once() {
        let mut ctx = ctx();
        ctx.set_text("hello".to_string()).unwrap();
        let hash = ctx.text_hash().cloned();
        assert!(matches!(
            ctx.set_text("other".to_string()),
            Err(PipelineError::Invariant(_))
        ));
        assert_eq!(ctx.text(), Some("hello"));
        assert_eq!(ctx.text_hash().cloned(), hash);
    }

    #[test]
    fn test_translated_text_takes_precedence() {
        let mut ctx = ctx();
        ctx.set_text("xin chào".to_string()).unwrap();
        assert_eq!(ctx.best_text(), Some("xin chào"));
        ctx.set_translated("hello".to_string()).unwrap();
        assert_eq!(ctx.best_text(), Some("hello"));
        assert_eq!(ctx.best_text_hash(), ctx.translated_hash());
    }

    #[test]
    fn test_target_lang_is_normalized() {
        let ctx = ctx().with_target_lang(Some(" VIE "));
        assert_eq!(ctx.target_lang(), Some("vi"));
        assert_eq!(self::ctx().with_target_lang(Some("  ")).target_lang(), None);
    }

    #[test]
    fn test_fallback_flag_aggregates_stages() {
        let mut ctx = ctx();
        assert!(!ctx.cache_fallback_used());
        ctx.flags_mut(StageName::Translate).cache_fallback_used = true;
        assert!(ctx.cache_fallback_used());
        assert!(!ctx.flags(StageName::Recognize).cache_fallback_used);
    }
}
