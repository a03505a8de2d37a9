pub mod cache;
pub mod engines;
pub mod preprocess;
pub mod rendering;

// Re-export commonly used services
pub use cache::{CacheStore, MemoryCacheStore, StageCache};
pub use engines::{DocumentRenderer, ImagePreprocessor, OcrEngine, TranslationEngine};
pub use preprocess::ImageNormalizer;
pub use rendering::{PlainTextRenderer, Renderers};
