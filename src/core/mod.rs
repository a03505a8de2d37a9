pub mod config;
pub mod context;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use context::ProcessingContext;
pub use errors::{
    BreakerError, CacheStoreError, ConfigError, JobError, PipelineError, PipelineResult,
};
pub use types::{Blob, OutputFormat, RenderedDocument, StageFlags, StageName};
