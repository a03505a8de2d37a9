pub mod hash_chain;
pub mod logging;
pub mod metrics;

// Re-export commonly used items
pub use hash_chain::{fingerprint, fingerprint_bytes, fingerprint_text, ContentHash, Part};
pub use logging::{init_from_config, init_tracing};
pub use metrics::{CacheStats, Metrics, MetricsSnapshot};
