// Content-addressed stage cache
//
// `store` is the key-value contract plus the in-memory implementation, `envelope` the
// versioned entry format, `stage_cache` the get-or-compute wrapper used by each stage.

pub mod envelope;
pub mod stage_cache;
pub mod store;

pub use envelope::{CacheEnvelope, StagePayload, ENVELOPE_VERSION};
pub use stage_cache::{stage_key, StageCache};
pub use store::{CacheStore, MemoryCacheStore};
