// Versioned cache envelope
//
// Every stage value is written as `{version, payload, meta}`. Reads go through
// `migrate`, which maps each known version onto the current payload shape. Entries
// that are not envelopes at all are handed to `StagePayload::from_legacy`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::CacheStoreError;
use crate::core::types::Blob;

/// Version written by this crate
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// On-the-wire cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub version: u32,
    pub payload: Value,
    #[serde(default)]
    pub meta: EnvelopeMeta,
}

/// Shape accepted on read: the unversioned `{payload, meta}` form is version 0.
#[derive(Debug, Deserialize)]
struct StoredEnvelope {
    #[serde(default)]
    version: Option<u32>,
    payload: Value,
    #[serde(default)]
    meta: EnvelopeMeta,
}

/// A value that can live in a stage cache entry.
pub trait StagePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Interpret bytes that were not written as an envelope.
    fn from_legacy(raw: &[u8]) -> Option<Self>;
}

impl StagePayload for String {
    fn from_legacy(raw: &[u8]) -> Option<Self> {
        std::str::from_utf8(raw).ok().map(str::to_string)
    }
}

impl StagePayload for Blob {
    fn from_legacy(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        match std::str::from_utf8(raw) {
            Ok(text) => Blob::decode_base64(text),
            Err(_) => Some(Blob(raw.to_vec())),
        }
    }
}

/// Wrap `payload` in a current-version envelope and serialize it.
pub fn encode<T: StagePayload>(payload: &T, stage: &str) -> Result<Vec<u8>, CacheStoreError> {
    let envelope = CacheEnvelope {
        version: ENVELOPE_VERSION,
        payload: serde_json::to_value(payload)?,
        meta: EnvelopeMeta {
            stage: Some(stage.to_string()),
            created_at: Some(Utc::now()),
        },
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode stored bytes into a payload, or `None` if they cannot be used.
pub fn decode<T: StagePayload>(raw: &[u8]) -> Option<T> {
    match serde_json::from_slice::<StoredEnvelope>(raw) {
        Ok(stored) => {
            let envelope = migrate(stored)?;
            serde_json::from_value(envelope.payload).ok()
        }
        Err(_) => T::from_legacy(raw),
    }
}

/// Bring a stored envelope up to [`ENVELOPE_VERSION`]. Unknown versions are dropped.
fn migrate(stored: StoredEnvelope) -> Option<CacheEnvelope> {
    match stored.version.unwrap_or(0) {
        // v0 had the same payload shape, only the tag was missing
        0 | ENVELOPE_VERSION => Some(CacheEnvelope {
            version: ENVELOPE_VERSION,
            payload: stored.payload,
            meta: stored.meta,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_envelope_decodes() {
        let raw = encode(&"xin chào".to_string(), "recognize").unwrap();
        let decoded: Option<String> = decode(&raw);
        assert_eq!(decoded.as_deref(), Some("xin chào"));

        let envelope: CacheEnvelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert_eq!(envelope.meta.stage.as_deref(), Some("recognize"));
    }

    #[test]
    fn test_unversioned_envelope_migrates() {
        let raw = br#"{"payload":"hello","meta":{}}"#;
        assert_eq!(decode::<String>(raw).as_deref(), Some("hello"));
    }

    #[test]
    fn test_future_version_is_a_miss() {
        let raw = br#"{"version":99,"payload":"hello"}"#;
        assert_eq!(decode::<String>(raw), None);
    }

    #[test]
    fn test_plain_text_is_legacy_value() {
        assert_eq!(decode::<String>(b"old cached text").as_deref(), Some("old cached text"));
    }

    #[test]
    fn test_legacy_blob_accepts_base64_and_raw_bytes() {
        assert_eq!(decode::<Blob>(b"aGk=").map(Blob::into_inner), Some(b"hi".to_vec()));
        let png_magic = [0x89, b'P', b'N', b'G'];
        assert_eq!(
            decode::<Blob>(&png_magic).map(Blob::into_inner),
            Some(png_magic.to_vec())
        );
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Counts {
        hits: u32,
    }

    impl StagePayload for Counts {
        fn from_legacy(_raw: &[u8]) -> Option<Self> {
            None
        }
    }

    #[test]
    fn test_payload_type_mismatch_is_a_miss() {
        let raw = encode(&"text".to_string(), "translate").unwrap();
        assert!(decode::<Counts>(&raw).is_none());
        assert!(decode::<Counts>(b"not json").is_none());
    }
}
