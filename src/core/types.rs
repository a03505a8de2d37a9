// Shared value types for the pipeline and the job orchestrator

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The four content-addressed stages of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Preprocess,
    Recognize,
    Translate,
    Export,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Preprocess,
        StageName::Recognize,
        StageName::Translate,
        StageName::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Preprocess => "preprocess",
            StageName::Recognize => "recognize",
            StageName::Translate => "translate",
            StageName::Export => "export",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            StageName::Preprocess => 0,
            StageName::Recognize => 1,
            StageName::Translate => 2,
            StageName::Export => 3,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Docx,
    Txt,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Docx => "docx",
            OutputFormat::Txt => "txt",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            OutputFormat::Txt => "text/plain",
        }
    }

    /// `<title>.<extension>`
    pub fn filename(&self, title: &str) -> String {
        format!("{}.{}", title, self.as_str())
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pdf" => Ok(OutputFormat::Pdf),
            "docx" => Ok(OutputFormat::Docx),
            "txt" => Ok(OutputFormat::Txt),
            other => Err(format!("unsupported output format: {}", other)),
        }
    }
}

/// Cache flags recorded for one stage of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    /// Value was read from the stage cache instead of computed.
    pub from_cache: bool,
    /// Engine call failed and a cached value was served instead (degraded).
    pub cache_fallback_used: bool,
}

/// Byte payload that serializes as a base64 string.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn decode_base64(encoded: &str) -> Option<Self> {
        general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .map(Blob)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}

/// Rendered document bytes plus the metadata a caller needs to serve them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub bytes: Blob,
    pub mime: String,
    pub filename: String,
}

/// Map three-letter and legacy language codes to the two-letter codes translation
/// engines expect. Unknown codes pass through lowercased.
pub fn normalize_lang_code(code: &str) -> String {
    let code = code.trim().to_lowercase();
    match code.as_str() {
        "vie" => "vi".to_string(),
        "eng" => "en".to_string(),
        "fra" | "fre" => "fr".to_string(),
        "jp" | "jpn" => "ja".to_string(),
        "kor" => "ko".to_string(),
        _ => code,
    }
}
