use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceFile {
    pub path: String,
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

/// `evidence/<source_id>/metadata.json`, written by the capture tool.
///
/// `captured_at` stays a string: the signature covers its exact text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceMetadata {
    pub source_id: String,
    pub url: String,
    pub captured_at: String,
    #[serde(default)]
    pub files: BTreeMap<String, EvidenceFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl EvidenceMetadata {
    pub fn sorted_hashes(&self) -> Vec<&str> {
        let mut hashes: Vec<&str> = self.files.values().map(|file| file.hash.as_str()).collect();
        hashes.sort_unstable();
        hashes
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.extra.contains_key(name)
    }
}
