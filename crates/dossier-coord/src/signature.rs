//! Capture signatures bind evidence metadata to the hashes of the files the
//! capture tool actually wrote. They carry no secret: the point is to tell a
//! real capture apart from metadata an agent typed out itself.

use dossier_core::evidence::METADATA_FILE;
use dossier_core::{EvidenceFile, EvidenceMetadata};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

pub const SIGNATURE_SCHEME: &str = "v1";
const SIGNATURE_SALT: &str = "dossier-capture::7c1e9b42";
const SIGNATURE_HEX_CHARS: usize = 32;

/// Prose an agent writes about a page. Capture tools never emit these.
pub const AGENT_AUTHORED_FIELDS: [&str; 5] =
    ["summary", "key_facts", "key_points", "analysis", "takeaways"];

pub const REASON_VALID: &str = "valid";
pub const REASON_LEGACY: &str = "legacy capture (unsigned)";
pub const REASON_MISSING_SIGNATURE: &str = "missing capture_signature";
pub const REASON_MISMATCH: &str = "signature mismatch";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub reason: String,
}

impl Verification {
    fn accept(reason: impl Into<String>) -> Self {
        Self {
            valid: true,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

pub fn sign(
    source_id: &str,
    url: &str,
    captured_at: &str,
    files: &BTreeMap<String, EvidenceFile>,
) -> String {
    sign_with_salt(source_id, url, captured_at, files, SIGNATURE_SALT)
}

fn sign_with_salt(
    source_id: &str,
    url: &str,
    captured_at: &str,
    files: &BTreeMap<String, EvidenceFile>,
    salt: &str,
) -> String {
    let mut hashes: Vec<&str> = files.values().map(|file| file.hash.as_str()).collect();
    hashes.sort_unstable();

    let joined_hashes = hashes.join("|");
    let payload = [
        SIGNATURE_SCHEME,
        source_id,
        url,
        captured_at,
        joined_hashes.as_str(),
        salt,
    ]
    .join("|");
    let digest = Sha256::digest(payload.as_bytes());
    format!(
        "{SIGNATURE_SCHEME}:{}",
        hex_prefix(&digest, SIGNATURE_HEX_CHARS / 2)
    )
}

pub fn sign_metadata(metadata: &EvidenceMetadata) -> String {
    sign(
        &metadata.source_id,
        &metadata.url,
        &metadata.captured_at,
        &metadata.files,
    )
}

fn hex_prefix(digest: &[u8], bytes: usize) -> String {
    let mut output = String::with_capacity(bytes * 2);
    for byte in digest.iter().take(bytes) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Checks metadata as written. The agent-authored field rule runs first and
/// cannot be satisfied by a matching signature.
pub fn verify(metadata: &EvidenceMetadata) -> Verification {
    if let Some(field) = AGENT_AUTHORED_FIELDS
        .iter()
        .find(|field| metadata.has_field(field))
    {
        return Verification::reject(format!("agent-authored field present: {field}"));
    }

    match metadata.capture_signature.as_deref() {
        Some(signature) => {
            if signature.as_bytes() == sign_metadata(metadata).as_bytes() {
                Verification::accept(REASON_VALID)
            } else {
                Verification::reject(REASON_MISMATCH)
            }
        }
        None if !metadata.files.is_empty() && metadata.method.is_some() => {
            Verification::accept(REASON_LEGACY)
        }
        None => Verification::reject(REASON_MISSING_SIGNATURE),
    }
}

/// Like [`verify`], for metadata that has not been parsed yet.
pub fn verify_value(value: &Value) -> Verification {
    if let Some(object) = value.as_object() {
        if let Some(field) = AGENT_AUTHORED_FIELDS
            .iter()
            .find(|field| object.contains_key(**field))
        {
            return Verification::reject(format!("agent-authored field present: {field}"));
        }
    }
    match serde_json::from_value::<EvidenceMetadata>(value.clone()) {
        Ok(metadata) => verify(&metadata),
        Err(err) => Verification::reject(format!("malformed metadata: {err}")),
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{}", hex_prefix(&digest, digest.len()))
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    Ok(format!("sha256:{}", hex_prefix(&digest, digest.len())))
}

fn resolve_evidence_file(dir: &Path, recorded: &str) -> PathBuf {
    let recorded = Path::new(recorded);
    if recorded.is_absolute() {
        return recorded.to_path_buf();
    }
    let direct = dir.join(recorded);
    if direct.exists() {
        return direct;
    }
    match recorded.file_name() {
        Some(name) => dir.join(name),
        None => direct,
    }
}

/// Verifies `dir/metadata.json` and re-hashes every listed file on disk.
pub fn verify_evidence_dir(dir: &Path) -> Verification {
    let metadata_path = dir.join(METADATA_FILE);
    let content = match fs::read_to_string(&metadata_path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Verification::reject(format!("missing {METADATA_FILE}"));
        }
        Err(err) => return Verification::reject(format!("unreadable {METADATA_FILE}: {err}")),
    };
    let value: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(err) => return Verification::reject(format!("malformed metadata: {err}")),
    };

    let verdict = verify_value(&value);
    if !verdict.valid {
        return verdict;
    }
    let Ok(metadata) = serde_json::from_value::<EvidenceMetadata>(value) else {
        return Verification::reject("malformed metadata");
    };

    for (kind, file) in &metadata.files {
        let path = resolve_evidence_file(dir, &file.path);
        match hash_file(&path) {
            Ok(actual) if actual == file.hash => {}
            Ok(_) => return Verification::reject(format!("file hash mismatch: {kind}")),
            Err(_) => return Verification::reject(format!("missing file: {kind}")),
        }
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn files() -> BTreeMap<String, EvidenceFile> {
        let mut files = BTreeMap::new();
        files.insert(
            "content".to_string(),
            EvidenceFile {
                path: "content.md".to_string(),
                hash: hash_bytes(b"# Harbor fire\n"),
                size: 14,
            },
        );
        files.insert(
            "html".to_string(),
            EvidenceFile {
                path: "capture.html".to_string(),
                hash: hash_bytes(b"<html></html>"),
                size: 13,
            },
        );
        files
    }

    fn signed_metadata() -> EvidenceMetadata {
        let files = files();
        let signature = sign("S001", "https://port.example/fire", "2026-10-01T12:00:00Z", &files);
        EvidenceMetadata {
            source_id: "S001".to_string(),
            url: "https://port.example/fire".to_string(),
            captured_at: "2026-10-01T12:00:00Z".to_string(),
            files,
            capture_signature: Some(signature),
            method: Some("browser".to_string()),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn signature_is_deterministic_and_versioned() {
        let a = signed_metadata();
        let b = signed_metadata();
        assert_eq!(a.capture_signature, b.capture_signature);
        let signature = a.capture_signature.expect("signature");
        assert!(signature.starts_with("v1:"));
        assert_eq!(signature.len(), 3 + SIGNATURE_HEX_CHARS);
    }

    #[test]
    fn signature_ignores_file_order() {
        let metadata = signed_metadata();
        let mut reordered = BTreeMap::new();
        for (index, (_, file)) in metadata.files.iter().rev().enumerate() {
            reordered.insert(format!("k{index}"), file.clone());
        }
        assert_eq!(
            sign(&metadata.source_id, &metadata.url, &metadata.captured_at, &reordered),
            sign_metadata(&metadata)
        );
    }

    #[test]
    fn signed_metadata_verifies() {
        assert_eq!(verify(&signed_metadata()), Verification::accept(REASON_VALID));
    }

    #[test]
    fn single_changed_hash_character_invalidates() {
        let mut metadata = signed_metadata();
        if let Some(file) = metadata.files.get_mut("content") {
            let mut hash = file.hash.clone();
            let last = hash.pop().expect("non-empty");
            hash.push(if last == '0' { '1' } else { '0' });
            file.hash = hash;
        }
        assert_eq!(verify(&metadata), Verification::reject(REASON_MISMATCH));
    }

    #[test]
    fn different_salt_is_a_mismatch() {
        let mut metadata = signed_metadata();
        metadata.capture_signature = Some(sign_with_salt(
            &metadata.source_id,
            &metadata.url,
            &metadata.captured_at,
            &metadata.files,
            "some-other-salt",
        ));
        let verdict = verify(&metadata);
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, "signature mismatch");
    }

    #[test]
    fn agent_prose_is_rejected_even_with_valid_signature() {
        let mut metadata = signed_metadata();
        metadata
            .extra
            .insert("summary".to_string(), json!("The fire started at pier 4."));
        assert!(!verify(&metadata).valid);
        assert_eq!(
            verify(&metadata).reason,
            "agent-authored field present: summary"
        );
    }

    #[test]
    fn legacy_unsigned_capture_is_accepted_only_with_files_and_method() {
        let mut metadata = signed_metadata();
        metadata.capture_signature = None;
        assert_eq!(verify(&metadata), Verification::accept(REASON_LEGACY));

        metadata.method = None;
        assert_eq!(
            verify(&metadata),
            Verification::reject(REASON_MISSING_SIGNATURE)
        );

        metadata.method = Some("browser".to_string());
        metadata.files.clear();
        assert_eq!(
            verify(&metadata),
            Verification::reject(REASON_MISSING_SIGNATURE)
        );
    }

    #[test]
    fn verify_value_rejects_prose_before_parsing() {
        let verdict = verify_value(&json!({"key_facts": ["a", "b"], "url": "x"}));
        assert_eq!(verdict.reason, "agent-authored field present: key_facts");
        let verdict = verify_value(&json!({"url": "x"}));
        assert!(verdict.reason.starts_with("malformed metadata"));
    }

    #[test]
    fn evidence_dir_checks_files_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("content.md"), b"# Harbor fire\n").expect("content");
        fs::write(dir.path().join("capture.html"), b"<html></html>").expect("html");
        let metadata = signed_metadata();
        fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata).expect("encode"),
        )
        .expect("metadata");
        assert!(verify_evidence_dir(dir.path()).valid);

        fs::write(dir.path().join("capture.html"), b"<html>edited</html>").expect("edit");
        assert_eq!(
            verify_evidence_dir(dir.path()).reason,
            "file hash mismatch: html"
        );

        fs::remove_file(dir.path().join("capture.html")).expect("remove");
        assert_eq!(verify_evidence_dir(dir.path()).reason, "missing file: html");
    }

    #[test]
    fn evidence_dir_without_metadata_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            verify_evidence_dir(dir.path()),
            Verification::reject("missing metadata.json")
        );
    }
}
