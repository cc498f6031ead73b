use crate::case::Case;
use crate::config::{CoordConfig, LockConfig};
use crate::signature;
use chrono::{DateTime, TimeZone, Utc};
use dossier_core::evidence::METADATA_FILE;
use dossier_core::{store, CasePaths, CaseState, EvidenceFile, EvidenceMetadata};
use std::collections::BTreeMap;
use std::fs;

pub(crate) fn ts(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000 + offset_secs, 0)
        .single()
        .expect("valid ts")
}

pub(crate) fn fast_config() -> CoordConfig {
    CoordConfig {
        lock: LockConfig {
            timeout_ms: 200,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            stale_after_ms: 60_000,
        },
        allocation_stale_after_secs: 3_600,
    }
}

/// Case directory with a fresh `state.json` and quick lock timeouts.
pub(crate) fn new_case(dir: &tempfile::TempDir) -> Case {
    let paths = CasePaths::new(dir.path());
    store::save_state(&paths, &CaseState::new()).expect("seed state");
    Case::with_config(paths, fast_config())
}

/// Writes a signed capture for `source_id` under `evidence/`.
pub(crate) fn capture(case: &Case, source_id: &str, url: &str) {
    let dir = case.paths().evidence_for(source_id);
    fs::create_dir_all(&dir).expect("dir");
    fs::write(dir.join("capture.html"), b"<p>registry extract</p>").expect("html");
    let mut files = BTreeMap::new();
    files.insert(
        "html".to_string(),
        EvidenceFile {
            path: "capture.html".to_string(),
            hash: signature::hash_bytes(b"<p>registry extract</p>"),
            size: 23,
        },
    );
    let captured_at = "2026-10-03T10:00:00Z";
    let metadata = EvidenceMetadata {
        source_id: source_id.to_string(),
        url: url.to_string(),
        captured_at: captured_at.to_string(),
        capture_signature: Some(signature::sign(source_id, url, captured_at, &files)),
        files,
        method: Some("browser".to_string()),
        extra: BTreeMap::new(),
    };
    fs::write(
        dir.join(METADATA_FILE),
        serde_json::to_vec(&metadata).expect("encode"),
    )
    .expect("metadata");
}
