use crate::error::StoreError;
use crate::evidence::{EvidenceMetadata, METADATA_FILE};
use crate::leads::LeadsFile;
use crate::ledger::LedgerFile;
use crate::sources::SourceCatalog;
use crate::state::CaseState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const STATE_FILE: &str = "state.json";
pub const SOURCES_FILE: &str = "sources.json";
pub const LEADS_FILE: &str = "leads.json";
pub const LEDGER_FILE: &str = "ledger.json";
pub const FINDINGS_FILE: &str = "findings.md";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Well-known locations inside one case directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasePaths {
    pub root: PathBuf,
    pub state: PathBuf,
    pub sources: PathBuf,
    pub leads: PathBuf,
    pub ledger: PathBuf,
    pub findings: PathBuf,
    pub plan: PathBuf,
    pub questions_dir: PathBuf,
    pub article: PathBuf,
    pub audits_dir: PathBuf,
    pub batches_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub config: PathBuf,
}

impl CasePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state: root.join(STATE_FILE),
            sources: root.join(SOURCES_FILE),
            leads: root.join(LEADS_FILE),
            ledger: root.join(LEDGER_FILE),
            findings: root.join(FINDINGS_FILE),
            plan: root.join("plan.md"),
            questions_dir: root.join("questions"),
            article: root.join("articles").join("full.md"),
            audits_dir: root.join("audits"),
            batches_dir: root.join("batches"),
            evidence_dir: root.join("evidence"),
            config: root.join(".dossier").join("config.json"),
            root,
        }
    }

    pub fn case_id(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "case".to_string())
    }

    pub fn evidence_for(&self, source_id: &str) -> PathBuf {
        self.evidence_dir.join(source_id)
    }

    pub fn evidence_metadata_for(&self, source_id: &str) -> PathBuf {
        self.evidence_for(source_id).join(METADATA_FILE)
    }

    pub fn audit_for(&self, gate: &str) -> PathBuf {
        self.audits_dir.join(format!("{gate}.json"))
    }

    pub fn batch_results_for(&self, batch_id: &str) -> PathBuf {
        self.batches_dir.join(format!("{batch_id}.json"))
    }

    /// Relative form of `path` for storing inside case files.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

/// Writes `bytes` next to `path` and renames over it, so readers only ever
/// see the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp_path = tmp_path_for(path);
    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if let Err(source) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_err(source));
    }
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    what: &'static str,
) -> Result<(), StoreError> {
    let mut payload = serde_json::to_string_pretty(value)
        .map_err(|source| StoreError::Serialize { what, source })?;
    payload.push('\n');
    write_atomic(path, payload.as_bytes())
}

/// Loads `state.json`; a case without one has not been initialized.
pub fn load_state(paths: &CasePaths) -> Result<CaseState, StoreError> {
    read_json(&paths.state)?.ok_or_else(|| StoreError::Missing {
        path: paths.state.clone(),
    })
}

pub fn save_state(paths: &CasePaths, state: &CaseState) -> Result<(), StoreError> {
    write_json_atomic(&paths.state, state, "state")
}

pub fn load_leads(paths: &CasePaths) -> Result<LeadsFile, StoreError> {
    Ok(read_json(&paths.leads)?.unwrap_or_default())
}

pub fn save_leads(paths: &CasePaths, leads: &LeadsFile) -> Result<(), StoreError> {
    write_json_atomic(&paths.leads, leads, "leads")
}

pub fn load_sources(paths: &CasePaths) -> Result<SourceCatalog, StoreError> {
    let Some(raw) = read_json::<Value>(&paths.sources)? else {
        return Ok(SourceCatalog::default());
    };
    SourceCatalog::from_value(raw).map_err(|reason| StoreError::UnsupportedLayout {
        path: paths.sources.clone(),
        reason,
    })
}

pub fn save_sources(paths: &CasePaths, catalog: &SourceCatalog) -> Result<(), StoreError> {
    let value = catalog
        .to_value()
        .map_err(|source| StoreError::Serialize {
            what: "sources",
            source,
        })?;
    write_json_atomic(&paths.sources, &value, "sources")
}

pub fn load_ledger(paths: &CasePaths) -> Result<Option<LedgerFile>, StoreError> {
    read_json(&paths.ledger)
}

pub fn save_ledger(paths: &CasePaths, ledger: &LedgerFile) -> Result<(), StoreError> {
    write_json_atomic(&paths.ledger, ledger, "ledger")
}

pub fn load_evidence_metadata(path: &Path) -> Result<Option<EvidenceMetadata>, StoreError> {
    read_json(path)
}

/// Appends `text` to a plain-text file through the same replace-by-rename
/// path as the JSON files.
pub fn append_text_atomic(path: &Path, text: &str) -> Result<(), StoreError> {
    let mut content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    content.push_str(text);
    write_atomic(path, content.as_bytes())
}
