use crate::case::Case;
use crate::error::CoordError;
use crate::signature;
use chrono::{DateTime, Utc};
use dossier_core::evidence::METADATA_FILE;
use dossier_core::ledger::RESERVED_FIELDS;
use dossier_core::{store, LedgerEntry, LedgerEntryType, LedgerFile};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub type Fields = BTreeMap<String, Value>;

/// Appends one entry after checking its declared fields.
///
/// `source_capture` entries are only written when the referenced evidence
/// metadata exists and passes signature verification. Fields may not
/// shadow the entry's own `id`, `type` or `ts`.
pub fn append(
    case: &Case,
    kind: LedgerEntryType,
    fields: Fields,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, CoordError> {
    if let Some(field) = RESERVED_FIELDS.iter().find(|field| fields.contains_key(**field)) {
        return Err(CoordError::ReservedField {
            kind,
            field: field.to_string(),
        });
    }
    for field in kind.required_fields() {
        if fields.get(*field).map_or(true, Value::is_null) {
            return Err(CoordError::MissingField { kind, field });
        }
    }
    if kind == LedgerEntryType::SourceCapture {
        check_source_capture(case, &fields)?;
    }

    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.ledger)?;
    let mut ledger = store::load_ledger(paths)?
        .unwrap_or_else(|| LedgerFile::new(paths.case_id(), now));
    let entry = ledger.push(kind, fields, now).clone();
    store::save_ledger(paths, &ledger)?;

    info!(event = "ledger_append", id = %entry.id, kind = %kind);
    Ok(entry)
}

/// [`append`] with the entry type given as text.
pub fn append_raw(
    case: &Case,
    kind: &str,
    fields: Fields,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, CoordError> {
    let kind = kind
        .parse::<LedgerEntryType>()
        .map_err(|_| CoordError::UnknownEntryType(kind.to_string()))?;
    append(case, kind, fields, now)
}

/// Entries in append order, optionally of one type. Reads without locking.
pub fn entries(
    case: &Case,
    filter: Option<LedgerEntryType>,
) -> Result<Vec<LedgerEntry>, CoordError> {
    let Some(ledger) = store::load_ledger(case.paths())? else {
        return Ok(Vec::new());
    };
    Ok(ledger
        .entries
        .into_iter()
        .filter(|entry| filter.map_or(true, |kind| entry.kind == kind))
        .collect())
}

fn resolve_metadata_path(root: &Path, evidence_path: &str) -> PathBuf {
    let path = Path::new(evidence_path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    if path.is_dir() {
        path.join(METADATA_FILE)
    } else {
        path
    }
}

fn check_source_capture(case: &Case, fields: &Fields) -> Result<(), CoordError> {
    let source_id = field_text(fields, "source_id");
    let Some(evidence_path) = fields.get("evidence_path").and_then(Value::as_str) else {
        return Err(CoordError::InvalidField {
            kind: LedgerEntryType::SourceCapture,
            field: "evidence_path",
            expected: "a string",
        });
    };

    let metadata_path = resolve_metadata_path(&case.paths().root, evidence_path);
    let content = match fs::read_to_string(&metadata_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoordError::EvidenceMissing {
                path: metadata_path,
            });
        }
        Err(source) => {
            return Err(CoordError::Io {
                path: metadata_path,
                source,
            });
        }
    };
    let metadata: Value = serde_json::from_str(&content).map_err(|err| {
        CoordError::SignatureInvalid {
            source_id: source_id.clone(),
            reason: format!("malformed metadata: {err}"),
        }
    })?;

    let verdict = signature::verify_value(&metadata);
    if !verdict.valid {
        warn!(
            event = "source_capture_rejected",
            source_id = %source_id,
            path = %metadata_path.display(),
            reason = %verdict.reason
        );
        return Err(CoordError::SignatureInvalid {
            source_id,
            reason: verdict.reason,
        });
    }

    let recorded = metadata.get("source_id").and_then(Value::as_str).unwrap_or("");
    if recorded != source_id {
        return Err(CoordError::SignatureInvalid {
            reason: format!("metadata belongs to {recorded}"),
            source_id,
        });
    }
    Ok(())
}

fn field_text(fields: &Fields, name: &str) -> String {
    match fields.get(name) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
