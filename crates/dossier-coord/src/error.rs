use dossier_core::{CounterError, IdKind, LeadStatus, LedgerEntryType, StoreError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("timed out after {waited_ms}ms waiting for lock on {}", resource.display())]
    LockTimeout { resource: PathBuf, waited_ms: u64 },
    #[error("lock error on {}: {source}", path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{kind} allocation not found: {batch_id}")]
    AllocationNotFound { kind: IdKind, batch_id: String },
    #[error("{kind} allocation rejected: {source}")]
    Allocation {
        kind: IdKind,
        #[source]
        source: CounterError,
    },
    #[error("evidence for {source_id} rejected: {reason}")]
    SignatureInvalid { source_id: String, reason: String },
    #[error("evidence metadata not found at {}", path.display())]
    EvidenceMissing { path: PathBuf },
    #[error("unknown ledger entry type: {0}")]
    UnknownEntryType(String),
    #[error("{kind} entry is missing required field '{field}'")]
    MissingField {
        kind: LedgerEntryType,
        field: &'static str,
    },
    #[error("{kind} entry may not set reserved field '{field}'")]
    ReservedField { kind: LedgerEntryType, field: String },
    #[error("{kind} entry field '{field}' must be {expected}")]
    InvalidField {
        kind: LedgerEntryType,
        field: &'static str,
        expected: &'static str,
    },
    #[error("source {0} is already registered")]
    DuplicateSource(String),
    #[error("source {0} not found")]
    SourceNotFound(String),
    #[error("lead {0} not found")]
    LeadNotFound(String),
    #[error("lead {id} cannot move from {from} to {to}")]
    InvalidLeadTransition {
        id: String,
        from: LeadStatus,
        to: LeadStatus,
    },
    #[error("batch results not found at {}", path.display())]
    BatchResultsMissing { path: PathBuf },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordError {
    pub(crate) fn from_counter(kind: IdKind, err: CounterError) -> Self {
        match err {
            CounterError::AllocationNotFound(batch_id) => {
                CoordError::AllocationNotFound { kind, batch_id }
            }
            source => CoordError::Allocation { kind, source },
        }
    }
}
