use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} does not exist", path.display())]
    Missing { path: PathBuf },
    #[error("unsupported layout in {}: {reason}", path.display())]
    UnsupportedLayout { path: PathBuf, reason: String },
    #[error("invalid {kind} id: {value}")]
    InvalidId { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("allocation count must be greater than zero")]
    InvalidCount,
    #[error("batch {0} already holds an active allocation")]
    BatchExists(String),
    #[error("allocation not found: {0}")]
    AllocationNotFound(String),
    #[error("batch {batch_id} used {used_count} ids but reserved only {count}")]
    UsedCountExceeds {
        batch_id: String,
        used_count: u64,
        count: u64,
    },
    #[error("id counter overflow: {start} + {count} exceeds u64")]
    Overflow { start: u64, count: u64 },
}
