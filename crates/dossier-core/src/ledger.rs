use crate::ids;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    IterationStart,
    IterationEnd,
    PhaseStart,
    PhaseEnd,
    AgentDispatch,
    AgentComplete,
    TaskCreate,
    TaskComplete,
    TaskFail,
    SourceCapture,
    ClaimRegister,
    ClaimVerify,
    GateCheck,
    FileLock,
    FileUnlock,
}

impl LedgerEntryType {
    pub const ALL: [LedgerEntryType; 15] = [
        LedgerEntryType::IterationStart,
        LedgerEntryType::IterationEnd,
        LedgerEntryType::PhaseStart,
        LedgerEntryType::PhaseEnd,
        LedgerEntryType::AgentDispatch,
        LedgerEntryType::AgentComplete,
        LedgerEntryType::TaskCreate,
        LedgerEntryType::TaskComplete,
        LedgerEntryType::TaskFail,
        LedgerEntryType::SourceCapture,
        LedgerEntryType::ClaimRegister,
        LedgerEntryType::ClaimVerify,
        LedgerEntryType::GateCheck,
        LedgerEntryType::FileLock,
        LedgerEntryType::FileUnlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::IterationStart => "iteration_start",
            LedgerEntryType::IterationEnd => "iteration_end",
            LedgerEntryType::PhaseStart => "phase_start",
            LedgerEntryType::PhaseEnd => "phase_end",
            LedgerEntryType::AgentDispatch => "agent_dispatch",
            LedgerEntryType::AgentComplete => "agent_complete",
            LedgerEntryType::TaskCreate => "task_create",
            LedgerEntryType::TaskComplete => "task_complete",
            LedgerEntryType::TaskFail => "task_fail",
            LedgerEntryType::SourceCapture => "source_capture",
            LedgerEntryType::ClaimRegister => "claim_register",
            LedgerEntryType::ClaimVerify => "claim_verify",
            LedgerEntryType::GateCheck => "gate_check",
            LedgerEntryType::FileLock => "file_lock",
            LedgerEntryType::FileUnlock => "file_unlock",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            LedgerEntryType::IterationStart | LedgerEntryType::IterationEnd => &["iteration"],
            LedgerEntryType::PhaseStart | LedgerEntryType::PhaseEnd => &["phase"],
            LedgerEntryType::AgentDispatch | LedgerEntryType::AgentComplete => &["agent", "task"],
            LedgerEntryType::TaskCreate | LedgerEntryType::TaskComplete => &["task_id"],
            LedgerEntryType::TaskFail => &["task_id", "reason"],
            LedgerEntryType::SourceCapture => &["source_id", "evidence_path"],
            LedgerEntryType::ClaimRegister => &["claim_id"],
            LedgerEntryType::ClaimVerify => &["claim_id", "verdict"],
            LedgerEntryType::GateCheck => &["gate", "passed"],
            LedgerEntryType::FileLock | LedgerEntryType::FileUnlock => &["file"],
        }
    }
}

impl fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        LedgerEntryType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown ledger entry type: {input}"))
    }
}

/// Keys every entry carries itself; caller fields may not use them.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "type", "ts"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: LedgerEntryType,
    pub ts: DateTime<Utc>,
    #[serde(default, flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerFile {
    pub case_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
}

impl LedgerFile {
    pub fn new(case_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            case_id: case_id.into(),
            created_at: now,
            last_updated: now,
            entries: Vec::new(),
        }
    }

    pub fn next_id(&self) -> String {
        ids::format_ledger_id(self.entries.len() as u64 + 1)
    }

    pub fn push(
        &mut self,
        kind: LedgerEntryType,
        fields: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> &LedgerEntry {
        let entry = LedgerEntry {
            id: self.next_id(),
            kind,
            ts: now,
            fields,
        };
        self.entries.push(entry);
        self.last_updated = now;
        &self.entries[self.entries.len() - 1]
    }
}
