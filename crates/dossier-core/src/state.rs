use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const FIRST_ID: u64 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Plan,
    Bootstrap,
    Question,
    Follow,
    Write,
    Verify,
    Complete,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Plan
    }
}

impl Phase {
    pub const ORDER: [Phase; 7] = [
        Phase::Plan,
        Phase::Bootstrap,
        Phase::Question,
        Phase::Follow,
        Phase::Write,
        Phase::Verify,
        Phase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "PLAN",
            Phase::Bootstrap => "BOOTSTRAP",
            Phase::Question => "QUESTION",
            Phase::Follow => "FOLLOW",
            Phase::Write => "WRITE",
            Phase::Verify => "VERIFY",
            Phase::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase();
        Phase::ORDER
            .iter()
            .copied()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| format!("Unknown phase: {input}"))
    }
}

/// The eight gates a case must pass before it is complete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    Planning,
    Questions,
    Curiosity,
    Reconciliation,
    Article,
    Sources,
    Integrity,
    Legal,
}

impl GateName {
    pub const ALL: [GateName; 8] = [
        GateName::Planning,
        GateName::Questions,
        GateName::Curiosity,
        GateName::Reconciliation,
        GateName::Article,
        GateName::Sources,
        GateName::Integrity,
        GateName::Legal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateName::Planning => "planning",
            GateName::Questions => "questions",
            GateName::Curiosity => "curiosity",
            GateName::Reconciliation => "reconciliation",
            GateName::Article => "article",
            GateName::Sources => "sources",
            GateName::Integrity => "integrity",
            GateName::Legal => "legal",
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateName {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        GateName::ALL
            .iter()
            .copied()
            .find(|gate| gate.as_str() == normalized)
            .ok_or_else(|| format!("Unknown gate: {input}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Active,
    Committed,
    Released,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Active => "active",
            AllocationStatus::Committed => "committed",
            AllocationStatus::Released => "released",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open range `[start, end)` of IDs reserved for one batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub batch_id: String,
    pub start: u64,
    pub end: u64,
    pub count: u64,
    pub allocated_at: DateTime<Utc>,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_count: Option<u64>,
}

impl Allocation {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.allocated_at
    }

    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > threshold
    }

    pub fn overlaps(&self, other: &Allocation) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Contents of `state.json`.
///
/// The ID counters and their allocation maps are private: they only move
/// through [`crate::IdSpace`], which keeps them monotonic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseState {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default = "first_id")]
    pub(crate) next_source: u64,
    #[serde(default = "first_id")]
    pub(crate) next_lead: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) source_high_water: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) lead_high_water: u64,
    #[serde(default)]
    pub gates: BTreeMap<String, bool>,
    #[serde(default)]
    pub(crate) source_allocations: BTreeMap<String, Allocation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) lead_allocations: BTreeMap<String, Allocation>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn first_id() -> u64 {
    FIRST_ID
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Default for CaseState {
    fn default() -> Self {
        let gates = GateName::ALL
            .iter()
            .map(|gate| (gate.as_str().to_string(), false))
            .collect();
        Self {
            phase: Phase::default(),
            iteration: 0,
            next_source: FIRST_ID,
            next_lead: FIRST_ID,
            source_high_water: 0,
            lead_high_water: 0,
            gates,
            source_allocations: BTreeMap::new(),
            lead_allocations: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl CaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_source(&self) -> u64 {
        self.next_source
    }

    pub fn next_lead(&self) -> u64 {
        self.next_lead
    }

    pub fn gate(&self, gate: GateName) -> bool {
        self.gates.get(gate.as_str()).copied().unwrap_or(false)
    }

    pub fn set_gate(&mut self, gate: GateName, value: bool) -> bool {
        let previous = self.gates.insert(gate.as_str().to_string(), value);
        previous != Some(value)
    }
}
