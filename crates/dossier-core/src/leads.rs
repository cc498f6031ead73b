use crate::ids;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const LEADS_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }

    /// Lower rank is more urgent.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("Unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Investigated,
    DeadEnd,
}

impl Default for LeadStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Pending => "pending",
            LeadStatus::Investigated => "investigated",
            LeadStatus::DeadEnd => "dead_end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LeadStatus::Pending)
    }

    pub fn can_transition_to(&self, next: LeadStatus) -> bool {
        matches!(self, LeadStatus::Pending) && next.is_terminal()
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(LeadStatus::Pending),
            "investigated" => Ok(LeadStatus::Investigated),
            "dead_end" | "dead-end" | "deadend" => Ok(LeadStatus::DeadEnd),
            other => Err(format!("Unknown lead status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    pub lead: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: LeadStatus,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Lead {
    pub fn number(&self) -> Option<u64> {
        ids::parse_lead_id(&self.id).ok()
    }

    /// Natural key used to spot the same lead proposed twice.
    pub fn matches_key(&self, text: &str, parent: Option<&str>) -> bool {
        self.lead.trim() == text.trim() && self.parent.as_deref() == parent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadsFile {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub leads: Vec<Lead>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

fn default_version() -> u32 {
    LEADS_VERSION
}

impl Default for LeadsFile {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            version: LEADS_VERSION,
            leads: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl LeadsFile {
    pub fn get(&self, id: &str) -> Option<&Lead> {
        self.leads.iter().find(|lead| lead.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Lead> {
        self.leads.iter_mut().find(|lead| lead.id == id)
    }

    pub fn find_by_key(&self, text: &str, parent: Option<&str>) -> Option<&Lead> {
        self.leads.iter().find(|lead| lead.matches_key(text, parent))
    }

    pub fn pending(&self) -> impl Iterator<Item = &Lead> {
        self.leads
            .iter()
            .filter(|lead| lead.status == LeadStatus::Pending)
    }

    /// Most urgent pending lead; ties go to the one listed first.
    pub fn next_pending(&self) -> Option<&Lead> {
        self.pending()
            .fold(None, |best: Option<&Lead>, lead| match best {
                Some(current) if current.priority.rank() <= lead.priority.rank() => Some(current),
                _ => Some(lead),
            })
    }

    pub fn highest_number(&self) -> Option<u64> {
        self.leads.iter().filter_map(Lead::number).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(id: &str, priority: Priority, status: LeadStatus) -> Lead {
        Lead {
            id: id.to_string(),
            lead: format!("lead {id}"),
            parent: None,
            depth: 0,
            priority,
            status,
            sources: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn next_pending_prefers_priority_then_input_order() {
        let file = LeadsFile {
            leads: vec![
                lead("L001", Priority::Medium, LeadStatus::Pending),
                lead("L002", Priority::High, LeadStatus::Pending),
                lead("L003", Priority::High, LeadStatus::Pending),
                lead("L004", Priority::High, LeadStatus::Investigated),
            ],
            ..LeadsFile::default()
        };
        assert_eq!(file.next_pending().map(|l| l.id.as_str()), Some("L002"));
    }

    #[test]
    fn no_pending_leads_yields_none() {
        let file = LeadsFile {
            leads: vec![lead("L001", Priority::Low, LeadStatus::DeadEnd)],
            ..LeadsFile::default()
        };
        assert!(file.next_pending().is_none());
    }

    #[test]
    fn only_pending_leads_can_move_and_only_to_terminal_states() {
        assert!(LeadStatus::Pending.can_transition_to(LeadStatus::Investigated));
        assert!(LeadStatus::Pending.can_transition_to(LeadStatus::DeadEnd));
        assert!(!LeadStatus::Pending.can_transition_to(LeadStatus::Pending));
        assert!(!LeadStatus::Investigated.can_transition_to(LeadStatus::DeadEnd));
    }

    #[test]
    fn parses_uppercase_priority_and_defaults() {
        let file: LeadsFile = serde_json::from_str(
            r#"{"leads":[{"id":"L001","lead":"who owns the port?","priority":"HIGH"}]}"#,
        )
        .expect("parse");
        assert_eq!(file.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(file.leads[0].priority, Priority::High);
        assert_eq!(file.leads[0].status, LeadStatus::Pending);
        assert!(file.find_by_key(" who owns the port? ", None).is_some());
        assert!(file.find_by_key("who owns the port?", Some("L000")).is_none());
    }
}
