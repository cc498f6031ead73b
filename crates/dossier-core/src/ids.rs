use crate::error::StoreError;
use regex::Regex;
use std::sync::OnceLock;

pub const SOURCE_PREFIX: char = 'S';
pub const LEAD_PREFIX: char = 'L';
pub const LEDGER_PREFIX: char = 'L';

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([A-Z])(\d+)$").expect("valid regex"))
}

pub fn format_id(prefix: char, number: u64) -> String {
    format!("{prefix}{number:03}")
}

pub fn format_source_id(number: u64) -> String {
    format_id(SOURCE_PREFIX, number)
}

pub fn format_lead_id(number: u64) -> String {
    format_id(LEAD_PREFIX, number)
}

pub fn format_ledger_id(number: u64) -> String {
    format_id(LEDGER_PREFIX, number)
}

fn parse_prefixed(id: &str, prefix: char, kind: &'static str) -> Result<u64, StoreError> {
    let invalid = || StoreError::InvalidId {
        kind,
        value: id.to_string(),
    };
    let captures = id_pattern().captures(id.trim()).ok_or_else(invalid)?;
    if !captures[1].starts_with(prefix) {
        return Err(invalid());
    }
    captures[2].parse::<u64>().map_err(|_| invalid())
}

pub fn parse_source_id(id: &str) -> Result<u64, StoreError> {
    parse_prefixed(id, SOURCE_PREFIX, "source")
}

pub fn parse_lead_id(id: &str) -> Result<u64, StoreError> {
    parse_prefixed(id, LEAD_PREFIX, "lead")
}

pub fn parse_ledger_id(id: &str) -> Result<u64, StoreError> {
    parse_prefixed(id, LEDGER_PREFIX, "ledger")
}

pub fn is_source_id(id: &str) -> bool {
    parse_source_id(id).is_ok()
}
