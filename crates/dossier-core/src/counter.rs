use crate::error::CounterError;
use crate::ids;
use crate::state::{Allocation, AllocationStatus, CaseState};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Source,
    Lead,
}

impl Default for IdKind {
    fn default() -> Self {
        Self::Source
    }
}

impl IdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdKind::Source => "source",
            IdKind::Lead => "lead",
        }
    }

    pub fn format_id(&self, number: u64) -> String {
        match self {
            IdKind::Source => ids::format_source_id(number),
            IdKind::Lead => ids::format_lead_id(number),
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "source" | "sources" => Ok(IdKind::Source),
            "lead" | "leads" => Ok(IdKind::Lead),
            other => Err(format!("Unknown id kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AllocationPartition {
    pub active: Vec<Allocation>,
    pub stale: Vec<Allocation>,
}

impl AllocationPartition {
    fn from_map(
        allocations: &BTreeMap<String, Allocation>,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut partition = Self::default();
        for allocation in allocations.values() {
            if allocation.is_stale(threshold, now) {
                partition.stale.push(allocation.clone());
            } else {
                partition.active.push(allocation.clone());
            }
        }
        partition
    }
}

/// Mutable view over one monotonic ID counter and its live allocations.
///
/// `next` is the committed counter persisted as `next_source`/`next_lead`.
/// `high_water` remembers the end of every range ever reserved so released,
/// purged and partially used ranges are never handed out again.
pub struct IdSpace<'a> {
    kind: IdKind,
    next: &'a mut u64,
    high_water: &'a mut u64,
    allocations: &'a mut BTreeMap<String, Allocation>,
}

impl CaseState {
    pub fn id_space(&mut self, kind: IdKind) -> IdSpace<'_> {
        let (next, high_water, allocations) = match kind {
            IdKind::Source => (
                &mut self.next_source,
                &mut self.source_high_water,
                &mut self.source_allocations,
            ),
            IdKind::Lead => (
                &mut self.next_lead,
                &mut self.lead_high_water,
                &mut self.lead_allocations,
            ),
        };
        IdSpace {
            kind,
            next,
            high_water,
            allocations,
        }
    }

    pub fn next_id(&self, kind: IdKind) -> u64 {
        match kind {
            IdKind::Source => self.next_source,
            IdKind::Lead => self.next_lead,
        }
    }

    pub fn allocations(&self, kind: IdKind) -> &BTreeMap<String, Allocation> {
        match kind {
            IdKind::Source => &self.source_allocations,
            IdKind::Lead => &self.lead_allocations,
        }
    }

    pub fn allocation_partition(
        &self,
        kind: IdKind,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> AllocationPartition {
        AllocationPartition::from_map(self.allocations(kind), threshold, now)
    }
}

impl IdSpace<'_> {
    pub fn kind(&self) -> IdKind {
        self.kind
    }

    pub fn next(&self) -> u64 {
        *self.next
    }

    /// First ID past the committed counter, every live reservation and every
    /// range reserved before.
    pub fn highest_allocated(&self) -> u64 {
        self.allocations
            .values()
            .filter(|allocation| allocation.status == AllocationStatus::Active)
            .map(|allocation| allocation.end)
            .fold((*self.next).max(*self.high_water), u64::max)
    }

    pub fn get(&self, batch_id: &str) -> Option<&Allocation> {
        self.allocations.get(batch_id)
    }

    pub fn reserve(
        &mut self,
        batch_id: impl Into<String>,
        count: u64,
        now: DateTime<Utc>,
    ) -> Result<Allocation, CounterError> {
        let batch_id = batch_id.into();
        if count == 0 {
            return Err(CounterError::InvalidCount);
        }
        if self.allocations.contains_key(&batch_id) {
            return Err(CounterError::BatchExists(batch_id));
        }

        let start = self.highest_allocated();
        let end = checked_end(start, count)?;
        let allocation = Allocation {
            batch_id: batch_id.clone(),
            start,
            end,
            count,
            allocated_at: now,
            status: AllocationStatus::Active,
            used_count: None,
        };
        *self.high_water = (*self.high_water).max(allocation.end);
        self.allocations.insert(batch_id, allocation.clone());
        Ok(allocation)
    }

    /// Settles a reservation. Only `[start, start + used_count)` counts as
    /// consumed; the tail of the range is skipped for good.
    pub fn commit(&mut self, batch_id: &str, used_count: u64) -> Result<Allocation, CounterError> {
        let allocation = self
            .allocations
            .get(batch_id)
            .ok_or_else(|| CounterError::AllocationNotFound(batch_id.to_string()))?;
        if used_count > allocation.count {
            return Err(CounterError::UsedCountExceeds {
                batch_id: batch_id.to_string(),
                used_count,
                count: allocation.count,
            });
        }

        let end = checked_end(allocation.start, used_count)?;

        let mut allocation = self
            .allocations
            .remove(batch_id)
            .ok_or_else(|| CounterError::AllocationNotFound(batch_id.to_string()))?;
        self.advance_to(end);
        allocation.status = AllocationStatus::Committed;
        allocation.used_count = Some(used_count);
        Ok(allocation)
    }

    pub fn release(&mut self, batch_id: &str) -> Result<Allocation, CounterError> {
        let mut allocation = self
            .allocations
            .remove(batch_id)
            .ok_or_else(|| CounterError::AllocationNotFound(batch_id.to_string()))?;
        allocation.status = AllocationStatus::Released;
        Ok(allocation)
    }

    /// Drops the allocation for `batch_id` without touching the counter.
    pub fn forget(&mut self, batch_id: &str) -> Option<Allocation> {
        self.allocations.remove(batch_id)
    }

    pub fn purge_stale(&mut self, threshold: Duration, now: DateTime<Utc>) -> Vec<Allocation> {
        let stale_ids: Vec<String> = self
            .allocations
            .values()
            .filter(|allocation| allocation.is_stale(threshold, now))
            .map(|allocation| allocation.batch_id.clone())
            .collect();
        stale_ids
            .iter()
            .filter_map(|batch_id| self.allocations.remove(batch_id))
            .collect()
    }

    pub fn partition(&self, threshold: Duration, now: DateTime<Utc>) -> AllocationPartition {
        AllocationPartition::from_map(self.allocations, threshold, now)
    }

    /// Moves the counter forward to `next`; lower values are ignored.
    pub fn advance_to(&mut self, next: u64) -> bool {
        if next > *self.next {
            *self.next = next;
            true
        } else {
            false
        }
    }
}

/// `start + count`, or [`CounterError::Overflow`] past `u64::MAX`.
pub fn checked_end(start: u64, count: u64) -> Result<u64, CounterError> {
    start
        .checked_add(count)
        .ok_or(CounterError::Overflow { start, count })
}
