use crate::case::Case;
use crate::error::CoordError;
use chrono::{DateTime, Utc};
use dossier_core::{store, Allocation, IdKind};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AllocationStatusReport {
    pub kind: IdKind,
    pub next_id: u64,
    pub active: Vec<Allocation>,
    pub stale: Vec<Allocation>,
}

pub fn generate_batch_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("batch-{}", &id[..8])
}

/// Reserves `count` consecutive IDs for one batch.
///
/// Stale reservations are dropped first; their numbers stay burned.
pub fn allocate(
    case: &Case,
    kind: IdKind,
    count: u64,
    batch_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Allocation, CoordError> {
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.state)?;
    let mut state = store::load_state(paths)?;
    let batch_id = batch_id
        .map(str::to_string)
        .unwrap_or_else(generate_batch_id);

    let allocation = {
        let mut space = state.id_space(kind);
        for purged in space.purge_stale(case.config().allocation_stale_after(), now) {
            warn!(
                event = "allocation_stale_purged",
                kind = %kind,
                batch_id = %purged.batch_id,
                start = purged.start,
                end = purged.end
            );
        }
        space
            .reserve(batch_id, count, now)
            .map_err(|err| CoordError::from_counter(kind, err))?
    };
    store::save_state(paths, &state)?;

    info!(
        event = "allocation_reserved",
        kind = %kind,
        batch_id = %allocation.batch_id,
        start = allocation.start,
        end = allocation.end
    );
    Ok(allocation)
}

/// Drops a reservation without consuming any of it.
pub fn release(case: &Case, kind: IdKind, batch_id: &str) -> Result<Allocation, CoordError> {
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.state)?;
    let mut state = store::load_state(paths)?;
    let released = state
        .id_space(kind)
        .release(batch_id)
        .map_err(|err| CoordError::from_counter(kind, err))?;
    store::save_state(paths, &state)?;

    info!(
        event = "allocation_released",
        kind = %kind,
        batch_id,
        start = released.start,
        end = released.end
    );
    Ok(released)
}

/// Settles a reservation after the worker used `used_count` of its IDs.
pub fn commit(
    case: &Case,
    kind: IdKind,
    batch_id: &str,
    used_count: u64,
) -> Result<Allocation, CoordError> {
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.state)?;
    let mut state = store::load_state(paths)?;
    let committed = state
        .id_space(kind)
        .commit(batch_id, used_count)
        .map_err(|err| CoordError::from_counter(kind, err))?;
    store::save_state(paths, &state)?;

    info!(
        event = "allocation_committed",
        kind = %kind,
        batch_id,
        used_count,
        next_id = state.next_id(kind)
    );
    Ok(committed)
}

/// Read-only view of live reservations split by age.
pub fn status(
    case: &Case,
    kind: IdKind,
    now: DateTime<Utc>,
) -> Result<AllocationStatusReport, CoordError> {
    let state = store::load_state(case.paths())?;
    let partition =
        state.allocation_partition(kind, case.config().allocation_stale_after(), now);
    Ok(AllocationStatusReport {
        kind,
        next_id: state.next_id(kind),
        active: partition.active,
        stale: partition.stale,
    })
}

pub fn cleanup_stale(
    case: &Case,
    kind: IdKind,
    now: DateTime<Utc>,
) -> Result<Vec<Allocation>, CoordError> {
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.state)?;
    let mut state = store::load_state(paths)?;
    let purged = state
        .id_space(kind)
        .purge_stale(case.config().allocation_stale_after(), now);
    if !purged.is_empty() {
        store::save_state(paths, &state)?;
        info!(event = "allocation_cleanup", kind = %kind, purged = purged.len());
    }
    Ok(purged)
}
