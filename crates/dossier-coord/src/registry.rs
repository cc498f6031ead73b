//! Source registration, capture confirmation and lead status changes.

use crate::case::Case;
use crate::error::CoordError;
use crate::signature;
use dossier_core::counter::checked_end;
use dossier_core::evidence::METADATA_FILE;
use dossier_core::{ids, store, IdKind, Lead, LeadStatus, LeadsFile, SourceRecord};
use tracing::{info, warn};

/// Adds a source that has not been captured yet.
///
/// `next_source` is pushed past the registered number so the allocator
/// never hands the same ID out again.
pub fn register_source(case: &Case, mut record: SourceRecord) -> Result<SourceRecord, CoordError> {
    let number = ids::parse_source_id(&record.id)?;
    let next = checked_end(number, 1)
        .map_err(|err| CoordError::from_counter(IdKind::Source, err))?;
    record.captured = false;
    record.evidence = None;

    let paths = case.paths();
    let _guards = case.locks().acquire_all(&[&paths.state, &paths.sources])?;
    let mut catalog = store::load_sources(paths)?;
    if catalog.contains(&record.id) {
        return Err(CoordError::DuplicateSource(record.id));
    }
    catalog.sources.push(record.clone());
    store::save_sources(paths, &catalog)?;

    let mut state = store::load_state(paths)?;
    if state.id_space(IdKind::Source).advance_to(next) {
        store::save_state(paths, &state)?;
    }

    info!(event = "source_registered", source_id = %record.id, url = %record.url);
    Ok(record)
}

/// Flips `captured` once the evidence directory verifies, re-hashing the
/// captured files. A failed check leaves the record as it was.
pub fn mark_captured(case: &Case, source_id: &str) -> Result<SourceRecord, CoordError> {
    let paths = case.paths();
    let evidence_dir = paths.evidence_for(source_id);
    let verdict = signature::verify_evidence_dir(&evidence_dir);
    if !verdict.valid {
        warn!(
            event = "capture_rejected",
            source_id,
            reason = %verdict.reason
        );
        return Err(CoordError::SignatureInvalid {
            source_id: source_id.to_string(),
            reason: verdict.reason,
        });
    }

    let _guard = case.locks().acquire(&paths.sources)?;
    let mut catalog = store::load_sources(paths)?;
    let Some(record) = catalog.get_mut(source_id) else {
        return Err(CoordError::SourceNotFound(source_id.to_string()));
    };
    record.captured = true;
    record.evidence = Some(paths.relative(&evidence_dir.join(METADATA_FILE)));
    let updated = record.clone();
    store::save_sources(paths, &catalog)?;

    info!(event = "source_captured", source_id);
    Ok(updated)
}

/// Moves a lead out of `pending` and attaches the sources that settled it.
pub fn set_lead_status(
    case: &Case,
    lead_id: &str,
    status: LeadStatus,
    sources: &[String],
) -> Result<Lead, CoordError> {
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.leads)?;
    let mut leads = store::load_leads(paths)?;
    let lead = apply_lead_update(&mut leads, lead_id, status, sources)?;
    store::save_leads(paths, &leads)?;

    info!(event = "lead_status", lead_id, status = %status);
    Ok(lead)
}

/// Applies a status change in memory. Repeating the status a lead already
/// has only merges its sources.
pub(crate) fn apply_lead_update(
    leads: &mut LeadsFile,
    lead_id: &str,
    status: LeadStatus,
    sources: &[String],
) -> Result<Lead, CoordError> {
    let Some(lead) = leads.get_mut(lead_id) else {
        return Err(CoordError::LeadNotFound(lead_id.to_string()));
    };
    if lead.status != status && !lead.status.can_transition_to(status) {
        return Err(CoordError::InvalidLeadTransition {
            id: lead_id.to_string(),
            from: lead.status,
            to: status,
        });
    }
    lead.status = status;
    for source in sources {
        if !lead.sources.contains(source) {
            lead.sources.push(source.clone());
        }
    }
    Ok(lead.clone())
}
