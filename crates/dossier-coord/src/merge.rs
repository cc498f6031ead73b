//! Folds per-worker batch results into the canonical case files.
//!
//! Each artifact kind is merged on its own: leads by `(text, parent)`,
//! sources by ID, findings by batch heading. A failure partway through can
//! leave earlier kinds merged; running the merge again only adds what is
//! still missing.

use crate::case::Case;
use crate::error::CoordError;
use crate::registry::apply_lead_update;
use crate::signature;
use dossier_core::counter::checked_end;
use dossier_core::{
    ids, store, CasePaths, IdKind, Lead, LeadStatus, LeadsFile, Priority, SourceCatalog,
    SourceRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MERGED_SUFFIX: &str = "merged";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchResults {
    #[serde(default)]
    pub leads: Vec<ProposedLead>,
    #[serde(default)]
    pub sources: Vec<SourceRecord>,
    #[serde(default)]
    pub lead_updates: Vec<LeadUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
}

/// A lead as a worker proposes it, before it has an ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedLead {
    pub lead: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadUpdate {
    pub id: String,
    pub status: LeadStatus,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch_id: String,
    pub results: BatchResults,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MergeReport {
    pub batches: Vec<String>,
    pub leads_added: Vec<String>,
    pub leads_skipped: usize,
    pub leads_depth_rejected: usize,
    pub lead_updates_applied: usize,
    pub lead_updates_skipped: usize,
    pub sources_added: Vec<String>,
    pub sources_skipped: usize,
    pub sources_invalid: usize,
    pub sources_uncaptured: usize,
    pub findings_appended: usize,
    pub findings_skipped: usize,
    pub allocations_cleared: usize,
    pub next_source: u64,
    pub next_lead: u64,
}

pub fn load_batch_results(path: &Path) -> Result<BatchResults, CoordError> {
    store::read_json::<BatchResults>(path)?.ok_or_else(|| CoordError::BatchResultsMissing {
        path: path.to_path_buf(),
    })
}

/// Merges one results file written by `batch_id`.
pub fn merge_batch_file(
    case: &Case,
    batch_id: &str,
    path: &Path,
) -> Result<MergeReport, CoordError> {
    let results = load_batch_results(path)?;
    merge_batches(
        case,
        &[Batch {
            batch_id: batch_id.to_string(),
            results,
        }],
    )
}

/// Merges `batches` in order while holding the state, leads and sources
/// locks.
pub fn merge_batches(case: &Case, batches: &[Batch]) -> Result<MergeReport, CoordError> {
    let paths = case.paths();
    let _guards = case
        .locks()
        .acquire_all(&[&paths.state, &paths.leads, &paths.sources])?;

    let mut state = store::load_state(paths)?;
    let mut report = MergeReport {
        batches: batches.iter().map(|batch| batch.batch_id.clone()).collect(),
        ..MergeReport::default()
    };

    let mut leads = store::load_leads(paths)?;
    let after_existing = match leads.highest_number() {
        Some(highest) => lead_end(highest, 1)?,
        None => 0,
    };
    let first_lead = state
        .id_space(IdKind::Lead)
        .highest_allocated()
        .max(after_existing);
    let leads_changed = merge_leads(&mut leads, batches, first_lead, &mut report)?;
    if leads_changed {
        store::save_leads(paths, &leads)?;
    }

    let mut catalog = store::load_sources(paths)?;
    let highest_source = merge_sources(paths, &mut catalog, batches, &mut report);
    if !report.sources_added.is_empty() {
        store::save_sources(paths, &catalog)?;
    }

    merge_findings(&paths.findings, batches, &mut report)?;

    let mut state_changed = false;
    if let Some(highest) = highest_source {
        let next = checked_end(highest, 1)
            .map_err(|err| CoordError::from_counter(IdKind::Source, err))?;
        state_changed |= state.id_space(IdKind::Source).advance_to(next);
    }
    let highest_lead = report
        .leads_added
        .iter()
        .filter_map(|id| ids::parse_lead_id(id).ok())
        .max();
    if let Some(highest) = highest_lead {
        state_changed |= state.id_space(IdKind::Lead).advance_to(lead_end(highest, 1)?);
    }
    for batch in batches {
        for kind in [IdKind::Source, IdKind::Lead] {
            if state.id_space(kind).forget(&batch.batch_id).is_some() {
                report.allocations_cleared += 1;
                state_changed = true;
            }
        }
    }
    if state_changed {
        store::save_state(paths, &state)?;
    }
    report.next_source = state.next_id(IdKind::Source);
    report.next_lead = state.next_id(IdKind::Lead);

    info!(
        event = "batches_merged",
        batches = report.batches.len(),
        leads_added = report.leads_added.len(),
        sources_added = report.sources_added.len(),
        next_source = report.next_source
    );
    Ok(report)
}

fn lead_end(start: u64, count: u64) -> Result<u64, CoordError> {
    checked_end(start, count).map_err(|err| CoordError::from_counter(IdKind::Lead, err))
}

fn merge_leads(
    leads: &mut LeadsFile,
    batches: &[Batch],
    first_id: u64,
    report: &mut MergeReport,
) -> Result<bool, CoordError> {
    let mut next_id = first_id;
    let mut changed = false;

    for batch in batches {
        for proposed in &batch.results.leads {
            let text = proposed.lead.trim();
            let parent = proposed
                .parent
                .as_deref()
                .map(str::trim)
                .filter(|parent| !parent.is_empty());
            if text.is_empty() || leads.find_by_key(text, parent).is_some() {
                debug!(
                    event = "merge_lead_skipped",
                    batch_id = %batch.batch_id,
                    lead = text
                );
                report.leads_skipped += 1;
                continue;
            }

            let depth = proposed.depth.unwrap_or_else(|| match parent {
                Some(parent) => leads.get(parent).map_or(1, |lead| lead.depth + 1),
                None => 0,
            });
            if depth > leads.max_depth {
                warn!(
                    event = "merge_lead_too_deep",
                    batch_id = %batch.batch_id,
                    depth,
                    max_depth = leads.max_depth
                );
                report.leads_depth_rejected += 1;
                continue;
            }

            let id = IdKind::Lead.format_id(next_id);
            next_id = lead_end(next_id, 1)?;
            leads.leads.push(Lead {
                id: id.clone(),
                lead: text.to_string(),
                parent: parent.map(str::to_string),
                depth,
                priority: proposed.priority.unwrap_or_default(),
                status: LeadStatus::Pending,
                sources: proposed.sources.clone(),
                extra: BTreeMap::new(),
            });
            report.leads_added.push(id);
            changed = true;
        }

        for update in &batch.results.lead_updates {
            match apply_lead_update(leads, &update.id, update.status, &update.sources) {
                Ok(_) => {
                    report.lead_updates_applied += 1;
                    changed = true;
                }
                Err(err) => {
                    warn!(
                        event = "merge_lead_update_skipped",
                        batch_id = %batch.batch_id,
                        lead_id = %update.id,
                        error = %err
                    );
                    report.lead_updates_skipped += 1;
                }
            }
        }
    }
    Ok(changed)
}

/// Returns the highest source number appended.
///
/// A record claiming `captured` keeps the flag only when its evidence
/// directory verifies; otherwise it is stored as not yet captured.
fn merge_sources(
    paths: &CasePaths,
    catalog: &mut SourceCatalog,
    batches: &[Batch],
    report: &mut MergeReport,
) -> Option<u64> {
    let mut highest = None;
    for batch in batches {
        for record in &batch.results.sources {
            let number = match ids::parse_source_id(&record.id) {
                Ok(number) if number < u64::MAX => number,
                Ok(_) => {
                    warn!(
                        event = "merge_source_invalid",
                        batch_id = %batch.batch_id,
                        source_id = %record.id,
                        error = "source number out of range"
                    );
                    report.sources_invalid += 1;
                    continue;
                }
                Err(err) => {
                    warn!(
                        event = "merge_source_invalid",
                        batch_id = %batch.batch_id,
                        error = %err
                    );
                    report.sources_invalid += 1;
                    continue;
                }
            };
            if catalog.contains(&record.id) {
                debug!(
                    event = "merge_source_skipped",
                    batch_id = %batch.batch_id,
                    source_id = %record.id
                );
                report.sources_skipped += 1;
                continue;
            }
            let mut record = record.clone();
            if record.captured {
                let evidence_dir = paths.evidence_for(&record.id);
                let verdict = signature::verify_evidence_dir(&evidence_dir);
                if verdict.valid {
                    let metadata = paths.evidence_metadata_for(&record.id);
                    record.evidence = Some(paths.relative(&metadata));
                } else {
                    warn!(
                        event = "merge_capture_unverified",
                        batch_id = %batch.batch_id,
                        source_id = %record.id,
                        reason = %verdict.reason
                    );
                    record.captured = false;
                    record.evidence = None;
                    report.sources_uncaptured += 1;
                }
            }
            report.sources_added.push(record.id.clone());
            catalog.sources.push(record);
            highest = highest.max(Some(number));
        }
    }
    highest
}

fn findings_heading(batch_id: &str) -> String {
    format!("## Batch {batch_id}\n")
}

/// Whether a section for the batch was already appended. Every section opens
/// with a newline, so its heading sits at the start of the file or right
/// after an empty line; a heading quoted inside findings text does not.
fn has_findings_section(existing: &str, heading: &str) -> bool {
    let opening = format!("\n{heading}");
    existing.starts_with(&opening) || existing.contains(&format!("\n{opening}"))
}

fn merge_findings(
    findings_path: &Path,
    batches: &[Batch],
    report: &mut MergeReport,
) -> Result<(), CoordError> {
    let mut existing = match fs::read_to_string(findings_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(CoordError::Io {
                path: findings_path.to_path_buf(),
                source,
            })
        }
    };

    for batch in batches {
        let Some(text) = batch
            .results
            .findings
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        else {
            continue;
        };
        let heading = findings_heading(&batch.batch_id);
        if has_findings_section(&existing, &heading) {
            report.findings_skipped += 1;
            continue;
        }
        let section = format!("\n{heading}\n{text}\n");
        store::append_text_atomic(findings_path, &section)?;
        existing.push_str(&section);
        report.findings_appended += 1;
    }
    Ok(())
}

/// Result files in `batches/` that have not been merged yet, by name.
pub fn pending_batch_files(case: &Case) -> Result<Vec<PathBuf>, CoordError> {
    let dir = &case.paths().batches_dir;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CoordError::Io {
                path: dir.clone(),
                source,
            })
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Merges every pending file in `batches/` and renames each to
/// `<name>.merged`. Nothing is merged if any file fails to parse.
pub fn merge_pending(case: &Case) -> Result<MergeReport, CoordError> {
    let files = pending_batch_files(case)?;
    let mut batches = Vec::with_capacity(files.len());
    for path in &files {
        let batch_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        batches.push(Batch {
            batch_id,
            results: load_batch_results(path)?,
        });
    }
    if batches.is_empty() {
        let state = store::load_state(case.paths())?;
        return Ok(MergeReport {
            next_source: state.next_id(IdKind::Source),
            next_lead: state.next_id(IdKind::Lead),
            ..MergeReport::default()
        });
    }

    let report = merge_batches(case, &batches)?;
    for path in &files {
        let mut merged = path.clone().into_os_string();
        merged.push(".");
        merged.push(MERGED_SUFFIX);
        fs::rename(path, &merged).map_err(|source| CoordError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator;
    use crate::test_support::{capture, new_case, ts};
    use serde_json::json;

    fn batch(batch_id: &str, value: serde_json::Value) -> Batch {
        Batch {
            batch_id: batch_id.to_string(),
            results: serde_json::from_value(value).expect("results"),
        }
    }

    #[test]
    fn identical_leads_from_two_batches_merge_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let a = batch(
            "a",
            json!({"leads": [{"lead": "Trace the shell company", "priority": "HIGH"}]}),
        );
        let b = batch(
            "b",
            json!({"leads": [
                {"lead": "Trace the shell company ", "parent": ""},
                {"lead": "Trace the shell company", "parent": "L001"}
            ]}),
        );
        let report = merge_batches(&case, &[a, b]).expect("merge");
        assert_eq!(report.leads_added, vec!["L001".to_string(), "L002".to_string()]);
        assert_eq!(report.leads_skipped, 1);

        let leads = store::load_leads(case.paths()).expect("leads");
        assert_eq!(leads.leads.len(), 2);
        assert_eq!(leads.leads[0].priority, Priority::High);
        assert_eq!(leads.leads[1].depth, 1);
        assert_eq!(report.next_lead, 3);
    }

    #[test]
    fn sources_merge_by_id_and_advance_the_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let a = batch(
            "a",
            json!({"sources": [
                {"id": "S001", "url": "https://a.example/1", "title": "One"},
                {"id": "S002", "url": "https://a.example/2"}
            ]}),
        );
        let b = batch(
            "b",
            json!({"sources": [
                {"id": "S002", "url": "https://b.example/dupe"},
                {"id": "S007", "url": "https://b.example/7"},
                {"id": "x-9", "url": "https://b.example/bad"}
            ]}),
        );
        let report = merge_batches(&case, &[a, b]).expect("merge");
        assert_eq!(report.sources_added.len(), 3);
        assert_eq!(report.sources_skipped, 1);
        assert_eq!(report.sources_invalid, 1);
        assert_eq!(report.next_source, 8);

        let catalog = store::load_sources(case.paths()).expect("sources");
        assert_eq!(catalog.get("S002").expect("S002").url, "https://a.example/2");
    }

    #[test]
    fn merge_clears_allocations_of_merged_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        allocator::allocate(&case, IdKind::Source, 5, Some("a"), ts(0)).expect("a");
        allocator::allocate(&case, IdKind::Source, 5, Some("b"), ts(0)).expect("b");
        let report = merge_batches(
            &case,
            &[batch("a", json!({"sources": [{"id": "S002", "url": "https://a.example"}]}))],
        )
        .expect("merge");
        assert_eq!(report.allocations_cleared, 1);
        assert_eq!(report.next_source, 3);

        let state = store::load_state(case.paths()).expect("state");
        assert!(state.allocations(IdKind::Source).contains_key("b"));
        assert!(!state.allocations(IdKind::Source).contains_key("a"));
    }

    #[test]
    fn merge_never_lowers_next_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        allocator::allocate(&case, IdKind::Source, 10, Some("a"), ts(0)).expect("a");
        allocator::commit(&case, IdKind::Source, "a", 9).expect("commit");
        let report = merge_batches(
            &case,
            &[batch("b", json!({"sources": [{"id": "S003", "url": "https://b.example"}]}))],
        )
        .expect("merge");
        assert_eq!(report.next_source, 10);
    }

    #[test]
    fn leads_past_max_depth_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let report = merge_batches(
            &case,
            &[batch(
                "a",
                json!({"leads": [
                    {"lead": "root question"},
                    {"lead": "far too deep", "depth": 4},
                    {"lead": "child", "parent": "L001"}
                ]}),
            )],
        )
        .expect("merge");
        assert_eq!(report.leads_added.len(), 2);
        assert_eq!(report.leads_depth_rejected, 1);
    }

    #[test]
    fn lead_updates_follow_the_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        merge_batches(&case, &[batch("a", json!({"leads": [{"lead": "check permits"}]}))])
            .expect("seed");
        let report = merge_batches(
            &case,
            &[batch(
                "b",
                json!({"lead_updates": [
                    {"id": "L001", "status": "investigated", "sources": ["S004"]},
                    {"id": "L001", "status": "dead_end"},
                    {"id": "L099", "status": "dead_end"}
                ]}),
            )],
        )
        .expect("updates");
        assert_eq!(report.lead_updates_applied, 1);
        assert_eq!(report.lead_updates_skipped, 2);
        let leads = store::load_leads(case.paths()).expect("leads");
        assert_eq!(leads.leads[0].status, LeadStatus::Investigated);
        assert_eq!(leads.leads[0].sources, vec!["S004".to_string()]);
    }

    #[test]
    fn re_merging_the_same_batch_adds_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let results = batch(
            "a",
            json!({
                "leads": [{"lead": "who signed the lease"}],
                "sources": [{"id": "S001", "url": "https://lease.example"}],
                "findings": "Lease signed by a holding company."
            }),
        );
        merge_batches(&case, std::slice::from_ref(&results)).expect("first");
        let again = merge_batches(&case, &[results]).expect("second");
        assert!(again.leads_added.is_empty());
        assert!(again.sources_added.is_empty());
        assert_eq!(again.findings_skipped, 1);

        let findings = fs::read_to_string(&case.paths().findings).expect("findings");
        assert_eq!(findings.matches("## Batch a").count(), 1);
        assert!(findings.contains("Lease signed by a holding company."));
    }

    #[test]
    fn merge_pending_renames_merged_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        fs::create_dir_all(&case.paths().batches_dir).expect("batches");
        fs::write(
            case.paths().batch_results_for("b1"),
            json!({"sources": [{"id": "S001", "url": "https://one.example"}]}).to_string(),
        )
        .expect("b1");
        fs::write(
            case.paths().batch_results_for("b2"),
            json!({"findings": "Nothing new."}).to_string(),
        )
        .expect("b2");

        let report = merge_pending(&case).expect("merge");
        assert_eq!(report.batches, vec!["b1".to_string(), "b2".to_string()]);
        assert!(case.paths().batches_dir.join("b1.json.merged").exists());
        assert!(!case.paths().batch_results_for("b1").exists());
        assert!(pending_batch_files(&case).expect("pending").is_empty());
    }

    #[test]
    fn missing_results_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let missing = case.paths().batch_results_for("ghost");
        assert!(matches!(
            merge_batch_file(&case, "ghost", &missing),
            Err(CoordError::BatchResultsMissing { .. })
        ));
    }

    #[test]
    fn captured_flag_from_a_batch_needs_verified_evidence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        capture(&case, "S002", "https://registry.example/2");
        let report = merge_batches(
            &case,
            &[batch(
                "a",
                json!({"sources": [
                    {"id": "S001", "url": "https://registry.example/1", "captured": true,
                     "evidence": "evidence/S001/metadata.json"},
                    {"id": "S002", "url": "https://registry.example/2", "captured": true}
                ]}),
            )],
        )
        .expect("merge");
        assert_eq!(report.sources_added.len(), 2);
        assert_eq!(report.sources_uncaptured, 1);

        let catalog = store::load_sources(case.paths()).expect("sources");
        let unverified = catalog.get("S001").expect("S001");
        assert!(!unverified.captured);
        assert_eq!(unverified.evidence, None);
        let verified = catalog.get("S002").expect("S002");
        assert!(verified.captured);
        assert_eq!(
            verified.evidence.as_deref(),
            Some("evidence/S002/metadata.json")
        );
    }

    #[test]
    fn quoted_heading_in_earlier_findings_does_not_hide_a_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        merge_batches(
            &case,
            &[batch(
                "a",
                json!({"findings": "Cross-check against\n## Batch b\nonce it lands."}),
            )],
        )
        .expect("a");
        let report = merge_batches(
            &case,
            &[batch("b", json!({"findings": "Lease renewed in 2021."}))],
        )
        .expect("b");
        assert_eq!(report.findings_appended, 1);
        assert_eq!(report.findings_skipped, 0);

        let findings = fs::read_to_string(&case.paths().findings).expect("findings");
        assert!(findings.contains("Lease renewed in 2021."));
    }

    #[test]
    fn source_number_at_the_counter_limit_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let report = merge_batches(
            &case,
            &[batch(
                "a",
                json!({"sources": [{"id": format!("S{}", u64::MAX), "url": "https://x.example"}]}),
            )],
        )
        .expect("merge");
        assert_eq!(report.sources_invalid, 1);
        assert_eq!(report.next_source, 1);
    }
}
