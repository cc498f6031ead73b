//! Derives the eight gates from case artifacts and picks the next action.

use crate::case::Case;
use crate::error::CoordError;
use crate::ledger;
use crate::signature;
use chrono::{DateTime, Utc};
use dossier_core::{store, GateName, LeadsFile, LedgerEntryType, Phase, Priority};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub type GateMap = BTreeMap<GateName, bool>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    Complete,
    Plan,
    Bootstrap,
    GenerateQuestions,
    FollowLead {
        lead_id: String,
        lead: String,
        priority: Priority,
    },
    Reconcile,
    CuriosityCheck,
    WriteArticle,
    CaptureSources { failing: Vec<String> },
    IntegrityCheck,
    LegalReview,
}

impl NextAction {
    pub fn describe(&self) -> String {
        match self {
            NextAction::Complete => "investigation complete".to_string(),
            NextAction::Plan => "write plan.md".to_string(),
            NextAction::Bootstrap => "register initial sources".to_string(),
            NextAction::GenerateQuestions => "generate questions".to_string(),
            NextAction::FollowLead {
                lead_id,
                lead,
                priority,
            } => format!("follow lead {lead_id} [{}]: {lead}", priority.as_str()),
            NextAction::Reconcile => "run reconciliation audit".to_string(),
            NextAction::CuriosityCheck => "run curiosity check".to_string(),
            NextAction::WriteArticle => "write articles/full.md".to_string(),
            NextAction::CaptureSources { failing } => {
                format!("capture or recapture sources: {}", failing.join(", "))
            }
            NextAction::IntegrityCheck => "run integrity audit".to_string(),
            NextAction::LegalReview => "run legal review".to_string(),
        }
    }
}

/// Gate values plus what went into the `sources` gate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DerivedGates {
    pub gates: GateMap,
    pub source_count: usize,
    pub failing_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Evaluation {
    pub phase: Phase,
    pub gates: GateMap,
    pub next: NextAction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<GateName>,
}

fn non_blank_file(path: &Path) -> bool {
    fs::read_to_string(path).is_ok_and(|content| !content.trim().is_empty())
}

fn has_question_file(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .any(|path| path.extension().is_some_and(|ext| ext == "md") && non_blank_file(&path))
}

fn audit_passed(path: &Path) -> bool {
    match store::read_json::<Value>(path) {
        Ok(Some(verdict)) => verdict.get("passed").and_then(Value::as_bool) == Some(true),
        Ok(None) => false,
        Err(err) => {
            warn!(event = "audit_unreadable", path = %path.display(), error = %err);
            false
        }
    }
}

pub fn derive_gates(case: &Case) -> Result<DerivedGates, CoordError> {
    let paths = case.paths();
    let catalog = store::load_sources(paths)?;
    let failing_sources: Vec<String> = catalog
        .sources
        .iter()
        .filter(|record| !signature::verify_evidence_dir(&paths.evidence_for(&record.id)).valid)
        .map(|record| record.id.clone())
        .collect();

    let mut gates = GateMap::new();
    for gate in GateName::ALL {
        let passed = match gate {
            GateName::Planning => non_blank_file(&paths.plan),
            GateName::Questions => has_question_file(&paths.questions_dir),
            GateName::Article => non_blank_file(&paths.article),
            GateName::Sources => !catalog.is_empty() && failing_sources.is_empty(),
            GateName::Curiosity
            | GateName::Reconciliation
            | GateName::Integrity
            | GateName::Legal => audit_passed(&paths.audit_for(gate.as_str())),
        };
        gates.insert(gate, passed);
    }

    Ok(DerivedGates {
        gates,
        source_count: catalog.len(),
        failing_sources,
    })
}

/// Walks the phases in order and stops at the first unmet requirement.
pub fn resolve(derived: &DerivedGates, leads: &LeadsFile) -> (Phase, NextAction) {
    let gate = |name: GateName| derived.gates.get(&name).copied().unwrap_or(false);
    if GateName::ALL.iter().all(|name| gate(*name)) {
        return (Phase::Complete, NextAction::Complete);
    }
    if !gate(GateName::Planning) {
        return (Phase::Plan, NextAction::Plan);
    }
    if derived.source_count == 0 {
        return (Phase::Bootstrap, NextAction::Bootstrap);
    }
    if !gate(GateName::Questions) {
        return (Phase::Question, NextAction::GenerateQuestions);
    }
    if let Some(lead) = leads.next_pending() {
        let next = NextAction::FollowLead {
            lead_id: lead.id.clone(),
            lead: lead.lead.clone(),
            priority: lead.priority,
        };
        return (Phase::Follow, next);
    }
    if !gate(GateName::Reconciliation) {
        return (Phase::Follow, NextAction::Reconcile);
    }
    if !gate(GateName::Curiosity) {
        return (Phase::Follow, NextAction::CuriosityCheck);
    }
    if !gate(GateName::Article) {
        return (Phase::Write, NextAction::WriteArticle);
    }
    if !gate(GateName::Sources) {
        let failing = derived.failing_sources.clone();
        return (Phase::Verify, NextAction::CaptureSources { failing });
    }
    if !gate(GateName::Integrity) {
        return (Phase::Verify, NextAction::IntegrityCheck);
    }
    if !gate(GateName::Legal) {
        return (Phase::Verify, NextAction::LegalReview);
    }
    (Phase::Complete, NextAction::Complete)
}

/// Read-only evaluation; nothing under the case directory changes.
pub fn evaluate(case: &Case) -> Result<Evaluation, CoordError> {
    let derived = derive_gates(case)?;
    let leads = store::load_leads(case.paths())?;
    let (phase, next) = resolve(&derived, &leads);
    Ok(Evaluation {
        phase,
        gates: derived.gates,
        next,
        changed: Vec::new(),
    })
}

/// Evaluates, then writes the gates and phase into `state.json` and logs
/// every gate that flipped.
///
/// The ledger entries are appended before `state.json` is saved, so a run
/// that fails partway leaves the old gates in place and the next run logs
/// the same changes again.
pub fn evaluate_and_persist(case: &Case, now: DateTime<Utc>) -> Result<Evaluation, CoordError> {
    let mut evaluation = evaluate(case)?;
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.state)?;
    let mut state = store::load_state(paths)?;

    for (gate, passed) in &evaluation.gates {
        if state.set_gate(*gate, *passed) {
            evaluation.changed.push(*gate);
        }
    }
    let previous_phase = state.phase;
    state.phase = evaluation.phase;
    if evaluation.changed.is_empty() && previous_phase == state.phase {
        return Ok(evaluation);
    }

    for gate in &evaluation.changed {
        let passed = evaluation.gates.get(gate).copied().unwrap_or(false);
        ledger::append(
            case,
            LedgerEntryType::GateCheck,
            fields([("gate", json!(gate.as_str())), ("passed", json!(passed))]),
            now,
        )?;
    }
    if previous_phase != state.phase {
        ledger::append(
            case,
            LedgerEntryType::PhaseEnd,
            fields([("phase", json!(previous_phase.as_str()))]),
            now,
        )?;
        ledger::append(
            case,
            LedgerEntryType::PhaseStart,
            fields([("phase", json!(state.phase.as_str()))]),
            now,
        )?;
    }
    store::save_state(paths, &state)?;

    info!(
        event = "gates_persisted",
        phase = %state.phase,
        changed = evaluation.changed.len()
    );
    Ok(evaluation)
}

/// Starts the next supervisor iteration and returns its number.
pub fn begin_iteration(case: &Case, now: DateTime<Utc>) -> Result<u32, CoordError> {
    let paths = case.paths();
    let _guard = case.locks().acquire(&paths.state)?;
    let mut state = store::load_state(paths)?;
    state.iteration += 1;
    ledger::append(
        case,
        LedgerEntryType::IterationStart,
        fields([
            ("iteration", json!(state.iteration)),
            ("phase", json!(state.phase.as_str())),
        ]),
        now,
    )?;
    store::save_state(paths, &state)?;
    info!(event = "iteration_started", iteration = state.iteration, phase = %state.phase);
    Ok(state.iteration)
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> ledger::Fields {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_case, ts};
    use dossier_core::{Lead, LeadStatus, SourceRecord};

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

    fn derived(passing: &[GateName], source_count: usize) -> DerivedGates {
        DerivedGates {
            gates: GateName::ALL
                .iter()
                .map(|gate| (*gate, passing.contains(gate)))
                .collect(),
            source_count,
            failing_sources: Vec::new(),
        }
    }

    fn leads(items: Vec<Lead>) -> LeadsFile {
        LeadsFile {
            leads: items,
            ..LeadsFile::default()
        }
    }

    const EARLY: [GateName; 2] = [GateName::Planning, GateName::Questions];

    #[test]
    fn highest_priority_pending_lead_is_followed() {
        let leads = leads(vec![
            lead("L001", Priority::Medium, LeadStatus::Pending),
            lead("L002", Priority::High, LeadStatus::Pending),
        ]);
        let (phase, next) = resolve(&derived(&EARLY, 3), &leads);
        assert_eq!(phase, Phase::Follow);
        assert!(matches!(next, NextAction::FollowLead { ref lead_id, .. } if lead_id == "L002"));
    }

    #[test]
    fn terminal_leads_require_reconciliation_then_curiosity() {
        let leads = leads(vec![
            lead("L001", Priority::High, LeadStatus::Investigated),
            lead("L002", Priority::Low, LeadStatus::DeadEnd),
        ]);
        let (phase, next) = resolve(&derived(&EARLY, 3), &leads);
        assert_eq!((phase, next), (Phase::Follow, NextAction::Reconcile));

        let mut passing = EARLY.to_vec();
        passing.push(GateName::Reconciliation);
        let (_, next) = resolve(&derived(&passing, 3), &leads);
        assert_eq!(next, NextAction::CuriosityCheck);

        passing.push(GateName::Curiosity);
        let (phase, next) = resolve(&derived(&passing, 3), &leads);
        assert_eq!((phase, next), (Phase::Write, NextAction::WriteArticle));
    }

    #[test]
    fn pending_lead_outranks_reconciliation_gate() {
        let leads = leads(vec![lead("L004", Priority::Low, LeadStatus::Pending)]);
        let mut passing = EARLY.to_vec();
        passing.push(GateName::Reconciliation);
        passing.push(GateName::Curiosity);
        let (phase, _) = resolve(&derived(&passing, 1), &leads);
        assert_eq!(phase, Phase::Follow);
    }

    #[test]
    fn early_phases_resolve_in_order() {
        let empty = LeadsFile::default();
        assert_eq!(resolve(&derived(&[], 0), &empty).1, NextAction::Plan);
        assert_eq!(
            resolve(&derived(&[GateName::Planning], 0), &empty).1,
            NextAction::Bootstrap
        );
        assert_eq!(
            resolve(&derived(&[GateName::Planning], 2), &empty).1,
            NextAction::GenerateQuestions
        );
        assert_eq!(
            resolve(&derived(&GateName::ALL, 2), &empty),
            (Phase::Complete, NextAction::Complete)
        );
    }

    #[test]
    fn verify_phase_checks_sources_then_audits() {
        let empty = LeadsFile::default();
        let mut passing: Vec<GateName> = GateName::ALL
            .iter()
            .copied()
            .filter(|gate| *gate != GateName::Sources && *gate != GateName::Legal)
            .collect();
        let mut gates = derived(&passing, 2);
        gates.failing_sources = vec!["S002".to_string()];
        assert_eq!(
            resolve(&gates, &empty).1,
            NextAction::CaptureSources {
                failing: vec!["S002".to_string()]
            }
        );
        passing.push(GateName::Sources);
        assert_eq!(resolve(&derived(&passing, 2), &empty).1, NextAction::LegalReview);
    }

    #[test]
    fn gates_come_from_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        let paths = case.paths();
        fs::write(&paths.plan, "# Plan\n\nFollow the money.\n").expect("plan");
        fs::create_dir_all(&paths.questions_dir).expect("questions");
        fs::write(paths.questions_dir.join("01-who.md"), "   \n").expect("blank");
        fs::create_dir_all(&paths.audits_dir).expect("audits");
        fs::write(paths.audit_for("legal"), r#"{"passed": true, "notes": []}"#).expect("legal");
        fs::write(paths.audit_for("integrity"), r#"{"passed": false}"#).expect("integrity");
        fs::write(paths.audit_for("curiosity"), "not json").expect("curiosity");
        let mut catalog = store::load_sources(paths).expect("sources");
        catalog
            .sources
            .push(SourceRecord::new("S001", "https://uncaptured.example"));
        store::save_sources(paths, &catalog).expect("save");

        let derived = derive_gates(&case).expect("derive");
        assert!(derived.gates[&GateName::Planning]);
        assert!(!derived.gates[&GateName::Questions]);
        assert!(derived.gates[&GateName::Legal]);
        assert!(!derived.gates[&GateName::Integrity]);
        assert!(!derived.gates[&GateName::Curiosity]);
        assert!(!derived.gates[&GateName::Sources]);
        assert_eq!(derived.failing_sources, vec!["S001".to_string()]);

        let evaluation = evaluate(&case).expect("evaluate");
        assert_eq!(evaluation.next, NextAction::GenerateQuestions);
        let state = store::load_state(paths).expect("state");
        assert!(!state.gate(GateName::Planning));
    }

    #[test]
    fn persist_writes_changed_gates_and_logs_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        fs::write(&case.paths().plan, "plan").expect("plan");

        let evaluation = evaluate_and_persist(&case, ts(0)).expect("persist");
        assert_eq!(evaluation.changed, vec![GateName::Planning]);
        assert_eq!(evaluation.phase, Phase::Bootstrap);

        let state = store::load_state(case.paths()).expect("state");
        assert!(state.gate(GateName::Planning));
        assert_eq!(state.phase, Phase::Bootstrap);

        let checks = ledger::entries(&case, Some(LedgerEntryType::GateCheck)).expect("ledger");
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].fields["gate"], "planning");
        assert_eq!(
            ledger::entries(&case, Some(LedgerEntryType::PhaseStart))
                .expect("ledger")
                .len(),
            1
        );

        let again = evaluate_and_persist(&case, ts(1)).expect("again");
        assert!(again.changed.is_empty());
        assert_eq!(ledger::entries(&case, None).expect("ledger").len(), 3);
    }

    #[test]
    fn iterations_count_up_and_are_logged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        assert_eq!(begin_iteration(&case, ts(0)).expect("first"), 1);
        assert_eq!(begin_iteration(&case, ts(5)).expect("second"), 2);
        let starts =
            ledger::entries(&case, Some(LedgerEntryType::IterationStart)).expect("entries");
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].fields["iteration"], 2);
    }

    #[test]
    fn failed_ledger_write_leaves_gates_for_the_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let case = new_case(&dir);
        fs::write(&case.paths().plan, "plan").expect("plan");

        let held = case.locks().acquire(&case.paths().ledger).expect("hold ledger");
        assert!(matches!(
            evaluate_and_persist(&case, ts(0)),
            Err(CoordError::LockTimeout { .. })
        ));
        let state = store::load_state(case.paths()).expect("state");
        assert!(!state.gate(GateName::Planning));
        drop(held);

        let retry = evaluate_and_persist(&case, ts(1)).expect("retry");
        assert_eq!(retry.changed, vec![GateName::Planning]);
        let checks = ledger::entries(&case, Some(LedgerEntryType::GateCheck)).expect("ledger");
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].fields["gate"], "planning");
        assert!(store::load_state(case.paths()).expect("state").gate(GateName::Planning));
    }
}
