use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use dossier_core::{IdKind, LeadStatus, LedgerEntryType, SourceRecord};
use dossier_coord::gates::{self, Evaluation};
use dossier_coord::ledger::{self, Fields};
use dossier_coord::merge::{self, MergeReport};
use dossier_coord::{allocator, registry, signature, Case};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum Command {
    /// Reserve a range of IDs for a batch
    Allocate(AllocateArgs),
    /// Drop a reservation without using it
    Release(BatchArgs),
    /// Settle a reservation after using part of it
    Commit(CommitArgs),
    /// Show active and stale reservations
    Status(KindArgs),
    /// Delete reservations older than the stale threshold
    CleanupStale(KindArgs),
    /// Append a ledger entry; extra `--name value` pairs become fields
    LedgerAppend(LedgerAppendArgs),
    LedgerList(LedgerListArgs),
    /// Check evidence/<source_id>/ against its capture signature
    VerifyEvidence(SourceArgs),
    RegisterSource(RegisterSourceArgs),
    MarkCaptured(SourceArgs),
    LeadStatus(LeadStatusArgs),
    MergeBatchResults(MergeBatchArgs),
    /// Merge every pending file in batches/
    MergePending(CaseArgs),
    /// Recompute gates and print the next action
    Evaluate(EvaluateArgs),
    BeginIteration(CaseArgs),
}

#[derive(Args, Debug)]
pub struct CaseArgs {
    pub case: PathBuf,
}

#[derive(Args, Debug)]
pub struct KindArgs {
    pub case: PathBuf,
    #[arg(long, default_value = "source")]
    pub kind: IdKind,
}

#[derive(Args, Debug)]
pub struct AllocateArgs {
    pub case: PathBuf,
    pub count: u64,
    pub batch_id: Option<String>,
    #[arg(long, default_value = "source")]
    pub kind: IdKind,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    pub case: PathBuf,
    pub batch_id: String,
    #[arg(long, default_value = "source")]
    pub kind: IdKind,
}

#[derive(Args, Debug)]
pub struct CommitArgs {
    pub case: PathBuf,
    pub batch_id: String,
    pub used_count: u64,
    #[arg(long, default_value = "source")]
    pub kind: IdKind,
}

#[derive(Args, Debug)]
pub struct LedgerAppendArgs {
    pub case: PathBuf,
    #[arg(value_name = "TYPE")]
    pub entry_type: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "--NAME VALUE")]
    pub fields: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LedgerListArgs {
    pub case: PathBuf,
    #[arg(long = "type")]
    pub entry_type: Option<LedgerEntryType>,
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    pub case: PathBuf,
    pub source_id: String,
}

#[derive(Args, Debug)]
pub struct RegisterSourceArgs {
    pub case: PathBuf,
    pub id: String,
    pub url: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long = "type")]
    pub source_type: Option<String>,
}

#[derive(Args, Debug)]
pub struct LeadStatusArgs {
    pub case: PathBuf,
    pub lead_id: String,
    pub status: LeadStatus,
    #[arg(long = "source")]
    pub sources: Vec<String>,
}

#[derive(Args, Debug)]
pub struct MergeBatchArgs {
    pub case: PathBuf,
    pub batch_id: String,
    pub results: PathBuf,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    pub case: PathBuf,
    #[arg(long)]
    pub persist: bool,
}

/// Where command results go: pretty JSON or a short human line.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", human());
        }
        Ok(())
    }
}

pub fn handle_command(command: Command, output: Output) -> Result<()> {
    match command {
        Command::Allocate(args) => allocate(&args, output),
        Command::Release(args) => release(&args, output),
        Command::Commit(args) => commit(&args, output),
        Command::Status(args) => status(&args, output),
        Command::CleanupStale(args) => cleanup_stale(&args, output),
        Command::LedgerAppend(args) => ledger_append(&args, output),
        Command::LedgerList(args) => ledger_list(&args, output),
        Command::VerifyEvidence(args) => verify_evidence(&args, output),
        Command::RegisterSource(args) => register_source(args, output),
        Command::MarkCaptured(args) => mark_captured(&args, output),
        Command::LeadStatus(args) => lead_status(&args, output),
        Command::MergeBatchResults(args) => merge_batch_results(&args, output),
        Command::MergePending(args) => merge_pending(&args, output),
        Command::Evaluate(args) => evaluate(&args, output),
        Command::BeginIteration(args) => begin_iteration(&args, output),
    }
}

fn allocate(args: &AllocateArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let allocation = allocator::allocate(
        &case,
        args.kind,
        args.count,
        args.batch_id.as_deref(),
        Utc::now(),
    )
    .with_context(|| format!("allocate {} {} IDs", args.count, args.kind))?;
    output.emit(&allocation, || {
        format!(
            "{} {}..{} ({} {} IDs)",
            allocation.batch_id,
            args.kind.format_id(allocation.start),
            args.kind.format_id(allocation.end - 1),
            allocation.count,
            args.kind
        )
    })
}

fn release(args: &BatchArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let released = allocator::release(&case, args.kind, &args.batch_id)
        .with_context(|| format!("release {}", args.batch_id))?;
    output.emit(&released, || format!("released {}", released.batch_id))
}

fn commit(args: &CommitArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let committed = allocator::commit(&case, args.kind, &args.batch_id, args.used_count)
        .with_context(|| format!("commit {}", args.batch_id))?;
    output.emit(&committed, || {
        format!(
            "committed {} ({} of {} used)",
            committed.batch_id, args.used_count, committed.count
        )
    })
}

fn status(args: &KindArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let report = allocator::status(&case, args.kind, Utc::now()).context("read allocations")?;
    output.emit(&report, || {
        let mut lines = vec![format!(
            "next {}: {}",
            args.kind,
            args.kind.format_id(report.next_id)
        )];
        for (label, allocations) in [("active", &report.active), ("stale", &report.stale)] {
            for allocation in allocations {
                lines.push(format!(
                    "{label:<6} {} [{}, {})",
                    allocation.batch_id, allocation.start, allocation.end
                ));
            }
        }
        lines.join("\n")
    })
}

fn cleanup_stale(args: &KindArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let purged =
        allocator::cleanup_stale(&case, args.kind, Utc::now()).context("clean up allocations")?;
    output.emit(&purged, || format!("removed {} stale allocation(s)", purged.len()))
}

/// `--name value` and `--name=value` pairs. Values that parse as JSON
/// scalars keep their type; anything else is a string.
fn parse_field_pairs(raw: &[String]) -> Result<Fields> {
    let mut fields = Fields::new();
    let mut items = raw.iter();
    while let Some(item) = items.next() {
        let Some(flag) = item.strip_prefix("--") else {
            bail!("expected --name before '{item}'");
        };
        let (name, value) = match flag.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => {
                let value = items
                    .next()
                    .ok_or_else(|| anyhow!("missing value for --{flag}"))?;
                (flag.to_string(), value.clone())
            }
        };
        if name.is_empty() {
            bail!("empty field name in '{item}'");
        }
        fields.insert(name.replace('-', "_"), parse_field_value(&value));
    }
    Ok(fields)
}

fn parse_field_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if !value.is_object() && !value.is_array() => value,
        _ => Value::String(raw.to_string()),
    }
}

fn ledger_append(args: &LedgerAppendArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let fields = parse_field_pairs(&args.fields)?;
    let entry = ledger::append_raw(&case, &args.entry_type, fields, Utc::now())
        .with_context(|| format!("append {} entry", args.entry_type))?;
    output.emit(&entry, || format!("{} {}", entry.id, entry.kind))
}

fn ledger_list(args: &LedgerListArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let entries = ledger::entries(&case, args.entry_type).context("read ledger")?;
    output.emit(&entries, || {
        entries
            .iter()
            .map(|entry| {
                format!(
                    "{} {} {} {}",
                    entry.id,
                    entry.ts.format("%Y-%m-%dT%H:%M:%SZ"),
                    entry.kind,
                    serde_json::to_string(&entry.fields).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn verify_evidence(args: &SourceArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let verdict = signature::verify_evidence_dir(&case.paths().evidence_for(&args.source_id));
    output.emit(&verdict, || format!("{}: {}", args.source_id, verdict.reason))?;
    if !verdict.valid {
        bail!("evidence for {} rejected: {}", args.source_id, verdict.reason);
    }
    Ok(())
}

fn register_source(args: RegisterSourceArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let mut record = SourceRecord::new(args.id, args.url);
    record.title = args.title.unwrap_or_default();
    record.kind = args.source_type;
    let stored = registry::register_source(&case, record).context("register source")?;
    output.emit(&stored, || format!("registered {} {}", stored.id, stored.url))
}

fn mark_captured(args: &SourceArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let record = registry::mark_captured(&case, &args.source_id)
        .with_context(|| format!("mark {} captured", args.source_id))?;
    output.emit(&record, || format!("{} captured", record.id))
}

fn lead_status(args: &LeadStatusArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let lead = registry::set_lead_status(&case, &args.lead_id, args.status, &args.sources)
        .with_context(|| format!("update lead {}", args.lead_id))?;
    output.emit(&lead, || format!("{} {}", lead.id, lead.status))
}

fn merge_summary(report: &MergeReport) -> String {
    format!(
        "merged {} batch(es): +{} leads ({} duplicate, {} too deep), \
         +{} sources ({} duplicate, {} unverified capture), {} findings; next source {}",
        report.batches.len(),
        report.leads_added.len(),
        report.leads_skipped,
        report.leads_depth_rejected,
        report.sources_added.len(),
        report.sources_skipped,
        report.sources_uncaptured,
        report.findings_appended,
        report.next_source
    )
}

fn merge_batch_results(args: &MergeBatchArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let report = merge::merge_batch_file(&case, &args.batch_id, &args.results)
        .with_context(|| format!("merge {}", args.results.display()))?;
    output.emit(&report, || merge_summary(&report))
}

fn merge_pending(args: &CaseArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let report = merge::merge_pending(&case).context("merge pending batches")?;
    output.emit(&report, || merge_summary(&report))
}

fn evaluation_summary(evaluation: &Evaluation) -> String {
    let failing: Vec<&str> = evaluation
        .gates
        .iter()
        .filter(|(_, passed)| !**passed)
        .map(|(gate, _)| gate.as_str())
        .collect();
    let mut summary = format!(
        "phase {}: {}",
        evaluation.phase,
        evaluation.next.describe()
    );
    if !failing.is_empty() {
        summary.push_str(&format!("\nopen gates: {}", failing.join(", ")));
    }
    summary
}

fn evaluate(args: &EvaluateArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let evaluation = if args.persist {
        gates::evaluate_and_persist(&case, Utc::now()).context("persist gates")?
    } else {
        gates::evaluate(&case).context("evaluate gates")?
    };
    output.emit(&evaluation, || evaluation_summary(&evaluation))
}

fn begin_iteration(args: &CaseArgs, output: Output) -> Result<()> {
    let case = Case::open(&args.case);
    let iteration = gates::begin_iteration(&case, Utc::now()).context("begin iteration")?;
    output.emit(&json!({ "iteration": iteration }), || {
        format!("iteration {iteration}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn field_pairs_keep_scalar_types() {
        let fields = parse_field_pairs(&strings(&[
            "--gate",
            "legal",
            "--passed",
            "false",
            "--iteration=3",
            "--task-id",
            "T-9",
        ]))
        .expect("parse");
        assert_eq!(fields["gate"], json!("legal"));
        assert_eq!(fields["passed"], json!(false));
        assert_eq!(fields["iteration"], json!(3));
        assert_eq!(fields["task_id"], json!("T-9"));
    }

    #[test]
    fn structured_values_stay_strings() {
        assert_eq!(parse_field_value("[1,2]"), json!("[1,2]"));
        assert_eq!(parse_field_value("null"), Value::Null);
        assert_eq!(parse_field_value("S001"), json!("S001"));
    }

    #[test]
    fn dangling_flag_is_an_error() {
        assert!(parse_field_pairs(&strings(&["--verdict"])).is_err());
        assert!(parse_field_pairs(&strings(&["verdict", "ok"])).is_err());
    }
}
