use std::io::Write as _;

use anyhow::Result;
use clap::Args;
use filament_core::conflict::{ConflictRecord, Violation, check_no_silent_arbitration};
use filament_core::model::{FilamentKind, Operation};
use filament_core::queue::MergeQueue;
use filament_core::store::IntegrityReport;
use serde::Serialize;

use super::Session;
use crate::output::{Reported, fail, kv, render, section};

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Truncate a torn trailing journal line before verifying.
    #[arg(long)]
    pub repair: bool,
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    journal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    repaired_bytes: Option<u64>,
    filaments: usize,
    integrity: IntegrityReport,
    violations: Vec<Violation>,
    ok: bool,
}

/// Execute `fil verify`: reload the journal (which re-checks every stored
/// hash), scan the store for index and ref problems, and look for
/// overlapping queued proposals that were never recorded as conflicts.
///
/// # Errors
///
/// Fails on a corrupt journal or when any problem is found.
pub fn run_verify(args: &VerifyArgs, session: &Session) -> Result<()> {
    let repaired_bytes = if args.repair {
        session
            .journal
            .repair()
            .map_err(|e| fail(session.output, &e))?
    } else {
        None
    };
    let store = session.load()?;
    let integrity = store.verify();

    let conflicts = ConflictRecord::all(&store);
    let violations: Vec<Violation> = store
        .filaments_of_kind(FilamentKind::Queue)
        .filter_map(|f| f.commits().first())
        .filter_map(|c| match &c.operation {
            Operation::QueueEnqueue(entry) => Some(&entry.resource_id),
            _ => None,
        })
        .flat_map(|resource| {
            check_no_silent_arbitration(&MergeQueue::load(&store, resource), &conflicts)
        })
        .collect();

    let report = VerifyReport {
        journal: session.journal.journal_path().display().to_string(),
        repaired_bytes,
        filaments: store.filaments().count(),
        ok: integrity.is_ok() && violations.is_empty(),
        integrity,
        violations,
    };
    render(session.output, &report, |r, w| {
        section(w, "Verify")?;
        kv(w, "journal", &r.journal)?;
        if let Some(bytes) = r.repaired_bytes {
            kv(w, "repaired", format!("dropped {bytes} torn bytes"))?;
        }
        kv(w, "commits", r.integrity.checked.to_string())?;
        kv(w, "filaments", r.filaments.to_string())?;
        for p in &r.integrity.problems {
            writeln!(w, "  {}: {}", p.commit, p.detail)?;
        }
        for v in &r.violations {
            writeln!(
                w,
                "  {}: {} and {} overlap with no conflict record",
                v.resource_id, v.proposals.0, v.proposals.1
            )?;
        }
        kv(w, "status", if r.ok { "ok" } else { "FAILED" })
    })?;

    if report.ok {
        Ok(())
    } else {
        Err(Reported("verify failed".to_string()).into())
    }
}
