use std::collections::BTreeSet;
use std::io::Write as _;

use anyhow::Result;
use clap::Args;
use filament_core::conflict::{ConflictRecord, Violation, check_no_silent_arbitration};
use filament_core::model::{FilamentKind, Locus, Resolution, ResourceId};
use filament_core::queue::MergeQueue;
use filament_core::store::FilamentStore;
use serde::Serialize;

use super::Session;
use crate::output::{render, section};

#[derive(Args, Debug)]
pub struct ConflictsArgs {
    /// Only this resource.
    #[arg(long)]
    pub resource: Option<ResourceId>,

    /// Hide resolved records.
    #[arg(long)]
    pub open: bool,
}

#[derive(Debug, Serialize)]
struct ConflictsReport {
    conflicts: Vec<ConflictRecord>,
    /// Overlapping queued pairs with no record.
    violations: Vec<Violation>,
}

/// Resources that have a queue filament. Every conflict record belongs to one.
fn queued_resources(store: &FilamentStore) -> BTreeSet<ResourceId> {
    store
        .filaments_of_kind(FilamentKind::Queue)
        .filter_map(|f| f.id.as_str().strip_prefix("queue:"))
        .filter_map(|r| ResourceId::new(r).ok())
        .collect()
}

/// Execute `fil conflicts`.
///
/// # Errors
///
/// Fails when the journal cannot be loaded.
pub fn run_conflicts(args: &ConflictsArgs, session: &Session) -> Result<()> {
    let store = session.load()?;
    let resources: BTreeSet<ResourceId> = match &args.resource {
        Some(r) => BTreeSet::from([r.clone()]),
        None => queued_resources(&store),
    };

    let mut conflicts = Vec::new();
    let mut violations = Vec::new();
    for resource in &resources {
        let records = ConflictRecord::for_resource(&store, resource);
        violations.extend(check_no_silent_arbitration(
            &MergeQueue::load(&store, resource),
            &records,
        ));
        conflicts.extend(records);
    }
    if args.open {
        conflicts.retain(|c| !c.is_resolved());
    }

    let report = ConflictsReport {
        conflicts,
        violations,
    };
    render(session.output, &report, |r, w| {
        section(w, "Conflicts")?;
        if r.conflicts.is_empty() {
            writeln!(w, "none")?;
        }
        for c in &r.conflicts {
            let status = match c.resolution() {
                None => "open".to_string(),
                Some(res) => format!("resolved ({})", describe(res)),
            };
            let overlap: Vec<&str> = c.overlap.iter().map(Locus::as_str).collect();
            writeln!(
                w,
                "{:<36} {} vs {}  loci {}  {status}",
                c.id,
                c.proposals.0,
                c.proposals.1,
                overlap.join(",")
            )?;
        }
        if !r.violations.is_empty() {
            section(w, "Unrecorded overlaps")?;
            for v in &r.violations {
                writeln!(w, "{}: {} vs {}", v.resource_id, v.proposals.0, v.proposals.1)?;
            }
        }
        Ok(())
    })
}

fn describe(resolution: &Resolution) -> String {
    match resolution {
        Resolution::Select { proposal_id } => format!("select {proposal_id}"),
        Resolution::Fork { proposal_id } => format!("fork {proposal_id}"),
    }
}
