use std::io::Write as _;

use anyhow::Result;
use clap::Args;
use filament_core::canon::digest::truncate_hash;
use filament_core::conflict::ConflictRecord;
use filament_core::model::ResourceId;
use filament_core::queue::{EntryState, MergeQueue};
use serde::Serialize;

use super::Session;
use crate::output::{render, section};

#[derive(Args, Debug)]
pub struct QueueArgs {
    pub resource: ResourceId,
}

#[derive(Debug, Serialize)]
struct QueueRow {
    position: usize,
    proposal: String,
    task: String,
    actor: String,
    state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pinned_rank: Option<usize>,
    base_commit_hash: String,
    loci: Vec<String>,
    /// Unresolved conflict records this proposal is a party to.
    open_conflicts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct QueueReport {
    resource: String,
    head_hash: String,
    entries: Vec<QueueRow>,
}

/// Execute `fil queue`: the resource's queue, head first.
///
/// # Errors
///
/// Fails when the journal cannot be loaded.
pub fn run_queue(args: &QueueArgs, session: &Session) -> Result<()> {
    let store = session.load()?;
    let queue = MergeQueue::load(&store, &args.resource);
    let open: Vec<ConflictRecord> = ConflictRecord::for_resource(&store, &args.resource)
        .into_iter()
        .filter(|c| !c.is_resolved())
        .collect();

    let entries = queue
        .entries()
        .iter()
        .enumerate()
        .map(|(position, queued)| {
            let proposal = &queued.entry.proposal_id;
            QueueRow {
                position,
                proposal: proposal.to_string(),
                task: queued.entry.task_id.to_string(),
                actor: queued.entry.actor_id.clone(),
                state: queue.state(proposal).unwrap_or(EntryState::Queued),
                pinned_rank: queued.pinned_rank,
                base_commit_hash: queued.entry.base_commit_hash.clone(),
                loci: queued.entry.touched_loci.iter().map(ToString::to_string).collect(),
                open_conflicts: open
                    .iter()
                    .filter(|c| c.involves(proposal))
                    .map(|c| c.id.to_string())
                    .collect(),
            }
        })
        .collect();

    let report = QueueReport {
        resource: args.resource.to_string(),
        head_hash: store.head_hash(&args.resource.filament_id()),
        entries,
    };

    render(session.output, &report, |r, w| {
        section(w, &format!("Queue: {} (head {})", r.resource, truncate_hash(&r.head_hash, 12)))?;
        if r.entries.is_empty() {
            return writeln!(w, "empty");
        }
        for row in &r.entries {
            let marker = if row.pinned_rank.is_some() { "*" } else { " " };
            let blocked = if row.open_conflicts.is_empty() { "" } else { "  [conflict]" };
            writeln!(
                w,
                "{:>3}{marker} {:<20} {:<16} {:<12} {}{blocked}",
                row.position,
                row.proposal,
                row.task,
                row.actor,
                row.loci.join(",")
            )?;
        }
        Ok(())
    })
}
