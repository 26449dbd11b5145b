use anyhow::Result;
use clap::Args;
use filament_core::model::{Locus, ProposalId, ResourceId, TaskId};
use filament_core::queue::{QueueEntry, enqueue};
use serde::Serialize;
use serde_json::Value;

use super::{Identity, Session, parse_assignment};
use crate::output::{kv, render};

/// `--base head` resolves to the resource's current head hash.
const BASE_HEAD: &str = "head";

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    pub resource: ResourceId,

    pub proposal: ProposalId,

    /// Task the proposal belongs to; orders the queue.
    #[arg(long)]
    pub task: TaskId,

    /// Loci the change touches (comma-separated or repeated).
    #[arg(long, value_delimiter = ',')]
    pub loci: Vec<Locus>,

    /// Resource head hash the change was made against, or `head`.
    #[arg(long)]
    pub base: Option<String>,

    /// Write applied when the proposal merges (`key=value`, repeatable).
    #[arg(long = "set", value_parser = parse_assignment)]
    pub writes: Vec<(String, Value)>,
}

#[derive(Debug, Serialize)]
struct EnqueueReport {
    resource: String,
    proposal: String,
    commit: String,
    base_commit_hash: String,
    conflicts: Vec<String>,
}

/// Execute `fil enqueue`. Overlapping queued proposals get a conflict
/// record; nothing is arbitrated here.
///
/// # Errors
///
/// Fails on missing loci or base hash, a reused proposal id, or a journal
/// failure.
pub fn run_enqueue(args: EnqueueArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let ctx = session.context(identity)?;
    let EnqueueArgs {
        resource,
        proposal,
        task,
        loci,
        base,
        writes,
    } = args;

    let report = session.transact(|store| {
        let base = base.map(|b| {
            if b == BASE_HEAD {
                store.head_hash(&resource.filament_id())
            } else {
                b
            }
        });
        let entry = QueueEntry::new(
            resource.clone(),
            proposal.clone(),
            task,
            ctx.actor.id.clone(),
            base,
            loci,
        )?
        .with_writes(writes.into_iter().collect());
        let base_commit_hash = entry.base_commit_hash.clone();
        let enqueued = enqueue(store, entry, &ctx)?;
        Ok(EnqueueReport {
            resource: resource.to_string(),
            proposal: proposal.to_string(),
            commit: enqueued.commit.to_string(),
            base_commit_hash,
            conflicts: enqueued
                .conflicts
                .iter()
                .map(|c| c.filament_id.to_string())
                .collect(),
        })
    })?;

    render(session.output, &report, |r, w| {
        kv(w, "enqueued", format!("{} on {}", r.proposal, r.resource))?;
        kv(w, "commit", &r.commit)?;
        kv(w, "base", &r.base_commit_hash)?;
        for conflict in &r.conflicts {
            kv(w, "conflict", conflict)?;
        }
        Ok(())
    })
}
