use anyhow::Result;
use clap::Args;
use filament_core::model::{ProposalId, ResourceId};
use filament_core::queue::merge;
use serde::Serialize;

use super::{Identity, Session};
use crate::output::{kv, render};

#[derive(Args, Debug)]
pub struct MergeArgs {
    pub resource: ResourceId,

    /// Must be the current queue head.
    pub proposal: ProposalId,
}

#[derive(Debug, Serialize)]
struct MergeReport {
    proposal: String,
    resource_commit: String,
    queue_commit: String,
    head_hash: String,
}

/// Execute `fil merge`.
///
/// # Errors
///
/// Refused unless the proposal is the queue head, its base is the current
/// resource head, and every conflict it is party to has been resolved in
/// its favour.
pub fn run_merge(args: &MergeArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let ctx = session.context(identity)?;
    let report = session.transact(|store| {
        let merged = merge(store, &args.resource, &args.proposal, &ctx)?;
        Ok(MergeReport {
            proposal: args.proposal.to_string(),
            resource_commit: merged.resource_commit.to_string(),
            queue_commit: merged.queue_commit.to_string(),
            head_hash: store.head_hash(&args.resource.filament_id()),
        })
    })?;

    render(session.output, &report, |r, w| {
        kv(w, "merged", &r.proposal)?;
        kv(w, "commit", &r.resource_commit)?;
        kv(w, "head", &r.head_hash)
    })
}
