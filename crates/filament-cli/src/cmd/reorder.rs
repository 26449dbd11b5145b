use anyhow::Result;
use clap::Args;
use filament_core::model::{ProposalId, ResourceId};
use filament_core::queue::{MergeQueue, reorder};
use serde::Serialize;

use super::{AuthorityArgs, Identity, Session};
use crate::output::{kv, render};

#[derive(Args, Debug)]
pub struct ReorderArgs {
    pub resource: ResourceId,

    /// Proposals to pin to the front, in order.
    #[arg(required = true)]
    pub order: Vec<ProposalId>,

    #[command(flatten)]
    pub authority: AuthorityArgs,
}

#[derive(Debug, Serialize)]
struct ReorderReport {
    commit: String,
    order: Vec<String>,
}

/// Execute `fil reorder`. Needs `--reason` and at least one `--sig` from a
/// non-system actor.
///
/// # Errors
///
/// Fails without valid authority or when a named proposal is not queued.
pub fn run_reorder(args: ReorderArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let ctx = session.context(identity)?;
    let authority = args.authority.authority(&ctx.actor);
    let report = session.transact(|store| {
        let commit = reorder(store, &args.resource, args.order, authority.as_ref(), &ctx)?;
        let queue = MergeQueue::load(store, &args.resource);
        Ok(ReorderReport {
            commit: commit.to_string(),
            order: queue.proposal_ids().map(ToString::to_string).collect(),
        })
    })?;

    render(session.output, &report, |r, w| {
        kv(w, "commit", &r.commit)?;
        kv(w, "order", r.order.join(" > "))
    })
}
