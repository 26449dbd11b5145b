use anyhow::Result;
use clap::Args;
use filament_core::model::{ProposalId, ResourceId};
use filament_core::queue::cancel;
use serde::Serialize;

use super::{AuthorityArgs, Identity, Session};
use crate::output::{kv, render};

#[derive(Args, Debug)]
pub struct CancelArgs {
    pub resource: ResourceId,

    pub proposal: ProposalId,

    #[command(flatten)]
    pub authority: AuthorityArgs,
}

#[derive(Debug, Serialize)]
struct CancelReport {
    proposal: String,
    commit: String,
}

/// Execute `fil cancel`. Needs authority, like `reorder`.
///
/// # Errors
///
/// Fails without valid authority or when the proposal already merged or
/// was cancelled.
pub fn run_cancel(args: &CancelArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let ctx = session.context(identity)?;
    let authority = args.authority.authority(&ctx.actor);
    let report = session.transact(|store| {
        let commit = cancel(store, &args.resource, &args.proposal, authority.as_ref(), &ctx)?;
        Ok(CancelReport {
            proposal: args.proposal.to_string(),
            commit: commit.to_string(),
        })
    })?;

    render(session.output, &report, |r, w| {
        kv(w, "cancelled", &r.proposal)?;
        kv(w, "commit", &r.commit)
    })
}
