use anyhow::Result;
use clap::Args;
use filament_core::conflict::resolve_conflict;
use filament_core::model::{FilamentId, ProposalId, Resolution};
use serde::Serialize;

use super::{AuthorityArgs, Identity, Session};
use crate::output::{CliError, kv, reject, render};

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("resolution").required(true).args(["select", "fork"])))]
pub struct ResolveArgs {
    /// Conflict filament id (`conflict:<resource>:<a>+<b>`).
    pub conflict: FilamentId,

    /// Keep this proposal queued and cancel the other party.
    #[arg(long)]
    pub select: Option<ProposalId>,

    /// Move this proposal onto its own branch filament.
    #[arg(long)]
    pub fork: Option<ProposalId>,

    #[command(flatten)]
    pub authority: AuthorityArgs,
}

impl ResolveArgs {
    fn resolution(&self) -> Option<Resolution> {
        match (&self.select, &self.fork) {
            (Some(p), None) => Some(Resolution::Select {
                proposal_id: p.clone(),
            }),
            (None, Some(p)) => Some(Resolution::Fork {
                proposal_id: p.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    conflict: String,
    resolution: Resolution,
    commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancelled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fork: Option<String>,
}

/// Execute `fil resolve`. The acting identity signs the authority object,
/// so it must be a human or agent and `--reason`/`--sig` must be given.
///
/// # Errors
///
/// Fails without valid authority, when the proposal is not a party, or
/// when the conflict is already resolved.
pub fn run_resolve(args: &ResolveArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let Some(resolution) = args.resolution() else {
        let msg = "exactly one of --select or --fork is required";
        return Err(reject(session.output, &CliError::new(msg)));
    };
    let ctx = session.context(identity)?;
    let authority = args.authority.authority(&ctx.actor);
    let report = session.transact(|store| {
        let resolved = resolve_conflict(
            store,
            &args.conflict,
            resolution.clone(),
            authority.as_ref(),
            &ctx,
        )?;
        Ok(ResolveReport {
            conflict: args.conflict.to_string(),
            resolution,
            commit: resolved.commit.to_string(),
            cancelled: resolved.cancelled.as_ref().map(ToString::to_string),
            fork: resolved.fork.as_ref().map(ToString::to_string),
        })
    })?;

    render(session.output, &report, |r, w| {
        kv(w, "resolved", &r.conflict)?;
        kv(w, "commit", &r.commit)?;
        if let Some(cancelled) = &r.cancelled {
            kv(w, "cancelled", cancelled)?;
        }
        if let Some(fork) = &r.fork {
            kv(w, "fork", fork)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(select: Option<&str>, fork: Option<&str>) -> ResolveArgs {
        ResolveArgs {
            conflict: FilamentId::new_unchecked("conflict:doc:a+b"),
            select: select.map(ProposalId::new_unchecked),
            fork: fork.map(ProposalId::new_unchecked),
            authority: AuthorityArgs {
                reason: None,
                signatures: Vec::new(),
            },
        }
    }

    #[test]
    fn exactly_one_resolution_flag() {
        assert_eq!(
            args(Some("a"), None).resolution(),
            Some(Resolution::Select {
                proposal_id: ProposalId::new_unchecked("a")
            })
        );
        assert_eq!(
            args(None, Some("b")).resolution(),
            Some(Resolution::Fork {
                proposal_id: ProposalId::new_unchecked("b")
            })
        );
        assert_eq!(args(None, None).resolution(), None);
    }
}
