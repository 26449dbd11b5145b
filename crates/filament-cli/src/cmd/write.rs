use anyhow::Result;
use clap::Args;
use filament_core::model::{CommitRef, Operation, ResourceId, StateWriteData};
use serde::Serialize;
use serde_json::Value;

use super::{Identity, Session, parse_assignment};
use crate::output::{kv, render};

#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Resource to write to.
    pub resource: ResourceId,

    /// `key=value` pairs. Values are JSON when they parse, otherwise strings.
    #[arg(required = true, value_parser = parse_assignment)]
    pub assignments: Vec<(String, Value)>,

    /// Commit this write was derived from (`<filament>@<index>`, repeatable).
    #[arg(long = "input")]
    pub inputs: Vec<CommitRef>,

    /// Evidence commit backing this write (`<filament>@<index>`, repeatable).
    #[arg(long = "evidence")]
    pub evidence: Vec<CommitRef>,
}

#[derive(Debug, Serialize)]
struct WriteReport {
    commit: String,
    commit_hash: String,
    keys: Vec<String>,
}

/// Execute `fil write`: one `state_write` commit on the resource filament.
///
/// # Errors
///
/// Fails when no actor can be resolved, a ref names a missing commit, or
/// the journal cannot be written.
pub fn run_write(args: WriteArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let ctx = session.context(identity)?;
    let filament_id = args.resource.filament_id();
    let writes = args.assignments.into_iter().collect();

    let report = session.transact(|store| {
        let mut commit = store.next_commit(
            &filament_id,
            &ctx,
            Operation::StateWrite(StateWriteData { writes }),
        )?;
        for input in args.inputs {
            commit = commit.with_input(input);
        }
        for evidence in args.evidence {
            commit = commit.with_evidence(evidence);
        }
        let keys = commit
            .operation
            .writes()
            .map(|w| w.keys().cloned().collect())
            .unwrap_or_default();
        let commit_ref = store.append(commit)?;
        let commit_hash = store
            .commit(&commit_ref)
            .map(|c| c.commit_hash.clone())
            .unwrap_or_default();
        Ok(WriteReport {
            commit: commit_ref.to_string(),
            commit_hash,
            keys,
        })
    })?;

    render(session.output, &report, |r, w| {
        kv(w, "commit", &r.commit)?;
        kv(w, "hash", &r.commit_hash)?;
        kv(w, "keys", r.keys.join(", "))
    })
}
