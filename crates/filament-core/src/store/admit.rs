//! Semantic admission of staged commits.
//!
//! Payload validation only proves a commit is well formed. Admission checks
//! it against the log it is joining (the store plus the earlier commits of
//! the same batch), so the queue and conflict rules hold for every append,
//! including journal lines read back from disk:
//!
//! - an operation may only join a filament of its own kind, and the derived
//!   names (`queue:`, `conflict:`, `divergence:`) belong to their kinds;
//! - `queue_merge` names the head, points at that proposal's
//!   `proposal_merge`, and lands on the base the proposal was made against
//!   with every overlap settled in its favour;
//! - `queue_cancel` and `queue_reorder` only touch queued proposals;
//! - `conflict_open` records the real intersection of two queued entries;
//! - `conflict_resolve` settles an open record, once, for one of its parties.

use super::{GENESIS_HASH, Staging};
use crate::conflict::{ConflictRecord, detect_conflict};
use crate::error::{ErrorCode, GraphError};
use crate::model::{
    Commit, CommitRef, ConflictOpenData, ConflictResolveData, FilamentId, FilamentKind, Operation,
    QueueMergeData, ResourceId,
};
use crate::queue::{self, MergeQueue, QueueEntry};

impl Staging<'_> {
    /// Check `commit` against the staged log and return the kind of the
    /// filament it joins. `expected` is its (already verified) index.
    pub(super) fn admit(&self, commit: &Commit, expected: u64) -> Result<FilamentKind, GraphError> {
        let kind = self.admit_kind(commit, expected)?;
        match &commit.operation {
            Operation::QueueEnqueue(entry) => self.admit_enqueue(commit, entry)?,
            Operation::QueueMerge(d) => self.admit_queue_merge(commit, d)?,
            Operation::QueueCancel(d) => self
                .queue_of(commit)?
                .require_cancellable(&d.proposal_id)?,
            Operation::QueueReorder(d) => self.queue_of(commit)?.require_queued(&d.order)?,
            Operation::ConflictOpen(d) => self.admit_conflict_open(commit, d, expected)?,
            Operation::ConflictResolve(d) => self.admit_conflict_resolve(commit, d)?,
            _ => {}
        }
        Ok(kind)
    }

    fn admit_kind(&self, commit: &Commit, expected: u64) -> Result<FilamentKind, GraphError> {
        let id = &commit.filament_id;
        let tag = commit.operation.tag();
        let claimed = match &commit.operation {
            Operation::Fork(_) if expected > 0 => {
                return Err(invalid(format!("fork must be the first commit of {id}")));
            }
            Operation::Fork(fork) => self
                .kind_of(&fork.parent.filament_id)
                .unwrap_or(FilamentKind::Resource),
            op => op.implied_kind().unwrap_or(FilamentKind::Resource),
        };

        if expected > 0 {
            return match self.kind_of(id) {
                Some(kind) if kind != claimed => Err(invalid(format!(
                    "{tag} cannot join {kind} filament {id}"
                ))),
                _ => Ok(claimed),
            };
        }
        match id.reserved_kind() {
            Some(reserved) if reserved != claimed => Err(invalid(format!(
                "{id} is reserved for {reserved} filaments, not {tag}"
            ))),
            None if claimed.is_derived() => Err(invalid(format!(
                "{tag} must start a derived {claimed} filament, not {id}"
            ))),
            _ => Ok(claimed),
        }
    }

    fn admit_enqueue(&self, commit: &Commit, entry: &QueueEntry) -> Result<(), GraphError> {
        let queue_id = entry.resource_id.queue_filament_id();
        if commit.filament_id != queue_id {
            return Err(invalid(format!(
                "queue_enqueue for {} must land on {queue_id}, not {}",
                entry.resource_id, commit.filament_id
            )));
        }
        if self.queue(&entry.resource_id).state(&entry.proposal_id).is_some() {
            return Err(invalid(format!(
                "proposal {} was already enqueued on {}",
                entry.proposal_id, entry.resource_id
            )));
        }
        Ok(())
    }

    fn admit_queue_merge(&self, commit: &Commit, d: &QueueMergeData) -> Result<(), GraphError> {
        let queue = self.queue_of(commit)?;
        let head = queue.require_head(&d.proposal_id)?;
        let resource_id = &head.entry.resource_id;

        let lands = self.lookup(&d.merged).is_some_and(|landed| {
            landed.filament_id == resource_id.filament_id()
                && matches!(
                    &landed.operation,
                    Operation::ProposalMerge(m) if m.proposal_id == d.proposal_id
                )
        });
        if !lands {
            return Err(invalid(format!(
                "queue_merge for {} must point at its proposal_merge on {resource_id}, not {}",
                d.proposal_id, d.merged
            )));
        }

        queue::check_base(&head.entry, &self.hash_before(&d.merged))?;
        for other in queue.entries().iter().skip(1) {
            queue::check_arbitrated(&head.entry, &other.entry, |id| self.conflict(id))?;
        }
        Ok(())
    }

    fn admit_conflict_open(
        &self,
        commit: &Commit,
        d: &ConflictOpenData,
        expected: u64,
    ) -> Result<(), GraphError> {
        let (a, b) = &d.proposals;
        let id = d.resource_id.conflict_filament_id(a, b);
        if commit.filament_id != id || expected != 0 {
            return Err(invalid(format!(
                "conflict_open for {a} and {b} must be the first commit of {id}"
            )));
        }
        let queue = self.queue(&d.resource_id);
        let (Some(qa), Some(qb)) = (queue.get(a), queue.get(b)) else {
            return Err(invalid(format!(
                "conflict_open names {a} and {b}, which are not both queued on {}",
                d.resource_id
            )));
        };
        let actual = detect_conflict(&qa.entry, &qb.entry).overlap;
        if actual != d.overlap {
            return Err(GraphError::forbidden(
                ErrorCode::NoOverlap,
                format!(
                    "conflict_open claims overlap {:?} but {a} and {b} share {:?}",
                    d.overlap.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    actual.iter().map(ToString::to_string).collect::<Vec<_>>()
                ),
            ));
        }
        Ok(())
    }

    fn admit_conflict_resolve(
        &self,
        commit: &Commit,
        d: &ConflictResolveData,
    ) -> Result<(), GraphError> {
        let Some(record) = self.conflict(&commit.filament_id) else {
            return Err(invalid(format!(
                "conflict_resolve on {} has no conflict_open to settle",
                commit.filament_id
            )));
        };
        if record.is_resolved() {
            return Err(GraphError::forbidden(
                ErrorCode::ConflictSettled,
                format!("{} is already resolved", record.id),
            ));
        }
        let chosen = d.resolution.proposal_id();
        if record.other_party(chosen).is_none() {
            return Err(GraphError::forbidden(
                ErrorCode::NotAParty,
                format!("{chosen} is not a party to {}", record.id),
            ));
        }
        Ok(())
    }

    /// Store commits of `id` followed by the staged ones, in log order.
    fn commits_of(&self, id: &FilamentId) -> Vec<&Commit> {
        self.store
            .filament(id)
            .map(|f| f.commits())
            .unwrap_or_default()
            .iter()
            .chain(self.pending.iter().filter(|c| &c.filament_id == id))
            .collect()
    }

    fn lookup(&self, commit_ref: &CommitRef) -> Option<&Commit> {
        self.store.commit(commit_ref).or_else(|| {
            self.pending.iter().find(|c| {
                c.filament_id == commit_ref.filament_id && c.commit_index == commit_ref.commit_index
            })
        })
    }

    /// Hash of the commit just before `commit_ref` on its filament.
    fn hash_before(&self, commit_ref: &CommitRef) -> String {
        commit_ref
            .commit_index
            .checked_sub(1)
            .and_then(|i| self.lookup(&CommitRef::new(commit_ref.filament_id.clone(), i)))
            .map_or_else(|| GENESIS_HASH.to_string(), |c| c.commit_hash.clone())
    }

    fn queue(&self, resource_id: &ResourceId) -> MergeQueue {
        MergeQueue::from_commits(resource_id, self.commits_of(&resource_id.queue_filament_id()))
    }

    fn queue_of(&self, commit: &Commit) -> Result<MergeQueue, GraphError> {
        commit
            .filament_id
            .queue_resource()
            .map(|r| self.queue(&r))
            .ok_or_else(|| {
                invalid(format!(
                    "{} must land on a queue filament, not {}",
                    commit.operation.tag(),
                    commit.filament_id
                ))
            })
    }

    fn conflict(&self, id: &FilamentId) -> Option<ConflictRecord> {
        ConflictRecord::from_commits(id, self.commits_of(id))
    }
}

fn invalid(detail: String) -> GraphError {
    GraphError::precondition(ErrorCode::InvalidPayload, detail)
}
