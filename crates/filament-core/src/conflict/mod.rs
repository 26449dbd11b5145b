//! Conflict detection and the authority-gated resolution path.
//!
//! Two queued proposals on one resource conflict when their touched loci
//! intersect. A conflict is recorded as its own filament,
//! `conflict:<resource>:<a>+<b>` with the proposal ids sorted, opened by a
//! `conflict_open` commit. The record is permanent; resolving it appends a
//! `conflict_resolve` commit that must carry a valid, non-system
//! [`AuthorityObject`].
//!
//! No code path resolves a conflict on its own. [`check_no_silent_arbitration`]
//! finds overlapping queued pairs that have no record, which is a bug state.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{ErrorCode, GraphError};
use crate::model::{
    AuthorityObject, Commit, CommitRef, ConflictOpenData, ConflictResolveData, FilamentId,
    FilamentKind, ForkData, Locus, OpContext, Operation, ProposalId, ProposalMergeData,
    Resolution, ResourceId, require_authority,
};
use crate::queue::{self, MergeQueue, QueueEntry};
use crate::store::FilamentStore;

/// Result of [`detect_conflict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub overlap: BTreeSet<Locus>,
}

/// Set intersection of the two entries' touched loci.
#[must_use]
pub fn detect_conflict(a: &QueueEntry, b: &QueueEntry) -> ConflictCheck {
    let overlap = a.overlap(b);
    ConflictCheck {
        has_conflict: !overlap.is_empty(),
        overlap,
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub resolution: Resolution,
    pub authority: AuthorityObject,
    pub commit: CommitRef,
}

/// Folded view of one conflict filament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub id: FilamentId,
    pub resource_id: ResourceId,
    /// Sorted.
    pub proposals: (ProposalId, ProposalId),
    pub overlap: BTreeSet<Locus>,
    pub opened: CommitRef,
    pub settlement: Option<Settlement>,
}

impl ConflictRecord {
    /// Fold the conflict filament `id`. `None` when it does not exist or
    /// does not start with `conflict_open`.
    #[must_use]
    pub fn load(store: &FilamentStore, id: &FilamentId) -> Option<Self> {
        Self::from_commits(id, store.filament(id)?.commits())
    }

    /// Fold conflict commits in log order.
    #[must_use]
    pub fn from_commits<'a>(
        id: &FilamentId,
        commits: impl IntoIterator<Item = &'a Commit>,
    ) -> Option<Self> {
        let mut commits = commits.into_iter();
        let first = commits.next()?;
        let Operation::ConflictOpen(open) = &first.operation else {
            return None;
        };
        let mut record = Self {
            id: id.clone(),
            resource_id: open.resource_id.clone(),
            proposals: sorted_pair(&open.proposals.0, &open.proposals.1),
            overlap: open.overlap.clone(),
            opened: first.commit_ref(),
            settlement: None,
        };
        for commit in commits {
            if let Operation::ConflictResolve(d) = &commit.operation {
                record.settlement.get_or_insert_with(|| Settlement {
                    resolution: d.resolution.clone(),
                    authority: d.authority.clone(),
                    commit: commit.commit_ref(),
                });
            }
        }
        Some(record)
    }

    /// Every conflict record in the store, in id order.
    #[must_use]
    pub fn all(store: &FilamentStore) -> Vec<Self> {
        store
            .filaments_of_kind(FilamentKind::Conflict)
            .filter_map(|f| Self::load(store, &f.id))
            .collect()
    }

    /// Conflict records for one resource.
    #[must_use]
    pub fn for_resource(store: &FilamentStore, resource_id: &ResourceId) -> Vec<Self> {
        Self::all(store)
            .into_iter()
            .filter(|c| &c.resource_id == resource_id)
            .collect()
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.settlement.is_some()
    }

    #[must_use]
    pub fn resolution(&self) -> Option<&Resolution> {
        self.settlement.as_ref().map(|s| &s.resolution)
    }

    #[must_use]
    pub fn involves(&self, proposal_id: &ProposalId) -> bool {
        &self.proposals.0 == proposal_id || &self.proposals.1 == proposal_id
    }

    /// The other party, if `proposal_id` is one of the two.
    #[must_use]
    pub fn other_party(&self, proposal_id: &ProposalId) -> Option<&ProposalId> {
        if &self.proposals.0 == proposal_id {
            Some(&self.proposals.1)
        } else if &self.proposals.1 == proposal_id {
            Some(&self.proposals.0)
        } else {
            None
        }
    }
}

fn sorted_pair(a: &ProposalId, b: &ProposalId) -> (ProposalId, ProposalId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Build the `conflict_open` commit for `a` and `b`, or `None` when the
/// record already exists. Disjoint loci are an error, never a no-op.
pub(crate) fn open_commit(
    store: &FilamentStore,
    a: &QueueEntry,
    b: &QueueEntry,
    ctx: &OpContext,
) -> Result<Option<Commit>, GraphError> {
    if a.resource_id != b.resource_id {
        return Err(GraphError::forbidden(
            ErrorCode::NoOverlap,
            format!(
                "{} and {} belong to different resources",
                a.proposal_id, b.proposal_id
            ),
        ));
    }
    let check = detect_conflict(a, b);
    if !check.has_conflict {
        return Err(GraphError::forbidden(
            ErrorCode::NoOverlap,
            format!("{} and {} touch disjoint loci", a.proposal_id, b.proposal_id),
        ));
    }
    let id = a.resource_id.conflict_filament_id(&a.proposal_id, &b.proposal_id);
    if store.filament(&id).is_some() {
        return Ok(None);
    }
    let commit = store.next_commit(
        &id,
        ctx,
        Operation::ConflictOpen(ConflictOpenData {
            resource_id: a.resource_id.clone(),
            proposals: sorted_pair(&a.proposal_id, &b.proposal_id),
            overlap: check.overlap,
        }),
    )?;
    Ok(Some(commit))
}

/// Result of [`create_conflict_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedConflict {
    pub id: FilamentId,
    pub commit: CommitRef,
    /// False when the record already existed.
    pub created: bool,
}

/// Open a conflict record for two overlapping entries. Idempotent.
///
/// # Errors
///
/// [`GraphError::Forbidden`] with [`ErrorCode::NoOverlap`] when the loci
/// do not intersect or the entries are on different resources.
pub fn create_conflict_record(
    store: &mut FilamentStore,
    a: &QueueEntry,
    b: &QueueEntry,
    ctx: &OpContext,
) -> Result<CreatedConflict, GraphError> {
    let id = a.resource_id.conflict_filament_id(&a.proposal_id, &b.proposal_id);
    match open_commit(store, a, b, ctx)? {
        Some(commit) => {
            let commit = store.append(commit)?;
            tracing::info!(conflict = %id, "conflict record opened");
            Ok(CreatedConflict {
                id,
                commit,
                created: true,
            })
        }
        None => Ok(CreatedConflict {
            commit: CommitRef::new(id.clone(), 0),
            id,
            created: false,
        }),
    }
}

/// Result of [`resolve_conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub commit: CommitRef,
    /// Proposal removed from the main queue, if it was still queued.
    pub cancelled: Option<ProposalId>,
    /// Branch filament created by a fork resolution.
    pub fork: Option<FilamentId>,
}

/// Settle a conflict.
///
/// - `select{p}` keeps `p` queued and cancels the other party.
/// - `fork{p}` moves `p` onto a branch filament `<resource>~<p>`: a `fork`
///   commit referencing the proposal's base commit (the resource head when
///   the base is not a resource commit), followed by `p`'s writes. `p` is
///   then cancelled from the main queue.
///
/// Every commit lands in one atomic batch.
///
/// # Errors
///
/// [`GraphError::Forbidden`] when `authority` is missing, invalid or
/// system-attributed, the proposal is not a party, or the conflict is
/// already resolved.
pub fn resolve_conflict(
    store: &mut FilamentStore,
    conflict_id: &FilamentId,
    resolution: Resolution,
    authority: Option<&AuthorityObject>,
    ctx: &OpContext,
) -> Result<Resolved, GraphError> {
    let authority = require_authority(authority, "conflict resolution")?;
    let Some(record) = ConflictRecord::load(store, conflict_id) else {
        return Err(GraphError::precondition(
            ErrorCode::InvalidPayload,
            format!("no conflict record {conflict_id}"),
        ));
    };
    if record.is_resolved() {
        return Err(GraphError::forbidden(
            ErrorCode::ConflictSettled,
            format!("{conflict_id} is already resolved"),
        ));
    }
    let chosen = resolution.proposal_id().clone();
    let Some(other) = record.other_party(&chosen).cloned() else {
        return Err(GraphError::forbidden(
            ErrorCode::NotAParty,
            format!("{chosen} is not a party to {conflict_id}"),
        ));
    };

    let resolve = store
        .next_commit(
            conflict_id,
            ctx,
            Operation::ConflictResolve(ConflictResolveData {
                resolution: resolution.clone(),
                authority: authority.clone(),
            }),
        )?
        .with_input(record.opened.clone());
    let resolve_ref = resolve.commit_ref();
    let mut batch = vec![resolve];

    let resource_id = &record.resource_id;
    let queue = MergeQueue::load(store, resource_id);
    let (cancelled, fork) = match &resolution {
        Resolution::Select { .. } => {
            if queue.get(&other).is_some() {
                let cancel = queue::cancel_commit(store, resource_id, &other, authority, ctx)?;
                batch.push(cancel.with_input(resolve_ref.clone()));
                (Some(other), None)
            } else {
                (None, None)
            }
        }
        Resolution::Fork { .. } => {
            let Some(queued) = queue.get(&chosen) else {
                return Err(GraphError::forbidden(
                    ErrorCode::EntrySettled,
                    format!("{chosen} is no longer queued and cannot be forked"),
                ));
            };
            let fork_id = resource_id.fork_filament_id(&chosen);
            batch.extend(fork_commits(store, &fork_id, &queued.entry, &resolve_ref, ctx)?);
            let cancel = queue::cancel_commit(store, resource_id, &chosen, authority, ctx)?;
            batch.push(cancel.with_input(resolve_ref.clone()));
            (Some(chosen.clone()), Some(fork_id))
        }
    };

    store.append_batch(batch)?;
    tracing::info!(
        conflict = %conflict_id,
        ?resolution,
        by = %authority.actor,
        "conflict resolved"
    );
    Ok(Resolved {
        commit: resolve_ref,
        cancelled,
        fork,
    })
}

fn fork_commits(
    store: &FilamentStore,
    fork_id: &FilamentId,
    entry: &QueueEntry,
    resolve_ref: &CommitRef,
    ctx: &OpContext,
) -> Result<Vec<Commit>, GraphError> {
    if store.filament(fork_id).is_some() {
        return Err(GraphError::precondition(
            ErrorCode::InvalidPayload,
            format!("branch {fork_id} already exists"),
        ));
    }
    let resource_filament = entry.resource_id.filament_id();
    let parent = store
        .commit_by_hash(&entry.base_commit_hash)
        .filter(|c| c.filament_id == resource_filament)
        .or_else(|| store.head(&resource_filament))
        .map(Commit::commit_ref);

    let merge_op = Operation::ProposalMerge(ProposalMergeData {
        proposal_id: entry.proposal_id.clone(),
        task_id: entry.task_id.clone(),
        writes: entry.writes.clone(),
    });

    // An empty resource has no commit to fork from; the branch starts with
    // the proposal's writes.
    let Some(parent) = parent else {
        let merge = Commit::new(fork_id.clone(), 0, ctx, merge_op)?.with_input(resolve_ref.clone());
        return Ok(vec![merge]);
    };

    let fork = Commit::new(
        fork_id.clone(),
        0,
        ctx,
        Operation::Fork(ForkData {
            parent,
            proposal_id: Some(entry.proposal_id.clone()),
        }),
    )?
    .with_input(resolve_ref.clone());
    let merge = Commit::new(fork_id.clone(), 1, ctx, merge_op)?;
    Ok(vec![fork, merge])
}

/// A pair of queued, overlapping proposals with no conflict record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub resource_id: ResourceId,
    pub proposals: (ProposalId, ProposalId),
    pub overlap: BTreeSet<Locus>,
}

/// Every overlapping queued pair in `queue` that lacks a conflict record in
/// `conflicts`. An empty result means no arbitration happened silently.
#[must_use]
pub fn check_no_silent_arbitration(
    queue: &MergeQueue,
    conflicts: &[ConflictRecord],
) -> Vec<Violation> {
    let entries = queue.entries();
    let mut violations = Vec::new();
    for (i, a) in entries.iter().enumerate() {
        for b in &entries[i + 1..] {
            let check = detect_conflict(&a.entry, &b.entry);
            if !check.has_conflict {
                continue;
            }
            let pair = sorted_pair(&a.entry.proposal_id, &b.entry.proposal_id);
            let recorded = conflicts
                .iter()
                .any(|c| c.resource_id == a.entry.resource_id && c.proposals == pair);
            if !recorded {
                violations.push(Violation {
                    resource_id: a.entry.resource_id.clone(),
                    proposals: pair,
                    overlap: check.overlap,
                });
            }
        }
    }
    violations
}
