//! Per-resource merge queues.
//!
//! A queue is not stored separately: it is folded from the resource's
//! `queue:<resource>` filament every time it is needed. Enqueue, merge,
//! cancel and reorder each append one commit there, so a queue rebuilt by
//! replaying the log is the live queue.
//!
//! # Ordering
//!
//! Order is a pure function of queue contents, never of arrival time:
//!
//! ```text
//! (resource_id, pinned rank (pinned entries first, ascending), task_id, proposal_id)
//! ```
//!
//! Pinned ranks come only from an authority-signed reorder. The latest
//! reorder replaces earlier pins.
//!
//! # Merge gate
//!
//! Only the head may merge, only against the resource's current head hash,
//! and only when every overlap with another queued entry has a resolved
//! conflict record that does not favour the other party.

pub mod entry;

pub use entry::QueueEntry;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::conflict::{self, ConflictRecord};
use crate::error::{ErrorCode, GraphError};
use crate::model::{
    AuthorityObject, Commit, CommitRef, FilamentId, OpContext, Operation, ProposalId,
    ProposalMergeData, QueueCancelData, QueueMergeData, QueueReorderData, Resolution, ResourceId,
    require_authority,
};
use crate::store::FilamentStore;

/// One queued proposal plus its position metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedProposal {
    #[serde(flatten)]
    pub entry: QueueEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_rank: Option<usize>,
    /// The `queue_enqueue` commit.
    pub enqueued: CommitRef,
}

impl QueuedProposal {
    fn sort_key(&self) -> (&ResourceId, (u8, usize), &crate::model::TaskId, &ProposalId) {
        let pin = self.pinned_rank.map_or((1, 0), |rank| (0, rank));
        (
            &self.entry.resource_id,
            pin,
            &self.entry.task_id,
            &self.entry.proposal_id,
        )
    }
}

/// Deterministic queue order.
#[must_use]
pub fn queue_order(a: &QueuedProposal, b: &QueuedProposal) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

/// Where a proposal is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Queued,
    Head,
    Merged,
    Cancelled,
}

/// Folded view of one resource's queue filament.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MergeQueue {
    pub resource_id: Option<ResourceId>,
    entries: Vec<QueuedProposal>,
    merged: BTreeMap<ProposalId, CommitRef>,
    cancelled: BTreeSet<ProposalId>,
    pins: Vec<ProposalId>,
}

impl MergeQueue {
    /// Fold the queue filament of `resource_id`. An absent filament is an
    /// empty queue.
    #[must_use]
    pub fn load(store: &FilamentStore, resource_id: &ResourceId) -> Self {
        let commits = store
            .filament(&resource_id.queue_filament_id())
            .map(|f| f.commits())
            .unwrap_or_default();
        Self::from_commits(resource_id, commits)
    }

    /// Fold queue commits in log order.
    #[must_use]
    pub fn from_commits<'a>(
        resource_id: &ResourceId,
        commits: impl IntoIterator<Item = &'a Commit>,
    ) -> Self {
        let mut queue = Self {
            resource_id: Some(resource_id.clone()),
            ..Self::default()
        };
        for commit in commits {
            match &commit.operation {
                Operation::QueueEnqueue(entry) => queue.entries.push(QueuedProposal {
                    entry: entry.clone(),
                    pinned_rank: None,
                    enqueued: commit.commit_ref(),
                }),
                Operation::QueueMerge(d) => {
                    queue.remove(&d.proposal_id);
                    queue.merged.insert(d.proposal_id.clone(), d.merged.clone());
                }
                Operation::QueueCancel(d) => {
                    queue.remove(&d.proposal_id);
                    queue.cancelled.insert(d.proposal_id.clone());
                }
                Operation::QueueReorder(d) => queue.pins.clone_from(&d.order),
                _ => {}
            }
        }
        queue.reorder_entries();
        queue
    }

    fn remove(&mut self, proposal_id: &ProposalId) {
        self.entries.retain(|e| &e.entry.proposal_id != proposal_id);
    }

    fn reorder_entries(&mut self) {
        let ranks: BTreeMap<&ProposalId, usize> =
            self.pins.iter().enumerate().map(|(i, p)| (p, i)).collect();
        for queued in &mut self.entries {
            queued.pinned_rank = ranks.get(&queued.entry.proposal_id).copied();
        }
        self.entries.sort_by(queue_order);
    }

    /// Queued proposals, head first.
    #[must_use]
    pub fn entries(&self) -> &[QueuedProposal] {
        &self.entries
    }

    #[must_use]
    pub fn head(&self) -> Option<&QueuedProposal> {
        self.entries.first()
    }

    #[must_use]
    pub fn get(&self, proposal_id: &ProposalId) -> Option<&QueuedProposal> {
        self.entries
            .iter()
            .find(|e| &e.entry.proposal_id == proposal_id)
    }

    #[must_use]
    pub fn position(&self, proposal_id: &ProposalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.entry.proposal_id == proposal_id)
    }

    /// Commit a merged proposal landed as.
    #[must_use]
    pub fn merged_commit(&self, proposal_id: &ProposalId) -> Option<&CommitRef> {
        self.merged.get(proposal_id)
    }

    #[must_use]
    pub fn state(&self, proposal_id: &ProposalId) -> Option<EntryState> {
        match self.position(proposal_id) {
            Some(0) => Some(EntryState::Head),
            Some(_) => Some(EntryState::Queued),
            None if self.merged.contains_key(proposal_id) => Some(EntryState::Merged),
            None if self.cancelled.contains(proposal_id) => Some(EntryState::Cancelled),
            None => None,
        }
    }

    /// Proposal ids in queue order.
    pub fn proposal_ids(&self) -> impl Iterator<Item = &ProposalId> {
        self.entries.iter().map(|e| &e.entry.proposal_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resource_name(&self) -> &str {
        self.resource_id.as_ref().map_or("", ResourceId::as_str)
    }

    /// Fail unless every proposal in `order` is still queued.
    pub(crate) fn require_queued(&self, order: &[ProposalId]) -> Result<(), GraphError> {
        match order.iter().find(|p| self.get(p).is_none()) {
            Some(missing) => Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("{missing} is not queued on {}", self.resource_name()),
            )),
            None => Ok(()),
        }
    }

    /// Fail unless `proposal_id` is queued and so may still be cancelled.
    pub(crate) fn require_cancellable(&self, proposal_id: &ProposalId) -> Result<(), GraphError> {
        match self.state(proposal_id) {
            Some(EntryState::Queued | EntryState::Head) => Ok(()),
            Some(EntryState::Merged | EntryState::Cancelled) => Err(GraphError::forbidden(
                ErrorCode::EntrySettled,
                format!("{proposal_id} was already merged or cancelled"),
            )),
            None => Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("{proposal_id} is not queued on {}", self.resource_name()),
            )),
        }
    }

    /// Fail unless `proposal_id` is the head.
    pub(crate) fn require_head(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<&QueuedProposal, GraphError> {
        let Some(head) = self.head() else {
            return Err(GraphError::forbidden(
                ErrorCode::NotQueueHead,
                format!("queue for {} is empty", self.resource_name()),
            ));
        };
        if &head.entry.proposal_id == proposal_id {
            return Ok(head);
        }
        let detail = match self.state(proposal_id) {
            Some(EntryState::Merged | EntryState::Cancelled) => {
                format!("{proposal_id} is no longer queued")
            }
            Some(_) => format!("{proposal_id} is not the head; {} is", head.entry.proposal_id),
            None => format!("{proposal_id} is not queued on {}", self.resource_name()),
        };
        Err(GraphError::forbidden(ErrorCode::NotQueueHead, detail))
    }
}

/// Result of [`enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub commit: CommitRef,
    /// Conflict filaments opened against already-queued proposals.
    pub conflicts: Vec<CommitRef>,
}

/// Append `entry` to its resource's queue and open a conflict record for
/// every queued proposal whose loci overlap it. Everything lands in one
/// atomic batch.
///
/// # Errors
///
/// [`GraphError::Precondition`] when the entry is invalid or its proposal
/// id was already used on this resource.
pub fn enqueue(
    store: &mut FilamentStore,
    entry: QueueEntry,
    ctx: &OpContext,
) -> Result<Enqueued, GraphError> {
    entry.validate()?;
    let queue = MergeQueue::load(store, &entry.resource_id);
    if queue.state(&entry.proposal_id).is_some() {
        return Err(GraphError::precondition(
            ErrorCode::InvalidPayload,
            format!(
                "proposal {} was already enqueued on {}",
                entry.proposal_id, entry.resource_id
            ),
        ));
    }

    let queue_id = entry.resource_id.queue_filament_id();
    let enqueue_commit = store.next_commit(&queue_id, ctx, Operation::QueueEnqueue(entry.clone()))?;
    let enqueue_ref = enqueue_commit.commit_ref();

    let mut batch = vec![enqueue_commit];
    for other in queue.entries() {
        if !conflict::detect_conflict(&other.entry, &entry).has_conflict {
            continue;
        }
        if let Some(open) = conflict::open_commit(store, &other.entry, &entry, ctx)? {
            batch.push(open.with_input(enqueue_ref.clone()));
        }
    }

    let mut refs = store.append_batch(batch)?.into_iter();
    let commit = refs.next().ok_or_else(|| {
        GraphError::precondition(ErrorCode::InternalUnexpected, "enqueue batch was empty")
    })?;
    let conflicts: Vec<CommitRef> = refs.collect();

    tracing::info!(
        resource = %entry.resource_id,
        proposal = %entry.proposal_id,
        conflicts = conflicts.len(),
        "proposal enqueued"
    );
    Ok(Enqueued { commit, conflicts })
}

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    /// The `proposal_merge` commit on the resource filament.
    pub resource_commit: CommitRef,
    /// The `queue_merge` commit on the queue filament.
    pub queue_commit: CommitRef,
}

/// Merge the head of `resource_id`'s queue.
///
/// # Errors
///
/// [`GraphError::Forbidden`] when `proposal_id` is not the head
/// ([`ErrorCode::NotQueueHead`]), its base hash is stale
/// ([`ErrorCode::StaleBase`]), or it overlaps another queued proposal
/// without a resolution in its favour
/// ([`ErrorCode::UnarbitratedConflict`]).
pub fn merge(
    store: &mut FilamentStore,
    resource_id: &ResourceId,
    proposal_id: &ProposalId,
    ctx: &OpContext,
) -> Result<Merged, GraphError> {
    let queue = MergeQueue::load(store, resource_id);
    let head = queue.require_head(proposal_id)?;

    let resource_filament = resource_id.filament_id();
    check_base(&head.entry, &store.head_hash(&resource_filament))?;
    for other in queue.entries().iter().skip(1) {
        check_arbitrated(&head.entry, &other.entry, |id| ConflictRecord::load(store, id))?;
    }

    let resource_commit = store
        .next_commit(
            &resource_filament,
            ctx,
            Operation::ProposalMerge(ProposalMergeData {
                proposal_id: proposal_id.clone(),
                task_id: head.entry.task_id.clone(),
                writes: head.entry.writes.clone(),
            }),
        )?
        .with_input(head.enqueued.clone());
    let merged_ref = resource_commit.commit_ref();
    let queue_commit = store.next_commit(
        &resource_id.queue_filament_id(),
        ctx,
        Operation::QueueMerge(QueueMergeData {
            proposal_id: proposal_id.clone(),
            merged: merged_ref.clone(),
        }),
    )?;

    let refs = store.append_batch(vec![resource_commit, queue_commit])?;
    let queue_ref = refs.last().cloned().ok_or_else(|| {
        GraphError::precondition(ErrorCode::InternalUnexpected, "merge batch was empty")
    })?;

    tracing::info!(
        resource = %resource_id,
        proposal = %proposal_id,
        commit = %merged_ref,
        "proposal merged"
    );
    Ok(Merged {
        resource_commit: merged_ref,
        queue_commit: queue_ref,
    })
}

/// Fail unless `entry` was made against `head_hash`.
pub(crate) fn check_base(entry: &QueueEntry, head_hash: &str) -> Result<(), GraphError> {
    if entry.base_commit_hash == head_hash {
        return Ok(());
    }
    Err(GraphError::forbidden(
        ErrorCode::StaleBase,
        format!(
            "{} was made against {} but {} is at {head_hash}",
            entry.proposal_id, entry.base_commit_hash, entry.resource_id
        ),
    ))
}

/// Fail unless every overlap between `candidate` and `other` is settled in
/// `candidate`'s favour. `record` looks up a conflict filament.
pub(crate) fn check_arbitrated(
    candidate: &QueueEntry,
    other: &QueueEntry,
    record: impl FnOnce(&FilamentId) -> Option<ConflictRecord>,
) -> Result<(), GraphError> {
    let check = conflict::detect_conflict(candidate, other);
    if !check.has_conflict {
        return Ok(());
    }
    let conflict_id = candidate
        .resource_id
        .conflict_filament_id(&candidate.proposal_id, &other.proposal_id);
    let Some(record) = record(&conflict_id) else {
        return Err(GraphError::forbidden(
            ErrorCode::UnarbitratedConflict,
            format!(
                "{} overlaps {} on {:?} and no conflict record exists",
                candidate.proposal_id,
                other.proposal_id,
                check.overlap.iter().map(ToString::to_string).collect::<Vec<_>>()
            ),
        ));
    };
    match record.resolution() {
        None => Err(GraphError::forbidden(
            ErrorCode::UnarbitratedConflict,
            format!("conflict {conflict_id} is unresolved"),
        )),
        Some(Resolution::Select { proposal_id }) if proposal_id == &candidate.proposal_id => {
            Ok(())
        }
        Some(resolution) => Err(GraphError::forbidden(
            ErrorCode::UnarbitratedConflict,
            format!(
                "conflict {conflict_id} was resolved as {resolution:?}, not in favour of {}",
                candidate.proposal_id
            ),
        )),
    }
}

/// Pin `order` to the front of the queue. Requires authority.
///
/// # Errors
///
/// [`GraphError::Forbidden`] without valid authority;
/// [`GraphError::Precondition`] if `order` names a proposal that is not
/// queued.
pub fn reorder(
    store: &mut FilamentStore,
    resource_id: &ResourceId,
    order: Vec<ProposalId>,
    authority: Option<&AuthorityObject>,
    ctx: &OpContext,
) -> Result<CommitRef, GraphError> {
    let authority = require_authority(authority, "queue reorder")?;
    MergeQueue::load(store, resource_id).require_queued(&order)?;

    let commit = store.next_commit(
        &resource_id.queue_filament_id(),
        ctx,
        Operation::QueueReorder(QueueReorderData {
            order,
            authority: authority.clone(),
        }),
    )?;
    let commit_ref = store.append(commit)?;
    tracing::info!(resource = %resource_id, by = %authority.actor, "queue reordered");
    Ok(commit_ref)
}

/// Remove a not-yet-merged proposal from the queue. Requires authority.
///
/// # Errors
///
/// [`GraphError::Forbidden`] without valid authority or when the proposal
/// was already merged or cancelled.
pub fn cancel(
    store: &mut FilamentStore,
    resource_id: &ResourceId,
    proposal_id: &ProposalId,
    authority: Option<&AuthorityObject>,
    ctx: &OpContext,
) -> Result<CommitRef, GraphError> {
    let authority = require_authority(authority, "queue cancel")?;
    let commit = cancel_commit(store, resource_id, proposal_id, authority, ctx)?;
    let commit_ref = store.append(commit)?;
    tracing::info!(
        resource = %resource_id,
        proposal = %proposal_id,
        by = %authority.actor,
        "proposal cancelled"
    );
    Ok(commit_ref)
}

/// Build (but do not append) the cancel commit for a queued proposal.
pub(crate) fn cancel_commit(
    store: &FilamentStore,
    resource_id: &ResourceId,
    proposal_id: &ProposalId,
    authority: &AuthorityObject,
    ctx: &OpContext,
) -> Result<Commit, GraphError> {
    MergeQueue::load(store, resource_id).require_cancellable(proposal_id)?;
    store.next_commit(
        &resource_id.queue_filament_id(),
        ctx,
        Operation::QueueCancel(QueueCancelData {
            proposal_id: proposal_id.clone(),
            authority: authority.clone(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, Locus, TaskId};
    use crate::store::GENESIS_HASH;
    use serde_json::json;

    fn ctx() -> OpContext {
        OpContext::new(Actor::agent("planner"), 10)
    }

    fn human() -> AuthorityObject {
        AuthorityObject::new(Actor::human("lead"), "priority call", vec!["sig:lead".into()])
    }

    fn res() -> ResourceId {
        ResourceId::new_unchecked("example")
    }

    fn pid(s: &str) -> ProposalId {
        ProposalId::new_unchecked(s)
    }

    fn entry(proposal: &str, task: &str, loci: &[&str], base: &str) -> QueueEntry {
        QueueEntry::new(
            res(),
            pid(proposal),
            TaskId::new_unchecked(task),
            "agent-1",
            Some(base.to_string()),
            loci.iter().map(|l| Locus::new_unchecked(*l)),
        )
        .expect("entry")
        .with_writes(BTreeMap::from([(format!("{proposal}.done"), json!(true))]))
    }

    fn ids(queue: &MergeQueue) -> Vec<&str> {
        queue.proposal_ids().map(ProposalId::as_str).collect()
    }

    #[test]
    fn order_ignores_arrival() {
        let mut store = FilamentStore::new();
        for (p, t) in [("pc", "task-C"), ("pa", "task-A"), ("pb", "task-B")] {
            enqueue(&mut store, entry(p, t, &[p], GENESIS_HASH), &ctx()).expect("enqueue");
        }
        assert_eq!(ids(&MergeQueue::load(&store, &res())), ["pa", "pb", "pc"]);
    }

    #[test]
    fn duplicate_proposal_rejected() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("p1", "t", &["A1"], GENESIS_HASH), &ctx()).expect("enqueue");
        let err = enqueue(&mut store, entry("p1", "t", &["B1"], GENESIS_HASH), &ctx())
            .expect_err("duplicate");
        assert!(matches!(err, GraphError::Precondition { .. }));
    }

    #[test]
    fn non_head_merge_forbidden() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("pa", "task-A", &["A1"], GENESIS_HASH), &ctx()).expect("a");
        enqueue(&mut store, entry("pb", "task-B", &["B1"], GENESIS_HASH), &ctx()).expect("b");
        let err = merge(&mut store, &res(), &pid("pb"), &ctx()).expect_err("not head");
        assert_eq!(err.code(), ErrorCode::NotQueueHead);
        assert!(err.is_forbidden());
    }

    #[test]
    fn head_merges_then_next_is_stale() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("pa", "task-A", &["A1"], GENESIS_HASH), &ctx()).expect("a");
        enqueue(&mut store, entry("pb", "task-B", &["B1"], GENESIS_HASH), &ctx()).expect("b");

        let merged = merge(&mut store, &res(), &pid("pa"), &ctx()).expect("merge head");
        assert_eq!(merged.resource_commit.to_string(), "example@0");
        let queue = MergeQueue::load(&store, &res());
        assert_eq!(ids(&queue), ["pb"]);
        assert_eq!(queue.state(&pid("pa")), Some(EntryState::Merged));
        assert_eq!(
            store.live_state(&res().filament_id()).and_then(|s| s.get("pa.done")),
            Some(&json!(true))
        );

        let err = merge(&mut store, &res(), &pid("pb"), &ctx()).expect_err("stale");
        assert_eq!(err.code(), ErrorCode::StaleBase);
    }

    #[test]
    fn failed_merge_appends_nothing() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("pa", "task-A", &["A1"], "blake3:old"), &ctx()).expect("a");
        let before = store.len();
        assert!(merge(&mut store, &res(), &pid("pa"), &ctx()).is_err());
        assert_eq!(store.len(), before);
    }

    #[test]
    fn reorder_and_cancel_require_authority() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("pa", "task-A", &["A1"], GENESIS_HASH), &ctx()).expect("a");
        enqueue(&mut store, entry("pb", "task-B", &["B1"], GENESIS_HASH), &ctx()).expect("b");

        let err = reorder(&mut store, &res(), vec![pid("pb")], None, &ctx()).expect_err("none");
        assert_eq!(err.code(), ErrorCode::MissingAuthority);
        let bot = AuthorityObject::new(Actor::system("sched"), "load", vec!["sig".into()]);
        let err = cancel(&mut store, &res(), &pid("pa"), Some(&bot), &ctx()).expect_err("system");
        assert_eq!(err.code(), ErrorCode::SystemAuthority);

        reorder(&mut store, &res(), vec![pid("pb")], Some(&human()), &ctx()).expect("reorder");
        let queue = MergeQueue::load(&store, &res());
        assert_eq!(ids(&queue), ["pb", "pa"]);
        assert_eq!(queue.head().and_then(|h| h.pinned_rank), Some(0));

        cancel(&mut store, &res(), &pid("pb"), Some(&human()), &ctx()).expect("cancel");
        let queue = MergeQueue::load(&store, &res());
        assert_eq!(ids(&queue), ["pa"]);
        assert_eq!(queue.state(&pid("pb")), Some(EntryState::Cancelled));

        let err = cancel(&mut store, &res(), &pid("pb"), Some(&human()), &ctx())
            .expect_err("already cancelled");
        assert_eq!(err.code(), ErrorCode::EntrySettled);
    }

    #[test]
    fn merged_entry_cannot_be_cancelled() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("pa", "task-A", &["A1"], GENESIS_HASH), &ctx()).expect("a");
        merge(&mut store, &res(), &pid("pa"), &ctx()).expect("merge");
        let err = cancel(&mut store, &res(), &pid("pa"), Some(&human()), &ctx())
            .expect_err("merged");
        assert_eq!(err.code(), ErrorCode::EntrySettled);
    }

    #[test]
    fn overlapping_enqueue_opens_conflict_and_blocks_merge() {
        let mut store = FilamentStore::new();
        enqueue(&mut store, entry("pa", "task-A", &["A1", "B1"], GENESIS_HASH), &ctx())
            .expect("a");
        let second = enqueue(
            &mut store,
            entry("pb", "task-B", &["B1", "C1"], GENESIS_HASH),
            &ctx(),
        )
        .expect("b");
        assert_eq!(second.conflicts.len(), 1);

        let err = merge(&mut store, &res(), &pid("pa"), &ctx()).expect_err("unresolved");
        assert_eq!(err.code(), ErrorCode::UnarbitratedConflict);
    }
}
