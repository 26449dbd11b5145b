//! The append-only filament store.
//!
//! # Invariants
//!
//! - `commit_index` equals the filament length at append time (no gaps, no
//!   duplicates).
//! - Every ref resolves to a commit that is already in the store, or to an
//!   earlier commit of the same batch. Refs never point forward.
//! - Commits are never mutated or removed. The only mutation is append.
//! - A failed append leaves the store byte-for-byte unchanged: the whole
//!   batch is validated against a staging view before anything is written.
//! - Queue and conflict commits obey the merge-queue rules whoever appends
//!   them (see `admit`).
//!
//! Alongside the log the store keeps a *live* projection of every filament
//! that carries state writes, updated incrementally on append. Replay
//! recomputes the same state from the log alone and compares the two.
//!
//! The store is an ordinary value. Construct as many as you like; nothing is
//! global.

mod admit;
pub mod verify;

pub use verify::{IntegrityProblem, IntegrityReport};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::{ErrorCode, GraphError};
use crate::model::{
    Commit, CommitRef, Filament, FilamentId, FilamentKind, OpContext, Operation, Snapshot,
};

/// Head hash reported for a filament with no commits.
pub const GENESIS_HASH: &str = "genesis";

#[derive(Debug, Clone, Default)]
pub struct FilamentStore {
    filaments: BTreeMap<FilamentId, Filament>,
    by_hash: HashMap<String, CommitRef>,
    live: BTreeMap<FilamentId, Snapshot>,
    /// Every commit address in the order it was appended.
    sequence: Vec<CommitRef>,
}

impl FilamentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one commit.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Sequence`] when `commit_index` is not the
    /// filament's next index, [`GraphError::Causality`] when a ref does not
    /// resolve to an earlier commit, or the payload validation error.
    pub fn append(&mut self, commit: Commit) -> Result<CommitRef, GraphError> {
        let mut refs = self.append_batch(vec![commit])?;
        refs.pop().ok_or_else(|| {
            GraphError::precondition(ErrorCode::InternalUnexpected, "empty append result")
        })
    }

    /// Append several commits atomically: either all land or none do.
    ///
    /// Later commits may ref earlier commits of the same batch.
    ///
    /// # Errors
    ///
    /// Same as [`FilamentStore::append`], for the first offending commit.
    pub fn append_batch(&mut self, commits: Vec<Commit>) -> Result<Vec<CommitRef>, GraphError> {
        let mut staging = Staging::new(self);
        for commit in commits {
            staging.stage(commit)?;
        }
        let Staging { pending, kinds, .. } = staging;

        let mut appended = Vec::new();
        for commit in pending {
            let commit_ref = commit.commit_ref();
            tracing::debug!(
                commit = %commit_ref,
                op = commit.operation.tag(),
                hash = %commit.commit_hash,
                "appended commit"
            );
            self.by_hash
                .insert(commit.commit_hash.clone(), commit_ref.clone());
            if let Some(writes) = commit.operation.writes() {
                let live = self.live.entry(commit.filament_id.clone()).or_default();
                for (key, value) in writes {
                    live.insert(key.clone(), value.clone());
                }
            }
            let filament = self
                .filaments
                .entry(commit.filament_id.clone())
                .or_insert_with(|| Filament {
                    id: commit.filament_id.clone(),
                    kind: kinds
                        .get(&commit.filament_id)
                        .copied()
                        .unwrap_or(FilamentKind::Resource),
                    commits: Vec::new(),
                });
            filament.commits.push(commit);
            self.sequence.push(commit_ref.clone());
            appended.push(commit_ref);
        }
        Ok(appended)
    }

    /// Build a commit addressed at the next index of `filament_id`.
    ///
    /// # Errors
    ///
    /// Returns the payload validation error from [`Commit::new`].
    pub fn next_commit(
        &self,
        filament_id: &FilamentId,
        ctx: &OpContext,
        operation: Operation,
    ) -> Result<Commit, GraphError> {
        Commit::new(filament_id.clone(), self.next_index(filament_id), ctx, operation)
    }

    /// Inclusive range read. Out-of-range bounds are clamped; an inverted or
    /// empty range yields an empty slice.
    #[must_use]
    pub fn get_commits(&self, filament_id: &FilamentId, from: u64, to: u64) -> &[Commit] {
        let Some(filament) = self.filaments.get(filament_id) else {
            return &[];
        };
        let len = filament.commits.len();
        let (Ok(from), Ok(to)) = (usize::try_from(from), usize::try_from(to)) else {
            return &[];
        };
        if from >= len || from > to {
            return &[];
        }
        &filament.commits[from..=to.min(len - 1)]
    }

    /// Live state of a filament, maintained incrementally on append.
    #[must_use]
    pub fn live_state(&self, filament_id: &FilamentId) -> Option<&Snapshot> {
        self.live.get(filament_id)
    }

    #[must_use]
    pub fn filament(&self, filament_id: &FilamentId) -> Option<&Filament> {
        self.filaments.get(filament_id)
    }

    pub fn filaments(&self) -> impl Iterator<Item = &Filament> {
        self.filaments.values()
    }

    pub fn filaments_of_kind(&self, kind: FilamentKind) -> impl Iterator<Item = &Filament> {
        self.filaments.values().filter(move |f| f.kind == kind)
    }

    /// All commits, filament by filament in id order.
    pub fn all_commits(&self) -> impl Iterator<Item = &Commit> {
        self.filaments.values().flat_map(|f| f.commits.iter())
    }

    #[must_use]
    pub fn commit(&self, commit_ref: &CommitRef) -> Option<&Commit> {
        let index = usize::try_from(commit_ref.commit_index).ok()?;
        self.filaments
            .get(&commit_ref.filament_id)?
            .commits
            .get(index)
    }

    #[must_use]
    pub fn commit_by_hash(&self, hash: &str) -> Option<&Commit> {
        self.by_hash.get(hash).and_then(|r| self.commit(r))
    }

    #[must_use]
    pub fn head(&self, filament_id: &FilamentId) -> Option<&Commit> {
        self.filaments.get(filament_id).and_then(Filament::head)
    }

    /// Hash of the filament's latest commit, or [`GENESIS_HASH`] when empty.
    #[must_use]
    pub fn head_hash(&self, filament_id: &FilamentId) -> String {
        self.head(filament_id)
            .map_or_else(|| GENESIS_HASH.to_string(), |c| c.commit_hash.clone())
    }

    #[must_use]
    pub fn next_index(&self, filament_id: &FilamentId) -> u64 {
        self.filaments
            .get(filament_id)
            .map_or(0, Filament::next_index)
    }

    #[must_use]
    pub fn contains(&self, commit_ref: &CommitRef) -> bool {
        commit_ref.commit_index < self.next_index(&commit_ref.filament_id)
    }

    /// Commits appended after the first `mark`, in append order.
    ///
    /// `mark` is a previous [`FilamentStore::len`]; persisting these commits
    /// in this order keeps every ref pointing backwards.
    pub fn appended_since(&self, mark: usize) -> impl Iterator<Item = &Commit> {
        self.sequence
            .iter()
            .skip(mark)
            .filter_map(|r| self.commit(r))
    }

    /// Total number of commits across all filaments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Every commit reachable from `start` by following refs backwards,
    /// excluding `start` itself. Sorted by address.
    #[must_use]
    pub fn ancestors(&self, start: &CommitRef) -> Vec<CommitRef> {
        let mut seen: BTreeSet<CommitRef> = BTreeSet::new();
        let mut queue: VecDeque<CommitRef> = VecDeque::from([start.clone()]);

        while let Some(current) = queue.pop_front() {
            let Some(commit) = self.commit(&current) else {
                continue;
            };
            let previous = current
                .commit_index
                .checked_sub(1)
                .map(|i| CommitRef::new(current.filament_id.clone(), i));
            for next in commit.all_refs().cloned().chain(previous) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen.into_iter().collect()
    }
}

/// Validation view of the store plus the commits staged so far in a batch.
struct Staging<'a> {
    store: &'a FilamentStore,
    pending: Vec<Commit>,
    pending_len: BTreeMap<FilamentId, u64>,
    kinds: BTreeMap<FilamentId, FilamentKind>,
}

impl<'a> Staging<'a> {
    fn new(store: &'a FilamentStore) -> Self {
        Self {
            store,
            pending: Vec::new(),
            pending_len: BTreeMap::new(),
            kinds: BTreeMap::new(),
        }
    }

    fn len_of(&self, filament_id: &FilamentId) -> u64 {
        self.store.next_index(filament_id) + self.pending_len.get(filament_id).copied().unwrap_or(0)
    }

    fn kind_of(&self, filament_id: &FilamentId) -> Option<FilamentKind> {
        self.store
            .filament(filament_id)
            .map(|f| f.kind)
            .or_else(|| self.kinds.get(filament_id).copied())
    }

    fn stage(&mut self, mut commit: Commit) -> Result<(), GraphError> {
        commit.operation.validate()?;

        let expected = self.len_of(&commit.filament_id);
        if commit.commit_index != expected {
            let code = if commit.commit_index < expected {
                ErrorCode::DuplicateCommitIndex
            } else {
                ErrorCode::CommitIndexGap
            };
            return Err(GraphError::Sequence {
                code,
                filament: commit.filament_id.clone(),
                expected,
                got: commit.commit_index,
            });
        }

        for target in commit.all_refs() {
            let same_filament = target.filament_id == commit.filament_id;
            let target_len = self.len_of(&target.filament_id);
            let resolved = if same_filament {
                target.commit_index < commit.commit_index
            } else {
                target.commit_index < target_len
            };
            if resolved {
                continue;
            }
            let (code, detail) = if same_filament || target_len > 0 {
                (ErrorCode::ForwardRef, "ref points at or past the commit being appended")
            } else {
                (ErrorCode::DanglingRef, "ref names a filament that does not exist")
            };
            return Err(GraphError::Causality {
                code,
                commit: commit.commit_ref().to_string(),
                target: target.clone(),
                detail,
            });
        }

        let kind = self.admit(&commit, expected)?;
        if expected == 0 {
            self.kinds.insert(commit.filament_id.clone(), kind);
        }

        commit.commit_hash = commit.compute_hash().map_err(|e| {
            GraphError::precondition(ErrorCode::InvalidPayload, format!("unhashable commit: {e}"))
        })?;
        *self
            .pending_len
            .entry(commit.filament_id.clone())
            .or_insert(0) += 1;
        self.pending.push(commit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, ForkData, StateWriteData};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx() -> OpContext {
        OpContext::new(Actor::human("alice"), 1_000)
    }

    fn fid(s: &str) -> FilamentId {
        FilamentId::new_unchecked(s)
    }

    fn write(filament: &str, index: u64, key: &str, value: serde_json::Value) -> Commit {
        Commit::new(
            fid(filament),
            index,
            &ctx(),
            Operation::StateWrite(StateWriteData {
                writes: BTreeMap::from([(key.to_string(), value)]),
            }),
        )
        .expect("valid commit")
    }

    #[test]
    fn append_creates_filament_and_stamps_hash() {
        let mut store = FilamentStore::new();
        let r = store.append(write("doc", 0, "title", json!("a"))).expect("append");
        assert_eq!(r.to_string(), "doc@0");
        let f = store.filament(&fid("doc")).expect("filament");
        assert_eq!(f.kind, FilamentKind::Resource);
        assert!(f.commits()[0].commit_hash.starts_with("blake3:"));
        assert_eq!(store.head_hash(&fid("doc")), f.commits()[0].commit_hash);
    }

    #[test]
    fn gap_and_duplicate_are_sequence_errors() {
        let mut store = FilamentStore::new();
        let err = store.append(write("doc", 1, "k", json!(1))).expect_err("gap");
        assert!(matches!(
            err,
            GraphError::Sequence { code: ErrorCode::CommitIndexGap, expected: 0, got: 1, .. }
        ));

        store.append(write("doc", 0, "k", json!(1))).expect("append");
        let err = store.append(write("doc", 0, "k", json!(2))).expect_err("duplicate");
        assert!(matches!(
            err,
            GraphError::Sequence { code: ErrorCode::DuplicateCommitIndex, .. }
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn dangling_and_forward_refs_are_causality_errors() {
        let mut store = FilamentStore::new();
        let dangling = write("doc", 0, "k", json!(1)).with_input(CommitRef::new(fid("nope"), 0));
        assert!(matches!(
            store.append(dangling).expect_err("dangling"),
            GraphError::Causality { code: ErrorCode::DanglingRef, .. }
        ));

        store.append(write("spec", 0, "k", json!(1))).expect("append");
        let forward = write("doc", 0, "k", json!(1)).with_input(CommitRef::new(fid("spec"), 1));
        assert!(matches!(
            store.append(forward).expect_err("forward"),
            GraphError::Causality { code: ErrorCode::ForwardRef, .. }
        ));

        let self_ref = write("doc", 0, "k", json!(1)).with_input(CommitRef::new(fid("doc"), 0));
        assert!(matches!(
            store.append(self_ref).expect_err("self"),
            GraphError::Causality { code: ErrorCode::ForwardRef, .. }
        ));
        assert!(store.filament(&fid("doc")).is_none());
    }

    #[test]
    fn failed_batch_leaves_store_unchanged() {
        let mut store = FilamentStore::new();
        store.append(write("doc", 0, "k", json!(1))).expect("append");
        let before = store.head_hash(&fid("doc"));

        let batch = vec![
            write("doc", 1, "k", json!(2)),
            write("other", 0, "k", json!(3)),
            write("doc", 5, "k", json!(4)),
        ];
        assert!(store.append_batch(batch).is_err());
        assert_eq!(store.len(), 1);
        assert_eq!(store.head_hash(&fid("doc")), before);
        assert!(store.filament(&fid("other")).is_none());
    }

    #[test]
    fn batch_may_ref_its_own_earlier_commits() {
        let mut store = FilamentStore::new();
        let batch = vec![
            write("a", 0, "k", json!(1)),
            write("b", 0, "k", json!(2)).with_input(CommitRef::new(fid("a"), 0)),
        ];
        let refs = store.append_batch(batch).expect("batch");
        assert_eq!(refs.len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn fork_inherits_parent_kind_and_parent_is_untouched() {
        let mut store = FilamentStore::new();
        store.append(write("doc", 0, "k", json!(1))).expect("append");
        let fork = Commit::new(
            fid("doc~p1"),
            0,
            &ctx(),
            Operation::Fork(ForkData {
                parent: CommitRef::new(fid("doc"), 0),
                proposal_id: None,
            }),
        )
        .expect("fork");
        store.append(fork).expect("append fork");
        assert_eq!(
            store.filament(&fid("doc~p1")).expect("fork").kind,
            FilamentKind::Resource
        );
        assert_eq!(store.filament(&fid("doc")).expect("doc").len(), 1);
    }

    #[test]
    fn get_commits_is_inclusive_and_clamped() {
        let mut store = FilamentStore::new();
        for i in 0..5 {
            store.append(write("doc", i, "k", json!(i))).expect("append");
        }
        assert_eq!(store.get_commits(&fid("doc"), 1, 3).len(), 3);
        assert_eq!(store.get_commits(&fid("doc"), 3, 99).len(), 2);
        assert!(store.get_commits(&fid("doc"), 4, 2).is_empty());
        assert!(store.get_commits(&fid("missing"), 0, 10).is_empty());
    }

    #[test]
    fn ancestors_follow_refs_and_predecessors() {
        let mut store = FilamentStore::new();
        store.append(write("spec", 0, "k", json!(1))).expect("append");
        store.append(write("doc", 0, "k", json!(1))).expect("append");
        store
            .append(write("doc", 1, "k", json!(2)).with_input(CommitRef::new(fid("spec"), 0)))
            .expect("append");
        let ancestors = store.ancestors(&CommitRef::new(fid("doc"), 1));
        assert_eq!(
            ancestors,
            vec![CommitRef::new(fid("doc"), 0), CommitRef::new(fid("spec"), 0)]
        );
    }

    #[test]
    fn live_state_tracks_writes() {
        let mut store = FilamentStore::new();
        store.append(write("doc", 0, "title", json!("a"))).expect("append");
        store.append(write("doc", 1, "title", json!("b"))).expect("append");
        store.append(write("doc", 2, "owner", json!("bob"))).expect("append");
        let live = store.live_state(&fid("doc")).expect("live");
        assert_eq!(live.get("title"), Some(&json!("b")));
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn appended_since_keeps_append_order() {
        let mut store = FilamentStore::new();
        store.append(write("zeta", 0, "k", json!(1))).expect("append");
        let mark = store.len();
        store.append(write("zeta", 1, "k", json!(2))).expect("append");
        store
            .append(write("alpha", 0, "k", json!(3)).with_input(CommitRef::new(fid("zeta"), 1)))
            .expect("append");
        let order: Vec<String> = store
            .appended_since(mark)
            .map(|c| c.commit_ref().to_string())
            .collect();
        assert_eq!(order, vec!["zeta@1", "alpha@0"]);
    }

    #[test]
    fn commit_by_hash_round_trips() {
        let mut store = FilamentStore::new();
        store.append(write("doc", 0, "k", json!(1))).expect("append");
        let hash = store.head_hash(&fid("doc"));
        assert_eq!(
            store.commit_by_hash(&hash).map(Commit::commit_ref),
            Some(CommitRef::new(fid("doc"), 0))
        );
        assert_eq!(store.head_hash(&fid("empty")), GENESIS_HASH);
    }
}
