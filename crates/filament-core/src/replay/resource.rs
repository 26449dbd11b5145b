//! Resource-level replay.
//!
//! Folds a filament's commits into a key → value map, canonicalizes and
//! hashes it, and compares that against the hash of the live snapshot
//! restricted to the same keys. The comparison is a pure function of
//! `(commits, index, range, live)`.
//!
//! A replay over a narrowed range is compared with the live state as of the
//! same cut ([`live_for_range`]), never with a projection that already
//! holds later writes.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use crate::canon::{Blake3Digest, ContentDigest, canonicalize};
use crate::index::{CommitIndexMap, CommitRange, Exclusion, filter_range};
use crate::model::{Commit, FilamentId, Snapshot};
use crate::store::FilamentStore;

/// Outcome of comparing replayed state against live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayStatus {
    Match,
    /// The named keys differ between replayed and live state.
    Divergence { keys: Vec<String> },
}

impl ReplayStatus {
    #[must_use]
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceReplay {
    pub status: ReplayStatus,
    /// Canonical replayed state.
    pub state: Snapshot,
    pub replay_hash: String,
    pub live_hash: String,
    /// Commits folded into `state`.
    pub applied: usize,
    /// Commits left out of a narrowed range because they had no global index.
    pub excluded: Vec<Exclusion>,
}

/// Fold commits into state, last write wins in `commit_index` order.
///
/// Values are canonicalized as they are folded. Commits that carry no state
/// writes are skipped.
#[must_use]
pub fn fold_state<'a>(commits: impl IntoIterator<Item = &'a Commit>) -> Snapshot {
    let mut ordered: Vec<&Commit> = commits.into_iter().collect();
    ordered.sort_by(|a, b| {
        a.commit_index
            .cmp(&b.commit_index)
            .then_with(|| a.filament_id.cmp(&b.filament_id))
    });

    let mut state = Snapshot::new();
    for commit in ordered {
        if let Some(writes) = commit.operation.writes() {
            for (key, value) in writes {
                state.insert(key.clone(), canonicalize(value));
            }
        }
    }
    state
}

/// Replay with the default BLAKE3 digest.
#[must_use]
pub fn replay_resource<'a>(
    commits: impl IntoIterator<Item = &'a Commit>,
    index: &CommitIndexMap,
    range: CommitRange,
    live: &Snapshot,
) -> ResourceReplay {
    replay_resource_with(commits, index, range, live, &Blake3Digest)
}

/// Replay with an explicit digest.
#[must_use]
pub fn replay_resource_with<'a>(
    commits: impl IntoIterator<Item = &'a Commit>,
    index: &CommitIndexMap,
    range: CommitRange,
    live: &Snapshot,
    digest: &dyn ContentDigest,
) -> ResourceReplay {
    let filtered = filter_range(commits, index, range);
    let applied = filtered
        .included
        .iter()
        .filter(|c| c.operation.writes().is_some())
        .count();
    let state = fold_state(filtered.included.iter().copied());

    let restricted = restrict(live, state.keys());
    let replay_hash = digest.hash_value(&to_object(&state));
    let live_hash = digest.hash_value(&to_object(&restricted));

    let status = if replay_hash == live_hash {
        ReplayStatus::Match
    } else {
        ReplayStatus::Divergence {
            keys: differing_keys(&state, &restricted),
        }
    };

    ResourceReplay {
        status,
        state,
        replay_hash,
        live_hash,
        applied,
        excluded: filtered.excluded,
    }
}

/// Replay one filament of `store` against a caller-supplied live snapshot.
#[must_use]
pub fn replay_filament(
    store: &FilamentStore,
    filament_id: &FilamentId,
    index: &CommitIndexMap,
    range: CommitRange,
    live: &Snapshot,
) -> ResourceReplay {
    let commits = store
        .filament(filament_id)
        .map(|f| f.commits())
        .unwrap_or_default();
    replay_resource(commits, index, range, live)
}

/// The live side a replay of `filament_id` over `range` is compared with.
///
/// For the full range this is the store's live projection. A narrowed
/// range is limited to the keys written inside it, and when the range stops
/// before the latest commit the state is taken as of `range.to`: every
/// indexed commit up to the cut, folded. Unindexed commits are left out,
/// exactly as the narrowed replay leaves them out.
#[must_use]
pub fn live_for_range<'s>(
    store: &'s FilamentStore,
    filament_id: &FilamentId,
    index: &CommitIndexMap,
    range: CommitRange,
) -> Cow<'s, Snapshot> {
    let live = store.live_state(filament_id);
    if range.is_full(index) {
        return live.map_or_else(|| Cow::Owned(Snapshot::new()), Cow::Borrowed);
    }

    let commits = store
        .filament(filament_id)
        .map(|f| f.commits())
        .unwrap_or_default();
    let position = |c: &Commit| index.get(&c.commit_hash);
    let mut state = if range.ends_before(index) {
        fold_state(
            commits
                .iter()
                .filter(|c| position(c).is_some_and(|p| p <= range.to)),
        )
    } else {
        live.cloned().unwrap_or_default()
    };
    let written: BTreeSet<&str> = commits
        .iter()
        .filter(|c| position(c).is_some_and(|p| range.contains(p)))
        .filter_map(|c| c.operation.writes())
        .flat_map(|w| w.keys().map(String::as_str))
        .collect();
    state.retain(|key, _| written.contains(key.as_str()));
    Cow::Owned(state)
}

/// Canonical live state restricted to `keys`. Keys absent from `live`
/// appear as `null`, so an explicit `null` write and a missing key compare
/// equal: both mean "no value".
fn restrict<'a>(live: &Snapshot, keys: impl Iterator<Item = &'a String>) -> Snapshot {
    keys.map(|key| {
        let value = live.get(key).map_or(Value::Null, canonicalize);
        (key.clone(), value)
    })
    .collect()
}

fn differing_keys(replayed: &Snapshot, live: &Snapshot) -> Vec<String> {
    let keys: BTreeSet<&String> = replayed.keys().chain(live.keys()).collect();
    keys.into_iter()
        .filter(|k| replayed.get(*k) != live.get(*k))
        .cloned()
        .collect()
}

fn to_object(state: &Snapshot) -> Value {
    Value::Object(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::build_index;
    use crate::model::{Actor, OpContext, Operation, StateWriteData};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn store_with(writes: &[(&str, Value)]) -> FilamentStore {
        let mut store = FilamentStore::new();
        let id = FilamentId::new_unchecked("doc");
        for (i, (key, value)) in writes.iter().enumerate() {
            let ctx = OpContext::new(Actor::agent("bot"), 100 + i as i64);
            let commit = store
                .next_commit(
                    &id,
                    &ctx,
                    Operation::StateWrite(StateWriteData {
                        writes: BTreeMap::from([((*key).to_string(), value.clone())]),
                    }),
                )
                .expect("commit");
            store.append(commit).expect("append");
        }
        store
    }

    fn doc() -> FilamentId {
        FilamentId::new_unchecked("doc")
    }

    #[test]
    fn live_projection_matches_replay() {
        let store = store_with(&[("a", json!(1)), ("b", json!("x")), ("a", json!(2.5))]);
        let index = build_index(store.all_commits());
        let live = store.live_state(&doc()).cloned().unwrap_or_default();
        let result = replay_filament(&store, &doc(), &index, CommitRange::all(), &live);
        assert_eq!(result.status, ReplayStatus::Match);
        assert_eq!(result.state.get("a"), Some(&json!("2.5")));
        assert_eq!(result.applied, 3);
        assert_eq!(result.replay_hash, result.live_hash);
    }

    #[test]
    fn mutated_live_key_is_named() {
        let store = store_with(&[("a", json!(1)), ("b", json!(2))]);
        let index = build_index(store.all_commits());
        let mut live = store.live_state(&doc()).cloned().unwrap_or_default();
        live.insert("b".into(), json!(3));
        let result = replay_filament(&store, &doc(), &index, CommitRange::all(), &live);
        assert_eq!(
            result.status,
            ReplayStatus::Divergence {
                keys: vec!["b".into()]
            }
        );
    }

    #[test]
    fn extra_live_keys_are_ignored_missing_ones_diverge() {
        let store = store_with(&[("a", json!(1))]);
        let index = build_index(store.all_commits());

        let mut extra = Snapshot::new();
        extra.insert("a".into(), json!(1.0));
        extra.insert("unrelated".into(), json!(true));
        let ok = replay_filament(&store, &doc(), &index, CommitRange::all(), &extra);
        assert!(ok.status.is_match());

        let missing = replay_filament(&store, &doc(), &index, CommitRange::all(), &Snapshot::new());
        assert_eq!(
            missing.status,
            ReplayStatus::Divergence {
                keys: vec!["a".into()]
            }
        );
    }

    #[test]
    fn range_limits_what_is_folded() {
        let store = store_with(&[("a", json!(1)), ("a", json!(2)), ("a", json!(3))]);
        let index = build_index(store.all_commits());
        let mut live = Snapshot::new();
        live.insert("a".into(), json!(2));
        let result = replay_filament(&store, &doc(), &index, CommitRange::new(0, 1), &live);
        assert!(result.status.is_match());
        assert_eq!(result.applied, 2);
    }

    #[test]
    fn window_before_head_matches_the_state_at_its_cut() {
        let store = store_with(&[("a", json!(1)), ("a", json!(2))]);
        let index = build_index(store.all_commits());
        let window = CommitRange::new(0, 0);

        let live = live_for_range(&store, &doc(), &index, window);
        assert_eq!(live.get("a"), Some(&json!("1")));
        let result = replay_filament(&store, &doc(), &index, window, &live);
        assert!(result.status.is_match(), "{:?}", result.status);

        // The head projection is ahead of the cut and would disagree.
        let head = store.live_state(&doc()).cloned().unwrap_or_default();
        assert!(!replay_filament(&store, &doc(), &index, window, &head).status.is_match());
    }

    #[test]
    fn window_up_to_head_keeps_only_keys_written_inside_it() {
        let store = store_with(&[("a", json!(1)), ("b", json!(1)), ("a", json!(2))]);
        let index = build_index(store.all_commits());
        let window = CommitRange::new(2, u64::MAX);

        let live = live_for_range(&store, &doc(), &index, window);
        assert_eq!(live.keys().collect::<Vec<_>>(), ["a"]);
        assert!(replay_filament(&store, &doc(), &index, window, &live).status.is_match());

        let full = live_for_range(&store, &doc(), &index, CommitRange::all());
        assert!(matches!(full, Cow::Borrowed(_)));
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn explicit_null_matches_an_absent_live_key() {
        let store = store_with(&[("gone", Value::Null)]);
        let index = build_index(store.all_commits());
        let result = replay_filament(&store, &doc(), &index, CommitRange::all(), &Snapshot::new());
        assert!(result.status.is_match());
    }

    #[test]
    fn fold_orders_by_commit_index_not_input_order() {
        let store = store_with(&[("a", json!(1)), ("a", json!(2))]);
        let commits = store.get_commits(&doc(), 0, 1);
        let reversed: Vec<&Commit> = commits.iter().rev().collect();
        assert_eq!(fold_state(reversed).get("a"), Some(&json!("2")));
    }
}
