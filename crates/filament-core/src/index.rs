//! Global commit ordering and range filtering.
//!
//! Filaments order their own commits; the index mapper places commits from
//! many filaments on one global axis so callers can ask for "everything
//! between global positions 120 and 480".
//!
//! Commits that the map does not know about are never guessed into position.
//! They are included only by the unrestricted full-range query and are
//! otherwise excluded with a logged reason.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Commit;

/// Commit id (its hash) → global order index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitIndexMap {
    order: HashMap<String, u64>,
}

impl CommitIndexMap {
    #[must_use]
    pub fn get(&self, commit_id: &str) -> Option<u64> {
        self.order.get(commit_id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Highest assigned global index, if any commit is mapped.
    #[must_use]
    pub fn latest(&self) -> Option<u64> {
        self.order.values().max().copied()
    }
}

/// Build the global order: by `(timestamp_us, commit id)`, so commits with
/// equal timestamps are ordered lexicographically by id.
#[must_use]
pub fn build_index<'a>(global_commits: impl IntoIterator<Item = &'a Commit>) -> CommitIndexMap {
    let mut keyed: Vec<(i64, &str)> = global_commits
        .into_iter()
        .map(|c| (c.timestamp_us, c.commit_hash.as_str()))
        .collect();
    keyed.sort_unstable();
    keyed.dedup_by(|a, b| a.1 == b.1);

    let order = keyed
        .into_iter()
        .zip(0u64..)
        .map(|((_, id), position)| (id.to_string(), position))
        .collect();
    CommitIndexMap { order }
}

/// Inclusive global range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRange {
    pub from: u64,
    pub to: u64,
}

impl CommitRange {
    #[must_use]
    pub const fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// The unrestricted range.
    #[must_use]
    pub const fn all() -> Self {
        Self::new(0, u64::MAX)
    }

    /// True when this range covers every mapped commit.
    #[must_use]
    pub fn is_full(&self, map: &CommitIndexMap) -> bool {
        self.from == 0 && map.latest().is_none_or(|latest| self.to >= latest)
    }

    /// True when the range stops before the latest mapped commit, so the
    /// store's live projection is ahead of it.
    #[must_use]
    pub fn ends_before(&self, map: &CommitIndexMap) -> bool {
        map.latest().is_some_and(|latest| self.to < latest)
    }

    #[must_use]
    pub const fn contains(&self, position: u64) -> bool {
        self.from <= position && position <= self.to
    }
}

impl fmt::Display for CommitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.to == u64::MAX {
            write!(f, "{}..", self.from)
        } else {
            write!(f, "{}..={}", self.from, self.to)
        }
    }
}

/// Why a commit was left out of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The commit has no global index and the range is narrower than full.
    Unindexed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub commit_id: String,
    pub reason: ExclusionReason,
}

/// Result of [`filter_range`].
#[derive(Debug, Clone, Default)]
pub struct RangeFilter<'a> {
    pub included: Vec<&'a Commit>,
    pub excluded: Vec<Exclusion>,
}

/// Select the commits that fall inside `range`.
///
/// Mapped commits are included iff their global index is inside the range.
/// Unmapped commits are included only when `range` is full; otherwise they
/// are excluded and each exclusion is logged.
pub fn filter_range<'a>(
    commits: impl IntoIterator<Item = &'a Commit>,
    map: &CommitIndexMap,
    range: CommitRange,
) -> RangeFilter<'a> {
    let full = range.is_full(map);
    let mut result = RangeFilter::default();

    for commit in commits {
        match map.get(&commit.commit_hash) {
            Some(position) if range.contains(position) => result.included.push(commit),
            Some(_) => {}
            None if full => result.included.push(commit),
            None => {
                tracing::warn!(
                    commit = %commit.commit_ref(),
                    id = %commit.commit_hash,
                    %range,
                    "excluding unindexed commit from narrowed range"
                );
                result.excluded.push(Exclusion {
                    commit_id: commit.commit_hash.clone(),
                    reason: ExclusionReason::Unindexed,
                });
            }
        }
    }
    result
}
