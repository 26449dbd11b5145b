use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::commit::Commit;
use super::ids::FilamentId;

/// Key → value view of a resource's state.
pub type Snapshot = BTreeMap<String, Value>;

/// What a filament records. Fixed by its first commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilamentKind {
    Evidence,
    #[serde(alias = "file")]
    Resource,
    Queue,
    Conflict,
    Divergence,
}

impl FilamentKind {
    /// Kinds whose filament names the store derives (`queue:`, `conflict:`,
    /// `divergence:`) rather than the caller choosing them.
    #[must_use]
    pub const fn is_derived(self) -> bool {
        matches!(self, Self::Queue | Self::Conflict | Self::Divergence)
    }
}

impl fmt::Display for FilamentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Evidence => "evidence",
            Self::Resource => "resource",
            Self::Queue => "queue",
            Self::Conflict => "conflict",
            Self::Divergence => "divergence",
        })
    }
}

/// An append-only, ordered commit sequence.
///
/// `commits[i].commit_index == i` always holds; the store is the only writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Filament {
    pub id: FilamentId,
    pub kind: FilamentKind,
    pub(crate) commits: Vec<Commit>,
}

impl Filament {
    #[must_use]
    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    #[must_use]
    pub fn head(&self) -> Option<&Commit> {
        self.commits.last()
    }

    /// Next commit index to append.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.commits.len() as u64
    }
}
