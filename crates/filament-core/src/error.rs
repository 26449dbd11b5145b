use std::fmt;

use crate::model::{CommitRef, FilamentId};

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    DanglingRef,
    ForwardRef,
    CommitIndexGap,
    DuplicateCommitIndex,
    MissingLoci,
    MissingBaseHash,
    InvalidPayload,
    NotQueueHead,
    StaleBase,
    MissingAuthority,
    SystemAuthority,
    NoOverlap,
    UnarbitratedConflict,
    EntrySettled,
    ConflictSettled,
    NotAParty,
    JournalCorrupt,
    JournalWriteFailed,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::DanglingRef => "E2001",
            Self::ForwardRef => "E2002",
            Self::CommitIndexGap => "E2101",
            Self::DuplicateCommitIndex => "E2102",
            Self::MissingLoci => "E3001",
            Self::MissingBaseHash => "E3002",
            Self::InvalidPayload => "E3003",
            Self::NotQueueHead => "E4001",
            Self::StaleBase => "E4002",
            Self::MissingAuthority => "E4003",
            Self::SystemAuthority => "E4004",
            Self::NoOverlap => "E4005",
            Self::UnarbitratedConflict => "E4006",
            Self::EntrySettled => "E4007",
            Self::ConflictSettled => "E4008",
            Self::NotAParty => "E4009",
            Self::JournalCorrupt => "E5001",
            Self::JournalWriteFailed => "E5002",
            Self::LockContention => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Graph not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::DanglingRef => "Commit references a commit that does not exist",
            Self::ForwardRef => "Commit references a commit not yet appended",
            Self::CommitIndexGap => "Commit index skips ahead of the filament length",
            Self::DuplicateCommitIndex => "Commit index already used in this filament",
            Self::MissingLoci => "Queue entry has no touched loci",
            Self::MissingBaseHash => "Queue entry has no base commit hash",
            Self::InvalidPayload => "Operation payload failed validation",
            Self::NotQueueHead => "Only the queue head may merge",
            Self::StaleBase => "Base commit hash does not match the resource head",
            Self::MissingAuthority => "Operation requires an authority object",
            Self::SystemAuthority => "System actors cannot arbitrate",
            Self::NoOverlap => "Proposals do not overlap",
            Self::UnarbitratedConflict => "Overlapping proposals have not been arbitrated",
            Self::EntrySettled => "Queue entry was already merged or cancelled",
            Self::ConflictSettled => "Conflict was already resolved",
            Self::NotAParty => "Proposal is not a party to the conflict",
            Self::JournalCorrupt => "Journal line could not be replayed",
            Self::JournalWriteFailed => "Journal write failed",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `fil init` to create the .filament directory."),
            Self::ConfigParseError => Some("Fix syntax in .filament/config.toml and retry."),
            Self::DanglingRef | Self::ForwardRef => {
                Some("Reference only commits that are already in the log.")
            }
            Self::CommitIndexGap | Self::DuplicateCommitIndex => {
                Some("Re-read the filament head and retry with the next commit index.")
            }
            Self::MissingLoci => Some("List every locus the change touches."),
            Self::MissingBaseHash => Some("Pass the resource head hash the change was made against."),
            Self::InvalidPayload => None,
            Self::NotQueueHead => Some("Wait for the entries ahead of this one to merge."),
            Self::StaleBase => Some("Rebase the proposal onto the current head and re-enqueue."),
            Self::MissingAuthority => Some("Supply an authority object from a human approver."),
            Self::SystemAuthority => Some("Have a human or agent approver sign the resolution."),
            Self::NoOverlap => None,
            Self::UnarbitratedConflict => Some("Resolve the open conflict with `fil resolve`."),
            Self::EntrySettled | Self::ConflictSettled => None,
            Self::NotAParty => Some("Name one of the two proposals listed by `fil conflicts`."),
            Self::JournalCorrupt => Some("Inspect .filament/journal.jsonl for hand edits."),
            Self::JournalWriteFailed => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other `fil` process releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Structural errors raised by graph operations.
///
/// Every variant aborts only the offending operation; the store is left
/// exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A ref points at a commit that is not (yet) in the store.
    #[error("{code}: causality violation: {commit} refs {target} ({detail})")]
    Causality {
        code: ErrorCode,
        commit: String,
        target: CommitRef,
        detail: &'static str,
    },

    /// The commit index is not the next index of its filament.
    #[error("{code}: sequence violation on {filament}: expected index {expected}, got {got}")]
    Sequence {
        code: ErrorCode,
        filament: FilamentId,
        expected: u64,
        got: u64,
    },

    /// Input is missing something required before the operation can start.
    #[error("{code}: precondition failed: {detail}")]
    Precondition { code: ErrorCode, detail: String },

    /// The operation is not permitted in the current graph state.
    #[error("{code}: forbidden: {detail}")]
    Forbidden { code: ErrorCode, detail: String },
}

impl GraphError {
    pub(crate) fn precondition(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Precondition {
            code,
            detail: detail.into(),
        }
    }

    pub(crate) fn forbidden(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            detail: detail.into(),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Causality { code, .. }
            | Self::Sequence { code, .. }
            | Self::Precondition { code, .. }
            | Self::Forbidden { code, .. } => *code,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }
}
