//! The closed set of operations a commit can carry.
//!
//! Each variant owns a typed payload. Payloads are validated when a commit is
//! constructed and again when the store accepts it, so a malformed payload can
//! never enter the log, whether it came from code or from a journal line.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::actor::AuthorityObject;
use super::commit::CommitRef;
use super::filament::FilamentKind;
use super::ids::{Locus, ProposalId, ResourceId, TaskId};
use crate::error::{ErrorCode, GraphError};
use crate::evidence::EvidenceData;
use crate::queue::QueueEntry;
use crate::replay::divergence::DivergenceRecord;

/// Key → value writes applied to a resource's state.
pub type Writes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    /// Direct write to resource state.
    StateWrite(StateWriteData),
    /// Immutable record of an externally supplied artifact.
    EvidenceImport(EvidenceData),
    /// First commit of a branch filament.
    Fork(ForkData),
    QueueEnqueue(QueueEntry),
    QueueMerge(QueueMergeData),
    QueueCancel(QueueCancelData),
    QueueReorder(QueueReorderData),
    /// A queued proposal landing on its resource.
    ProposalMerge(ProposalMergeData),
    ConflictOpen(ConflictOpenData),
    ConflictResolve(ConflictResolveData),
    DivergenceRecorded(DivergenceRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateWriteData {
    pub writes: Writes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkData {
    pub parent: CommitRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMergeData {
    pub proposal_id: ProposalId,
    pub merged: CommitRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCancelData {
    pub proposal_id: ProposalId,
    pub authority: AuthorityObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReorderData {
    /// Proposals pinned to the front of the queue, in this order.
    pub order: Vec<ProposalId>,
    pub authority: AuthorityObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalMergeData {
    pub proposal_id: ProposalId,
    pub task_id: TaskId,
    #[serde(default)]
    pub writes: Writes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictOpenData {
    pub resource_id: ResourceId,
    pub proposals: (ProposalId, ProposalId),
    pub overlap: BTreeSet<Locus>,
}

/// How an adjudicator settled a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// The named proposal proceeds; the other party is cancelled.
    Select { proposal_id: ProposalId },
    /// The named proposal moves to its own branch filament.
    Fork { proposal_id: ProposalId },
}

impl Resolution {
    #[must_use]
    pub const fn proposal_id(&self) -> &ProposalId {
        match self {
            Self::Select { proposal_id } | Self::Fork { proposal_id } => proposal_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolveData {
    pub resolution: Resolution,
    pub authority: AuthorityObject,
}

impl Operation {
    /// Stable tag, identical to the serialized `op` field.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::StateWrite(_) => "state_write",
            Self::EvidenceImport(_) => "evidence_import",
            Self::Fork(_) => "fork",
            Self::QueueEnqueue(_) => "queue_enqueue",
            Self::QueueMerge(_) => "queue_merge",
            Self::QueueCancel(_) => "queue_cancel",
            Self::QueueReorder(_) => "queue_reorder",
            Self::ProposalMerge(_) => "proposal_merge",
            Self::ConflictOpen(_) => "conflict_open",
            Self::ConflictResolve(_) => "conflict_resolve",
            Self::DivergenceRecorded(_) => "divergence_recorded",
        }
    }

    /// Filament kind created when this operation is a filament's first commit.
    ///
    /// `None` for [`Operation::Fork`], which inherits its parent's kind.
    #[must_use]
    pub const fn implied_kind(&self) -> Option<FilamentKind> {
        match self {
            Self::StateWrite(_) | Self::ProposalMerge(_) => Some(FilamentKind::Resource),
            Self::EvidenceImport(_) => Some(FilamentKind::Evidence),
            Self::Fork(_) => None,
            Self::QueueEnqueue(_)
            | Self::QueueMerge(_)
            | Self::QueueCancel(_)
            | Self::QueueReorder(_) => Some(FilamentKind::Queue),
            Self::ConflictOpen(_) | Self::ConflictResolve(_) => Some(FilamentKind::Conflict),
            Self::DivergenceRecorded(_) => Some(FilamentKind::Divergence),
        }
    }

    /// State writes carried by this operation, if it changes resource state.
    #[must_use]
    pub const fn writes(&self) -> Option<&Writes> {
        match self {
            Self::StateWrite(d) => Some(&d.writes),
            Self::ProposalMerge(d) => Some(&d.writes),
            _ => None,
        }
    }

    /// Commit refs embedded in the payload. They obey the same causality
    /// rule as `refs.inputs`.
    #[must_use]
    pub fn embedded_refs(&self) -> Vec<&CommitRef> {
        match self {
            Self::Fork(d) => vec![&d.parent],
            Self::QueueMerge(d) => vec![&d.merged],
            _ => Vec::new(),
        }
    }

    /// Validate the payload shape for this operation.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Precondition`] for malformed payloads and
    /// [`GraphError::Forbidden`] for authority-gated operations whose
    /// authority object is invalid.
    pub fn validate(&self) -> Result<(), GraphError> {
        match self {
            Self::StateWrite(d) => {
                if d.writes.is_empty() {
                    return Err(invalid("state_write carries no writes"));
                }
                validate_keys(&d.writes)
            }
            Self::ProposalMerge(d) => validate_keys(&d.writes),
            Self::EvidenceImport(d) => d.validate(),
            Self::Fork(_) | Self::QueueMerge(_) => Ok(()),
            Self::QueueEnqueue(entry) => entry.validate(),
            Self::QueueCancel(d) => d.authority.validate(),
            Self::QueueReorder(d) => {
                if d.order.is_empty() {
                    return Err(invalid("queue_reorder carries an empty order"));
                }
                let unique: BTreeSet<&ProposalId> = d.order.iter().collect();
                if unique.len() != d.order.len() {
                    return Err(invalid("queue_reorder names a proposal twice"));
                }
                d.authority.validate()
            }
            Self::ConflictOpen(d) => {
                if d.proposals.0 == d.proposals.1 {
                    return Err(invalid("conflict_open names the same proposal twice"));
                }
                if d.overlap.is_empty() {
                    return Err(GraphError::forbidden(
                        ErrorCode::NoOverlap,
                        "conflict_open carries an empty overlap",
                    ));
                }
                Ok(())
            }
            Self::ConflictResolve(d) => d.authority.validate(),
            Self::DivergenceRecorded(d) => {
                if d.id.is_empty() {
                    return Err(invalid("divergence record has no id"));
                }
                Ok(())
            }
        }
    }
}

fn validate_keys(writes: &Writes) -> Result<(), GraphError> {
    match writes.keys().find(|k| k.trim().is_empty()) {
        Some(_) => Err(invalid("write key is blank")),
        None => Ok(()),
    }
}

fn invalid(detail: &str) -> GraphError {
    GraphError::precondition(ErrorCode::InvalidPayload, detail)
}
