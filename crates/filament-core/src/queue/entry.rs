use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GraphError};
use crate::model::{Locus, ProposalId, ResourceId, TaskId, Writes};

/// A proposed change waiting in a resource's merge queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub resource_id: ResourceId,
    pub proposal_id: ProposalId,
    pub task_id: TaskId,
    pub actor_id: String,
    /// Head hash of the resource filament the change was made against.
    pub base_commit_hash: String,
    pub touched_loci: BTreeSet<Locus>,
    /// Writes applied to the resource when the proposal merges.
    #[serde(default)]
    pub writes: Writes,
}

impl QueueEntry {
    /// Build an entry. Both the base hash and at least one locus are
    /// mandatory.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Precondition`] with
    /// [`ErrorCode::MissingLoci`] or [`ErrorCode::MissingBaseHash`].
    pub fn new(
        resource_id: ResourceId,
        proposal_id: ProposalId,
        task_id: TaskId,
        actor_id: impl Into<String>,
        base_commit_hash: Option<String>,
        touched_loci: impl IntoIterator<Item = Locus>,
    ) -> Result<Self, GraphError> {
        let entry = Self {
            resource_id,
            proposal_id,
            task_id,
            actor_id: actor_id.into(),
            base_commit_hash: base_commit_hash.unwrap_or_default(),
            touched_loci: touched_loci.into_iter().collect(),
            writes: Writes::new(),
        };
        entry.validate()?;
        Ok(entry)
    }

    #[must_use]
    pub fn with_writes(mut self, writes: Writes) -> Self {
        self.writes = writes;
        self
    }

    /// # Errors
    ///
    /// Same conditions as [`QueueEntry::new`], plus a blank actor id or
    /// write key, or a resource or proposal id that breaks the naming rules
    /// (entries read back from a journal never went through the id
    /// constructors).
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.touched_loci.is_empty() {
            return Err(GraphError::precondition(
                ErrorCode::MissingLoci,
                format!("proposal {} touches no loci", self.proposal_id),
            ));
        }
        if self.base_commit_hash.trim().is_empty() {
            return Err(GraphError::precondition(
                ErrorCode::MissingBaseHash,
                format!("proposal {} has no base commit hash", self.proposal_id),
            ));
        }
        if !self.resource_id.is_valid() || !self.proposal_id.is_valid() {
            return Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!(
                    "proposal {:?} on {:?} uses a reserved name",
                    self.proposal_id.as_str(),
                    self.resource_id.as_str()
                ),
            ));
        }
        if self.actor_id.trim().is_empty() {
            return Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("proposal {} has no actor", self.proposal_id),
            ));
        }
        if self.writes.keys().any(|k| k.trim().is_empty()) {
            return Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("proposal {} writes a blank key", self.proposal_id),
            ));
        }
        Ok(())
    }

    /// Loci touched by both entries.
    #[must_use]
    pub fn overlap(&self, other: &Self) -> BTreeSet<Locus> {
        self.touched_loci
            .intersection(&other.touched_loci)
            .cloned()
            .collect()
    }
}
