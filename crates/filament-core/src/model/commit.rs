//! The commit: one immutable, causally-linked record in a filament.
//!
//! # Hashing
//!
//! A commit's identity is `blake3:<hex>` over the canonical JSON of every
//! field except `commit_hash` itself. Because `refs` (and payload-embedded
//! refs) name earlier commits, the log forms an acyclic graph whose edges
//! only ever point backwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::actor::{Actor, OpContext};
use super::ids::{FilamentId, Locus};
use super::operation::Operation;
use crate::canon::{Blake3Digest, ContentDigest};
use crate::error::{ErrorCode, GraphError};

/// Address of one commit: `(filament_id, commit_index)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    pub filament_id: FilamentId,
    pub commit_index: u64,
}

impl CommitRef {
    #[must_use]
    pub const fn new(filament_id: FilamentId, commit_index: u64) -> Self {
        Self {
            filament_id,
            commit_index,
        }
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.filament_id, self.commit_index)
    }
}

impl FromStr for CommitRef {
    type Err = GraphError;

    /// Parse the `<filament>@<index>` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("invalid commit ref {s:?}: expected <filament>@<index>"),
            )
        };
        let (filament, index) = s.rsplit_once('@').ok_or_else(invalid)?;
        let commit_index = index.parse().map_err(|_| invalid())?;
        Ok(Self::new(FilamentId::new(filament)?, commit_index))
    }
}

/// Causal references carried by a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refs {
    /// Commits this one was derived from.
    #[serde(default)]
    pub inputs: Vec<CommitRef>,
    /// Evidence filaments this commit relies on.
    #[serde(default)]
    pub evidence: Vec<CommitRef>,
}

impl Refs {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.evidence.is_empty()
    }
}

/// How much the graph trusts the content of a commit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    #[default]
    Unverified,
    Attested,
    Verified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub filament_id: FilamentId,
    /// 0-based, strictly increasing per filament.
    pub commit_index: u64,
    /// Wall-clock microseconds since the Unix epoch.
    pub timestamp_us: i64,
    pub actor: Actor,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locus: Option<Locus>,
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub refs: Refs,
    #[serde(default)]
    pub trust_level: TrustLevel,
    /// Stamped by the store on append.
    #[serde(default)]
    pub commit_hash: String,
}

impl Commit {
    /// Build a commit, validating the operation payload.
    ///
    /// # Errors
    ///
    /// Returns the payload validation error from [`Operation::validate`].
    pub fn new(
        filament_id: FilamentId,
        commit_index: u64,
        ctx: &OpContext,
        operation: Operation,
    ) -> Result<Self, GraphError> {
        operation.validate()?;
        Ok(Self {
            filament_id,
            commit_index,
            timestamp_us: ctx.timestamp_us,
            actor: ctx.actor.clone(),
            operation,
            locus: None,
            refs: Refs::default(),
            trust_level: TrustLevel::default(),
            commit_hash: String::new(),
        })
    }

    #[must_use]
    pub fn with_locus(mut self, locus: Locus) -> Self {
        self.locus = Some(locus);
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: CommitRef) -> Self {
        self.refs.inputs.push(input);
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: CommitRef) -> Self {
        self.refs.evidence.push(evidence);
        self
    }

    #[must_use]
    pub const fn with_trust(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = trust_level;
        self
    }

    /// This commit's own address.
    #[must_use]
    pub fn commit_ref(&self) -> CommitRef {
        CommitRef::new(self.filament_id.clone(), self.commit_index)
    }

    /// Every ref this commit makes: inputs, evidence and payload-embedded refs.
    pub fn all_refs(&self) -> impl Iterator<Item = &CommitRef> {
        self.refs
            .inputs
            .iter()
            .chain(self.refs.evidence.iter())
            .chain(self.operation.embedded_refs())
    }

    /// Compute the content hash over every field except `commit_hash`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the commit cannot be represented as JSON.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("commit_hash");
        }
        Ok(Blake3Digest.hash_value(&value))
    }
}
