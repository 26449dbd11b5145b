//! Actors, authority objects and the per-operation context.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GraphError};

/// Who performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Human,
    Agent,
    System,
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Human => "human",
            Self::Agent => "agent",
            Self::System => "system",
        })
    }
}

impl FromStr for ActorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown actor kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    #[must_use]
    pub fn new(kind: ActorKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn human(id: impl Into<String>) -> Self {
        Self::new(ActorKind::Human, id)
    }

    #[must_use]
    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(ActorKind::Agent, id)
    }

    #[must_use]
    pub fn system(id: impl Into<String>) -> Self {
        Self::new(ActorKind::System, id)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A signed, human-attributable approval.
///
/// Required for conflict resolution, queue reorder and queue cancel. An
/// authority object is valid only when its actor is not `system`, it names a
/// reason, and it carries at least one non-blank signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorityObject {
    pub actor: Actor,
    pub reason: String,
    #[serde(default)]
    pub signatures: Vec<String>,
}

impl AuthorityObject {
    #[must_use]
    pub fn new(actor: Actor, reason: impl Into<String>, signatures: Vec<String>) -> Self {
        Self {
            actor,
            reason: reason.into(),
            signatures,
        }
    }

    /// Check this object against the arbitration rules.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Forbidden`] when the actor is `system`, or the
    /// actor id, reason or signatures are missing.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.actor.kind == ActorKind::System {
            return Err(GraphError::forbidden(
                ErrorCode::SystemAuthority,
                format!("authority actor {} is a system actor", self.actor),
            ));
        }
        if self.actor.id.trim().is_empty() {
            return Err(GraphError::forbidden(
                ErrorCode::MissingAuthority,
                "authority actor id is blank",
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(GraphError::forbidden(
                ErrorCode::MissingAuthority,
                "authority reason is blank",
            ));
        }
        if !self.signatures.iter().any(|s| !s.trim().is_empty()) {
            return Err(GraphError::forbidden(
                ErrorCode::MissingAuthority,
                "authority carries no signature",
            ));
        }
        Ok(())
    }
}

/// Require a present, valid authority object.
///
/// # Errors
///
/// Returns [`GraphError::Forbidden`] when `authority` is `None` or fails
/// [`AuthorityObject::validate`].
pub fn require_authority<'a>(
    authority: Option<&'a AuthorityObject>,
    action: &str,
) -> Result<&'a AuthorityObject, GraphError> {
    let Some(authority) = authority else {
        return Err(GraphError::forbidden(
            ErrorCode::MissingAuthority,
            format!("{action} requires an authority object"),
        ));
    };
    authority.validate()?;
    Ok(authority)
}

/// Who is acting and when. Passed explicitly to every mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    pub actor: Actor,
    pub timestamp_us: i64,
}

impl OpContext {
    #[must_use]
    pub const fn new(actor: Actor, timestamp_us: i64) -> Self {
        Self {
            actor,
            timestamp_us,
        }
    }

    /// Context stamped with the current wall clock.
    #[must_use]
    pub fn now(actor: Actor) -> Self {
        Self::new(actor, chrono::Utc::now().timestamp_micros())
    }
}
