//! String identifier newtypes.
//!
//! All ids are opaque, non-blank strings without whitespace. They serialize
//! transparently so journal lines stay readable.
//!
//! Derived filament names (`queue:<r>`, `conflict:<r>:<a>+<b>`, `<r>~<p>`,
//! `divergence:<scope>`) must never collide with a name a caller can pick,
//! so resource and proposal ids reject the reserved prefixes and the
//! separators those names are built from.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::filament::FilamentKind;
use crate::error::{ErrorCode, GraphError};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        string_id!($(#[$meta])* $name, $what, no_extra_rule);
    };
    ($(#[$meta:meta])* $name:ident, $what:literal, $rule:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a validated ", $what, ".")]
            ///
            /// # Errors
            ///
            /// Returns [`GraphError::Precondition`] if the id is blank,
            /// contains whitespace, or breaks a naming rule of its kind.
            pub fn new(raw: impl Into<String>) -> Result<Self, GraphError> {
                let raw = raw.into();
                if raw.is_empty() || raw.chars().any(char::is_whitespace) {
                    return Err(GraphError::precondition(
                        ErrorCode::InvalidPayload,
                        format!("invalid {}: {raw:?}", $what),
                    ));
                }
                if let Some(reason) = $rule(&raw) {
                    return Err(GraphError::precondition(
                        ErrorCode::InvalidPayload,
                        format!("invalid {} {raw:?}: {reason}", $what),
                    ));
                }
                Ok(Self(raw))
            }

            /// Wrap a string that is already known to be valid.
            #[must_use]
            pub fn new_unchecked(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id would pass [`Self::new`].
            #[must_use]
            pub fn is_valid(&self) -> bool {
                !self.0.is_empty()
                    && !self.0.chars().any(char::is_whitespace)
                    && $rule(&self.0).is_none()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = GraphError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifies one filament (one append-only commit sequence).
    FilamentId,
    "filament id"
);
string_id!(
    /// Identifies a shared resource. Its history is the filament of the same name.
    ResourceId,
    "resource id",
    resource_rule
);
string_id!(
    /// Identifies one proposed change in a merge queue.
    ProposalId,
    "proposal id",
    proposal_rule
);
string_id!(
    /// Identifies the task a proposal belongs to; the primary queue tiebreak.
    TaskId,
    "task id"
);
string_id!(
    /// An address within a resource that a proposed change touches.
    Locus,
    "locus"
);

/// Prefixes of filament names the store derives itself.
const RESERVED_PREFIXES: [(&str, FilamentKind); 3] = [
    ("queue:", FilamentKind::Queue),
    ("conflict:", FilamentKind::Conflict),
    ("divergence:", FilamentKind::Divergence),
];

const fn no_extra_rule(_: &str) -> Option<&'static str> {
    None
}

fn resource_rule(raw: &str) -> Option<&'static str> {
    if RESERVED_PREFIXES.iter().any(|(p, _)| raw.starts_with(p)) {
        return Some("starts with a reserved prefix");
    }
    if raw.contains(['~', '+']) {
        return Some("contains a reserved separator ('~' or '+')");
    }
    None
}

fn proposal_rule(raw: &str) -> Option<&'static str> {
    if raw.contains([':', '~', '+']) {
        return Some("contains a reserved separator (':', '~' or '+')");
    }
    None
}

impl ResourceId {
    /// The filament that records this resource's committed history.
    #[must_use]
    pub fn filament_id(&self) -> FilamentId {
        FilamentId(self.0.clone())
    }

    /// The filament that records this resource's merge queue.
    #[must_use]
    pub fn queue_filament_id(&self) -> FilamentId {
        FilamentId(format!("queue:{}", self.0))
    }

    /// The branch filament created when `proposal` is forked off this resource.
    #[must_use]
    pub fn fork_filament_id(&self, proposal: &ProposalId) -> FilamentId {
        FilamentId(format!("{}~{}", self.0, proposal.0))
    }

    /// The conflict filament for a pair of proposals, independent of argument order.
    #[must_use]
    pub fn conflict_filament_id(&self, a: &ProposalId, b: &ProposalId) -> FilamentId {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        FilamentId(format!("conflict:{}:{}+{}", self.0, lo.0, hi.0))
    }
}

impl FilamentId {
    /// The divergence filament for a replay scope.
    #[must_use]
    pub fn divergence(scope: &str) -> Self {
        Self(format!("divergence:{scope}"))
    }

    /// The kind a reserved name belongs to, or `None` for a caller-chosen
    /// name.
    #[must_use]
    pub fn reserved_kind(&self) -> Option<FilamentKind> {
        RESERVED_PREFIXES
            .iter()
            .find(|(prefix, _)| self.0.starts_with(prefix))
            .map(|(_, kind)| *kind)
    }

    /// The resource whose queue this is, for a `queue:<resource>` filament.
    #[must_use]
    pub fn queue_resource(&self) -> Option<ResourceId> {
        self.0
            .strip_prefix("queue:")
            .map(|r| ResourceId(r.to_string()))
    }
}
