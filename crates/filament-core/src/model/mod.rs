//! Graph data model: ids, actors, commits, operations and filaments.
//!
//! # Sub-modules
//!
//! - [`ids`]: validated string newtypes ([`FilamentId`], [`ResourceId`], [`Locus`], ...).
//! - [`actor`]: [`Actor`], [`AuthorityObject`] and the per-call [`OpContext`].
//! - [`operation`]: the closed [`Operation`] union and its payloads.
//! - [`commit`]: [`Commit`], [`CommitRef`] and content hashing.
//! - [`filament`]: [`Filament`] and [`FilamentKind`].

pub mod actor;
pub mod commit;
pub mod filament;
pub mod ids;
pub mod operation;

pub use actor::{Actor, ActorKind, AuthorityObject, OpContext, require_authority};
pub use commit::{Commit, CommitRef, Refs, TrustLevel};
pub use filament::{Filament, FilamentKind, Snapshot};
pub use ids::{FilamentId, Locus, ProposalId, ResourceId, TaskId};
pub use operation::{
    ConflictOpenData, ConflictResolveData, ForkData, Operation, ProposalMergeData,
    QueueCancelData, QueueMergeData, QueueReorderData, Resolution, StateWriteData, Writes,
};
