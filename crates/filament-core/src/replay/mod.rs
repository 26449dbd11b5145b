//! Deterministic replay and verification.
//!
//! Replay recomputes derived state purely from the commit log and compares
//! it with live state. A mismatch is a normal result, never an error: the
//! engine reports it, and the caller decides whether to record it with
//! [`divergence::record_divergence`]. Nothing here repairs or halts.
//!
//! - [`resource`]: one filament folded into a key → value map.
//! - [`module`]: the six-stage pipeline over a set of resources.
//! - [`divergence`]: deterministic, append-only divergence records.

pub mod divergence;
pub mod module;
pub mod resource;

pub use divergence::{
    DivergenceRecord, RecordedDivergence, divergence_id, divergence_records, record_divergence,
};
pub use module::{
    LiveStageHashes, ModuleBudget, ModuleReplay, ModuleReplayRequest, PIPELINE, Stage,
    StageDeriver, StageInputs, StageOutcome, StageOutputs, StandardPipeline, live_stage_hashes,
    replay_module,
};
pub use resource::{
    ReplayStatus, ResourceReplay, fold_state, live_for_range, replay_filament, replay_resource,
    replay_resource_with,
};
