//! filament-core library.
//!
//! A coordination graph for agents and humans sharing resources. Every
//! change is an immutable commit on an append-only filament; proposals wait
//! in per-resource merge queues; overlapping proposals must be arbitrated by
//! an authority before either merges; and replay recomputes state from the
//! log to catch drift between the log and the live projection.
//!
//! Start with [`store::FilamentStore`] and the operations in [`queue`],
//! [`conflict`] and [`replay`]. [`journal::Journal`] persists a store to
//! `.filament/journal.jsonl`.
//!
//! # Conventions
//!
//! - **Errors**: library operations return `thiserror` enums carrying an
//!   [`error::ErrorCode`]; config loading returns `anyhow::Result`.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).
//! - **Context**: every mutating call takes an explicit
//!   [`model::OpContext`]. Nothing reads a global clock or actor.

pub mod canon;
pub mod config;
pub mod conflict;
pub mod error;
pub mod evidence;
pub mod index;
pub mod journal;
pub mod lock;
pub mod model;
pub mod queue;
pub mod replay;
pub mod store;
pub mod timing;

pub use error::{ErrorCode, GraphError};
pub use store::{FilamentStore, GENESIS_HASH};
