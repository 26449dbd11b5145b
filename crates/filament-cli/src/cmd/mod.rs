pub mod cancel;
pub mod completions;
pub mod conflicts;
pub mod enqueue;
pub mod evidence;
pub mod init;
pub mod log;
pub mod merge;
pub mod queue;
pub mod reorder;
pub mod replay;
pub mod resolve;
pub mod verify;
pub mod write;

use std::path::Path;

use anyhow::Result;
use clap::Args;
use filament_core::config::{EffectiveConfig, resolve_config};
use filament_core::error::GraphError;
use filament_core::journal::{Journal, JournalError};
use filament_core::model::{Actor, ActorKind, AuthorityObject, OpContext};
use filament_core::store::FilamentStore;
use serde_json::Value;

use crate::actor::resolve_actor;
use crate::output::{CliError, OutputMode, fail, reject};

/// Global identity flags, passed down to mutating commands.
#[derive(Debug, Clone, Copy)]
pub struct Identity<'a> {
    pub actor: Option<&'a str>,
    pub kind: Option<ActorKind>,
}

/// Everything a command needs from the project directory.
pub struct Session {
    pub config: EffectiveConfig,
    pub journal: Journal,
    pub output: OutputMode,
}

impl Session {
    /// Load config and open the journal under `root`.
    ///
    /// # Errors
    ///
    /// Config parse failures, or a missing `.filament` directory (rendered
    /// before returning).
    pub fn open(root: &Path, json: bool) -> Result<Self> {
        let config = resolve_config(root, json)?;
        let output = OutputMode::from_json_flag(config.json_output);
        let journal = Journal::open(root, config.project.journal.lock_timeout())
            .map_err(|e| fail(output, &e))?;
        Ok(Self {
            config,
            journal,
            output,
        })
    }

    /// Load the store read-only.
    ///
    /// # Errors
    ///
    /// Journal load failures (rendered before returning).
    pub fn load(&self) -> Result<FilamentStore> {
        self.journal.load().map_err(|e| fail(self.output, &e))
    }

    /// Run one mutating operation under the journal lock.
    ///
    /// # Errors
    ///
    /// The operation's error or any journal failure (rendered before
    /// returning).
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut FilamentStore) -> Result<T, GraphError>,
    ) -> Result<T> {
        self.journal
            .transact(f)
            .map_err(|e: JournalError| fail(self.output, &e))
    }

    /// The acting identity stamped with the current time.
    ///
    /// # Errors
    ///
    /// Fails (after rendering) when no actor can be resolved.
    pub fn context(&self, identity: Identity<'_>) -> Result<OpContext> {
        Ok(OpContext::now(self.actor(identity)?))
    }

    fn actor(&self, identity: Identity<'_>) -> Result<Actor> {
        resolve_actor(identity.actor, identity.kind, &self.config.user)
            .map_err(|e| reject(self.output, &CliError::new(e.to_string())))
    }
}

/// Flags for commands that need an authority object.
#[derive(Args, Debug, Clone)]
pub struct AuthorityArgs {
    /// Why the authority approves this action.
    #[arg(long)]
    pub reason: Option<String>,

    /// Signature attached to the authority object (repeatable).
    #[arg(long = "sig")]
    pub signatures: Vec<String>,
}

impl AuthorityArgs {
    /// Build an authority object signed by `actor`, or `None` when neither
    /// a reason nor a signature was given.
    pub fn authority(&self, actor: &Actor) -> Option<AuthorityObject> {
        if self.reason.is_none() && self.signatures.is_empty() {
            return None;
        }
        Some(AuthorityObject::new(
            actor.clone(),
            self.reason.clone().unwrap_or_default(),
            self.signatures.clone(),
        ))
    }
}

/// Parse `key=value`. The value is read as JSON when it parses, otherwise as
/// a plain string.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected key=value, got {raw:?}"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("blank key in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
