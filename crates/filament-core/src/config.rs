//! Project and user configuration.
//!
//! Project settings live in `.filament/config.toml`; a missing file means
//! defaults. The per-user file at `<config_dir>/filament/config.toml` only
//! supplies the default actor and output mode.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::canon::DigestAlgorithm;
use crate::model::{Actor, ActorKind};

/// Directory that marks a filament project root.
pub const FILAMENT_DIR: &str = ".filament";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilamentConfig {
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub divergence: DivergenceConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub digest: DigestConfig,
}

/// Workload bound and wall-clock budget for module replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_wall_budget_secs")]
    pub wall_budget_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            wall_budget_secs: default_wall_budget_secs(),
        }
    }
}

impl ReplayConfig {
    #[must_use]
    pub const fn wall_budget(&self) -> Duration {
        Duration::from_secs(self.wall_budget_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceConfig {
    /// Hex characters of each hash that feed a divergence id.
    #[serde(default = "default_hash_prefix_len")]
    pub hash_prefix_len: usize,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            hash_prefix_len: default_hash_prefix_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl JournalConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Digest used for replay snapshot and stage hashes. Commit hashes are
/// always BLAKE3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestConfig {
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Actor id used when `--actor` is not given.
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub actor_kind: Option<ActorKind>,
    /// `json` or `text`.
    #[serde(default)]
    pub output: Option<String>,
}

impl UserConfig {
    /// The configured default actor, if an id is set.
    #[must_use]
    pub fn default_actor(&self) -> Option<Actor> {
        let id = self.actor.as_deref()?.trim();
        if id.is_empty() {
            return None;
        }
        Some(Actor::new(self.actor_kind.unwrap_or(ActorKind::Human), id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub project: FilamentConfig,
    pub user: UserConfig,
    pub json_output: bool,
}

/// Path of the project config file under `root`.
#[must_use]
pub fn project_config_path(root: &Path) -> PathBuf {
    root.join(FILAMENT_DIR).join("config.toml")
}

/// Load `.filament/config.toml`, falling back to defaults when absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_project_config(root: &Path) -> Result<FilamentConfig> {
    let path = project_config_path(root);
    if !path.exists() {
        return Ok(FilamentConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the user config from the platform config directory.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };
    load_user_config_from(&dir.join("filament").join("config.toml"))
}

fn load_user_config_from(path: &Path) -> Result<UserConfig> {
    if !path.exists() {
        return Ok(UserConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Merge project config, user config and the `--json` flag.
///
/// # Errors
///
/// Propagates config read/parse failures.
pub fn resolve_config(root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let project = load_project_config(root)?;
    let user = load_user_config()?;
    let json_output = cli_json
        || user
            .output
            .as_deref()
            .is_some_and(|o| o.trim().eq_ignore_ascii_case("json"));
    Ok(EffectiveConfig {
        project,
        user,
        json_output,
    })
}

/// Render the default project config, written by `fil init`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&FilamentConfig::default()).context("Failed to render default config")
}

const fn default_max_rows() -> usize {
    10_000
}

const fn default_wall_budget_secs() -> u64 {
    60
}

const fn default_hash_prefix_len() -> usize {
    12
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}
