//! Module-level replay.
//!
//! A module is a set of resource filaments. Its derived views are computed in
//! a fixed six-stage pipeline, each stage from the replayed resource states
//! plus the outputs of earlier stages:
//!
//! ```text
//! facts → matches → summaries → key_metrics → packets → projection
//! ```
//!
//! Every stage output is canonicalized and hashed, then compared with a hash
//! computed the same way from the live side. A stage that produces nothing
//! is *not applicable*. When both sides are not applicable the stage counts
//! as a match, but the outcome is flagged `vacuous` so a stage that quietly
//! stopped producing output is still visible in the report.
//!
//! The run is measured but never interrupted: exceeding the row bound or
//! the wall-clock budget is reported through `within_budget`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::resource::{ReplayStatus, ResourceReplay, live_for_range, replay_resource_with};
use crate::canon::{ContentDigest, canonicalize};
use crate::config::ReplayConfig;
use crate::index::{CommitIndexMap, CommitRange};
use crate::model::{FilamentId, Snapshot};
use crate::store::FilamentStore;
use crate::timing;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Facts,
    Matches,
    Summaries,
    KeyMetrics,
    Packets,
    Projection,
}

/// Stages in execution order.
pub const PIPELINE: [Stage; 6] = [
    Stage::Facts,
    Stage::Matches,
    Stage::Summaries,
    Stage::KeyMetrics,
    Stage::Packets,
    Stage::Projection,
];

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Facts => "facts",
            Self::Matches => "matches",
            Self::Summaries => "summaries",
            Self::KeyMetrics => "key_metrics",
            Self::Packets => "packets",
            Self::Projection => "projection",
        }
    }

    const fn timing_name(self) -> &'static str {
        match self {
            Self::Facts => "replay.facts",
            Self::Matches => "replay.matches",
            Self::Summaries => "replay.summaries",
            Self::KeyMetrics => "replay.key_metrics",
            Self::Packets => "replay.packets",
            Self::Projection => "replay.projection",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource states a pipeline derives from, keyed by filament.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageInputs {
    pub resources: BTreeMap<FilamentId, Snapshot>,
}

impl StageInputs {
    /// Inputs from resource-level replay results.
    #[must_use]
    pub fn from_replays(replays: &BTreeMap<FilamentId, ResourceReplay>) -> Self {
        Self {
            resources: replays
                .iter()
                .map(|(id, r)| (id.clone(), r.state.clone()))
                .collect(),
        }
    }

    /// Inputs from the store's live projection. Missing filaments are empty.
    #[must_use]
    pub fn from_live(store: &FilamentStore, filaments: &[FilamentId]) -> Self {
        Self {
            resources: filaments
                .iter()
                .map(|id| {
                    let state: Snapshot = store
                        .live_state(id)
                        .map(|s| s.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect())
                        .unwrap_or_default();
                    (id.clone(), state)
                })
                .collect(),
        }
    }

    /// Inputs from the live side of a replay over `range`: the store's
    /// projection for the full range, the state as of the cut otherwise.
    #[must_use]
    pub fn for_range(
        store: &FilamentStore,
        filaments: &[FilamentId],
        index: &CommitIndexMap,
        range: CommitRange,
    ) -> Self {
        Self {
            resources: filaments
                .iter()
                .map(|id| {
                    let state = live_for_range(store, id, index, range)
                        .iter()
                        .map(|(k, v)| (k.clone(), canonicalize(v)))
                        .collect();
                    (id.clone(), state)
                })
                .collect(),
        }
    }

    /// Total key/value rows across all resources.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.resources.values().map(BTreeMap::len).sum()
    }
}

/// Outputs of earlier stages, available to later ones.
pub type StageOutputs = BTreeMap<Stage, Value>;

/// Derives one pipeline stage. `None` means the stage is not applicable.
///
/// Implementations must be pure: the same inputs and prior outputs always
/// give the same value. Any hash a stage embeds uses `digest`, the one the
/// stage outputs themselves are hashed with.
pub trait StageDeriver {
    fn derive(
        &self,
        stage: Stage,
        inputs: &StageInputs,
        prior: &StageOutputs,
        digest: &dyn ContentDigest,
    ) -> Option<Value>;
}

/// The built-in derivation.
///
/// - `facts`: one row per `(resource, key, value)`.
/// - `matches`: `(key, value)` pairs shared by two or more resources.
/// - `summaries`: key count and state hash per resource.
/// - `key_metrics`: per key, how many resources carry it and how many
///   distinct values it takes.
/// - `packets`: facts whose key starts with `packet_prefix`, passed through
///   unchanged. Not applicable when no prefix is configured.
/// - `projection`: the hashes of every earlier stage plus headline counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandardPipeline {
    pub packet_prefix: Option<String>,
}

impl StandardPipeline {
    #[must_use]
    pub fn with_packet_prefix(prefix: impl Into<String>) -> Self {
        Self {
            packet_prefix: Some(prefix.into()),
        }
    }

    fn facts(inputs: &StageInputs) -> Vec<Value> {
        inputs
            .resources
            .iter()
            .flat_map(|(id, state)| {
                state
                    .iter()
                    .map(move |(key, value)| json!({"resource": id, "key": key, "value": value}))
            })
            .collect()
    }
}

impl StageDeriver for StandardPipeline {
    fn derive(
        &self,
        stage: Stage,
        inputs: &StageInputs,
        prior: &StageOutputs,
        digest: &dyn ContentDigest,
    ) -> Option<Value> {
        let value = match stage {
            Stage::Facts => Value::Array(Self::facts(inputs)),
            Stage::Matches => {
                let mut shared: BTreeMap<(String, String), BTreeSet<&FilamentId>> =
                    BTreeMap::new();
                for (id, state) in &inputs.resources {
                    for (key, value) in state {
                        shared
                            .entry((key.clone(), value.to_string()))
                            .or_default()
                            .insert(id);
                    }
                }
                Value::Array(
                    shared
                        .into_iter()
                        .filter(|(_, ids)| ids.len() > 1)
                        .map(|((key, value), ids)| {
                            json!({"key": key, "value": value, "resources": ids})
                        })
                        .collect(),
                )
            }
            Stage::Summaries => Value::Array(
                inputs
                    .resources
                    .iter()
                    .map(|(id, state)| {
                        let object: serde_json::Map<String, Value> =
                            state.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        json!({
                            "resource": id,
                            "keys": state.len(),
                            "state_hash": digest.hash_value(&Value::Object(object)),
                        })
                    })
                    .collect(),
            ),
            Stage::KeyMetrics => {
                let mut per_key: BTreeMap<&str, (usize, BTreeSet<String>)> = BTreeMap::new();
                for state in inputs.resources.values() {
                    for (key, value) in state {
                        let entry = per_key.entry(key.as_str()).or_default();
                        entry.0 += 1;
                        entry.1.insert(value.to_string());
                    }
                }
                Value::Array(
                    per_key
                        .into_iter()
                        .map(|(key, (resources, values))| {
                            json!({"key": key, "resources": resources, "distinct_values": values.len()})
                        })
                        .collect(),
                )
            }
            Stage::Packets => {
                let prefix = self.packet_prefix.as_deref()?;
                Value::Array(
                    Self::facts(inputs)
                        .into_iter()
                        .filter(|row| {
                            row.get("key")
                                .and_then(Value::as_str)
                                .is_some_and(|k| k.starts_with(prefix))
                        })
                        .collect(),
                )
            }
            Stage::Projection => {
                if prior.is_empty() {
                    return None;
                }
                let stages: serde_json::Map<String, Value> = PIPELINE
                    .iter()
                    .filter(|s| **s != Stage::Projection)
                    .map(|s| {
                        let hash = prior
                            .get(s)
                            .map_or(Value::Null, |v| Value::String(crate::canon::content_hash(v)));
                        (s.as_str().to_string(), hash)
                    })
                    .collect();
                json!({
                    "resources": inputs.resources.len(),
                    "rows": inputs.rows(),
                    "stages": stages,
                })
            }
        };
        match &value {
            Value::Array(rows) if rows.is_empty() => None,
            _ => Some(value),
        }
    }
}

/// One stage's hash for a pipeline run. `None` means not applicable.
#[derive(Debug, Clone)]
struct StageRun {
    stage: Stage,
    hash: Option<String>,
    rows: usize,
    elapsed: Duration,
}

fn run_pipeline(
    deriver: &dyn StageDeriver,
    inputs: &StageInputs,
    digest: &dyn ContentDigest,
) -> Vec<StageRun> {
    let mut prior = StageOutputs::new();
    let mut runs = Vec::with_capacity(PIPELINE.len());
    for stage in PIPELINE {
        let started = Instant::now();
        let output = timing::timed(stage.timing_name(), || {
            deriver.derive(stage, inputs, &prior, digest)
        });
        let hash = output.as_ref().map(|v| digest.hash_value(v));
        let rows = match &output {
            Some(Value::Array(rows)) => rows.len(),
            Some(_) => 1,
            None => 0,
        };
        runs.push(StageRun {
            stage,
            hash,
            rows,
            elapsed: started.elapsed(),
        });
        if let Some(value) = output {
            prior.insert(stage, value);
        }
    }
    runs
}

/// Per-stage hashes computed from live state. A missing stage is treated as
/// not applicable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStageHashes {
    pub hashes: BTreeMap<Stage, Option<String>>,
}

impl LiveStageHashes {
    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<&str> {
        self.hashes.get(&stage).and_then(Option::as_deref)
    }

    pub fn set(&mut self, stage: Stage, hash: Option<String>) {
        self.hashes.insert(stage, hash);
    }
}

/// Run `deriver` over live inputs to get the hashes replay is compared to.
#[must_use]
pub fn live_stage_hashes(
    deriver: &dyn StageDeriver,
    inputs: &StageInputs,
    digest: &dyn ContentDigest,
) -> LiveStageHashes {
    LiveStageHashes {
        hashes: run_pipeline(deriver, inputs, digest)
            .into_iter()
            .map(|run| (run.stage, run.hash))
            .collect(),
    }
}

/// Workload bound and wall-clock budget for one module replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleBudget {
    pub max_rows: usize,
    #[serde(rename = "wall_budget_us", serialize_with = "timing::serialize_micros")]
    pub wall: Duration,
}

impl Default for ModuleBudget {
    fn default() -> Self {
        Self::from(&ReplayConfig::default())
    }
}

impl From<&ReplayConfig> for ModuleBudget {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            max_rows: config.max_rows,
            wall: config.wall_budget(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub replay_hash: Option<String>,
    pub live_hash: Option<String>,
    #[serde(flatten)]
    pub status: ReplayStatus,
    /// Both sides were not applicable.
    pub vacuous: bool,
    pub rows: usize,
    #[serde(rename = "elapsed_us", serialize_with = "timing::serialize_micros")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleReplay {
    pub stages: Vec<StageOutcome>,
    pub resources: BTreeMap<FilamentId, ResourceReplay>,
    /// Rows fed into the pipeline.
    pub rows: usize,
    #[serde(rename = "elapsed_us", serialize_with = "timing::serialize_micros")]
    pub elapsed: Duration,
    pub budget: ModuleBudget,
    pub within_budget: bool,
}

impl ModuleReplay {
    /// True when every stage matched.
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_match())
    }

    pub fn divergent_stages(&self) -> impl Iterator<Item = &StageOutcome> {
        self.stages.iter().filter(|s| !s.status.is_match())
    }

    pub fn vacuous_stages(&self) -> impl Iterator<Item = &StageOutcome> {
        self.stages.iter().filter(|s| s.vacuous)
    }
}

/// Everything a module replay reads.
pub struct ModuleReplayRequest<'a> {
    pub filaments: &'a [FilamentId],
    pub index: &'a CommitIndexMap,
    pub range: CommitRange,
    pub live: &'a LiveStageHashes,
    pub deriver: &'a dyn StageDeriver,
    pub budget: ModuleBudget,
    pub digest: &'a dyn ContentDigest,
}

/// Replay each resource, derive every stage, and compare stage hashes with
/// `request.live`.
#[must_use]
pub fn replay_module(store: &FilamentStore, request: &ModuleReplayRequest<'_>) -> ModuleReplay {
    let started = Instant::now();

    let resources: BTreeMap<FilamentId, ResourceReplay> = request
        .filaments
        .iter()
        .map(|id| {
            let commits = store.filament(id).map(|f| f.commits()).unwrap_or_default();
            let live = live_for_range(store, id, request.index, request.range);
            let replay =
                replay_resource_with(commits, request.index, request.range, &live, request.digest);
            (id.clone(), replay)
        })
        .collect();

    let inputs = StageInputs::from_replays(&resources);
    let rows = inputs.rows();

    let stages: Vec<StageOutcome> = run_pipeline(request.deriver, &inputs, request.digest)
        .into_iter()
        .map(|run| {
            let live_hash = request.live.get(run.stage).map(str::to_string);
            let vacuous = run.hash.is_none() && live_hash.is_none();
            let status = if run.hash == live_hash {
                ReplayStatus::Match
            } else {
                ReplayStatus::Divergence {
                    keys: vec![run.stage.as_str().to_string()],
                }
            };
            StageOutcome {
                stage: run.stage,
                replay_hash: run.hash,
                live_hash,
                status,
                vacuous,
                rows: run.rows,
                elapsed: run.elapsed,
            }
        })
        .collect();

    let elapsed = started.elapsed();
    let within_budget = rows <= request.budget.max_rows && elapsed <= request.budget.wall;
    let divergent = stages.iter().filter(|s| !s.status.is_match()).count();

    if within_budget {
        tracing::info!(
            resources = resources.len(),
            rows,
            divergent,
            elapsed_us = elapsed.as_micros(),
            "module replay finished"
        );
    } else {
        tracing::warn!(
            rows,
            max_rows = request.budget.max_rows,
            elapsed_us = elapsed.as_micros(),
            budget_us = request.budget.wall.as_micros(),
            "module replay exceeded its budget"
        );
    }

    ModuleReplay {
        stages,
        resources,
        rows,
        elapsed,
        budget: request.budget,
        within_budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::{Blake3Digest, Sha256Digest};
    use crate::index::build_index;
    use crate::model::{Actor, Commit, OpContext, Operation, StateWriteData};
    use serde_json::json;

    fn seeded() -> (FilamentStore, Vec<FilamentId>) {
        let mut store = FilamentStore::new();
        let ids = vec![
            FilamentId::new_unchecked("alpha"),
            FilamentId::new_unchecked("beta"),
        ];
        let rows = [
            ("alpha", "status", json!("open")),
            ("alpha", "pkt.size", json!(3)),
            ("beta", "status", json!("open")),
            ("beta", "owner", json!("bob")),
        ];
        for (i, (id, key, value)) in rows.into_iter().enumerate() {
            let fid = FilamentId::new_unchecked(id);
            let commit: Commit = store
                .next_commit(
                    &fid,
                    &OpContext::new(Actor::agent("loader"), 1_000 + i as i64),
                    Operation::StateWrite(StateWriteData {
                        writes: BTreeMap::from([(key.to_string(), value)]),
                    }),
                )
                .expect("commit");
            store.append(commit).expect("append");
        }
        (store, ids)
    }

    fn run(
        store: &FilamentStore,
        ids: &[FilamentId],
        live: &LiveStageHashes,
        deriver: &dyn StageDeriver,
    ) -> ModuleReplay {
        let index = build_index(store.all_commits());
        replay_module(
            store,
            &ModuleReplayRequest {
                filaments: ids,
                index: &index,
                range: CommitRange::all(),
                live,
                deriver,
                budget: ModuleBudget::default(),
                digest: &Blake3Digest,
            },
        )
    }

    #[test]
    fn replay_matches_live_pipeline() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::with_packet_prefix("pkt.");
        let live = live_stage_hashes(&pipeline, &StageInputs::from_live(&store, &ids), &Blake3Digest);
        let result = run(&store, &ids, &live, &pipeline);

        assert!(result.is_match(), "{:?}", result.stages);
        assert_eq!(result.stages.len(), PIPELINE.len());
        assert_eq!(result.rows, 4);
        assert!(result.within_budget);
        assert_eq!(result.vacuous_stages().count(), 0);

        let matches = result
            .stages
            .iter()
            .find(|s| s.stage == Stage::Matches)
            .expect("matches stage");
        assert_eq!(matches.rows, 1, "status=open is shared by both resources");
    }

    #[test]
    fn missing_prefix_makes_packets_vacuous() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::default();
        let live = live_stage_hashes(&pipeline, &StageInputs::from_live(&store, &ids), &Blake3Digest);
        let result = run(&store, &ids, &live, &pipeline);
        assert!(result.is_match());
        let vacuous: Vec<Stage> = result.vacuous_stages().map(|s| s.stage).collect();
        assert_eq!(vacuous, vec![Stage::Packets]);
    }

    #[test]
    fn tampered_live_hash_diverges_on_that_stage_only() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::default();
        let mut live =
            live_stage_hashes(&pipeline, &StageInputs::from_live(&store, &ids), &Blake3Digest);
        live.set(Stage::KeyMetrics, Some("blake3:bogus".into()));

        let result = run(&store, &ids, &live, &pipeline);
        let divergent: Vec<Stage> = result.divergent_stages().map(|s| s.stage).collect();
        assert_eq!(divergent, vec![Stage::KeyMetrics]);
    }

    #[test]
    fn live_side_missing_a_stage_diverges() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::default();
        let mut live =
            live_stage_hashes(&pipeline, &StageInputs::from_live(&store, &ids), &Blake3Digest);
        live.set(Stage::Facts, None);
        let result = run(&store, &ids, &live, &pipeline);
        assert!(!result.is_match());
        assert!(result.divergent_stages().all(|s| !s.vacuous));
    }

    #[test]
    fn row_bound_is_reported_not_enforced() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::default();
        let live = live_stage_hashes(&pipeline, &StageInputs::from_live(&store, &ids), &Blake3Digest);
        let index = build_index(store.all_commits());
        let result = replay_module(
            &store,
            &ModuleReplayRequest {
                filaments: &ids,
                index: &index,
                range: CommitRange::all(),
                live: &live,
                deriver: &pipeline,
                budget: ModuleBudget {
                    max_rows: 2,
                    wall: Duration::from_secs(60),
                },
                digest: &Blake3Digest,
            },
        );
        assert!(!result.within_budget);
        assert!(result.is_match());
        assert_eq!(result.stages.len(), PIPELINE.len());
    }

    #[test]
    fn summaries_hash_with_the_configured_digest() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::default();
        let inputs = StageInputs::from_live(&store, &ids);
        let summaries = |digest: &dyn ContentDigest| {
            pipeline
                .derive(Stage::Summaries, &inputs, &StageOutputs::new(), digest)
                .expect("summaries always derive")
        };

        let sha = summaries(&Sha256Digest);
        let blake = summaries(&Blake3Digest);
        assert_ne!(sha, blake);
        for row in sha.as_array().expect("array") {
            let hash = row["state_hash"].as_str().expect("hash");
            assert!(hash.starts_with("sha256:"), "{hash}");
        }
    }

    #[test]
    fn empty_module_is_all_vacuous() {
        let store = FilamentStore::new();
        let pipeline = StandardPipeline::default();
        let result = run(&store, &[], &LiveStageHashes::default(), &pipeline);
        assert!(result.is_match());
        assert_eq!(result.vacuous_stages().count(), PIPELINE.len());
    }

    #[test]
    fn outcome_serializes_status_inline() {
        let (store, ids) = seeded();
        let pipeline = StandardPipeline::default();
        let result = run(&store, &ids, &LiveStageHashes::default(), &pipeline);
        let v = serde_json::to_value(&result.stages[0]).expect("json");
        assert_eq!(v["stage"], "facts");
        assert_eq!(v["status"], "divergence");
        assert_eq!(v["keys"], json!(["facts"]));
    }
}
