//! `fil replay`: rebuild state from the log and compare it with live state.
//!
//! Resource mode replays each filament on its own. `--module <scope>` feeds
//! the replayed resources through the derivation pipeline and compares
//! per-stage hashes. Either way a divergence is reported, optionally
//! recorded with `--record`, and never repaired.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Args;
use filament_core::canon::ContentDigest;
use filament_core::canon::digest::truncate_hash;
use filament_core::index::{CommitRange, build_index};
use filament_core::model::{FilamentId, FilamentKind, OpContext, Snapshot};
use filament_core::replay::{
    DivergenceRecord, LiveStageHashes, ModuleBudget, ModuleReplay, ModuleReplayRequest,
    ReplayStatus, ResourceReplay, StageInputs, StandardPipeline, live_for_range,
    live_stage_hashes, record_divergence, replay_module, replay_resource_with,
};
use filament_core::store::FilamentStore;
use serde::Serialize;

use super::{Identity, Session};
use crate::output::{CliError, Reported, reject, render, section};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Filaments to replay. Defaults to every resource filament.
    pub filaments: Vec<FilamentId>,

    /// First global commit index to include.
    #[arg(long)]
    pub from: Option<u64>,

    /// Last global commit index to include.
    #[arg(long)]
    pub to: Option<u64>,

    /// Replay as one module under this scope and compare stage hashes.
    #[arg(long, value_name = "SCOPE")]
    pub module: Option<String>,

    /// Key prefix the `packets` stage selects. Without it the stage is not
    /// applicable.
    #[arg(long)]
    pub packet_prefix: Option<String>,

    /// Live side to compare against instead of the journal's projection.
    /// Resource mode: `{"<filament>": {<state>}}`. Module mode: stage hashes.
    #[arg(long, value_name = "FILE")]
    pub live: Option<PathBuf>,

    /// Append a divergence record for every mismatch.
    #[arg(long)]
    pub record: bool,
}

impl ReplayArgs {
    fn range(&self) -> CommitRange {
        CommitRange::new(self.from.unwrap_or(0), self.to.unwrap_or(u64::MAX))
    }

    fn pipeline(&self) -> StandardPipeline {
        self.packet_prefix
            .as_ref()
            .map_or_else(StandardPipeline::default, |p| {
                StandardPipeline::with_packet_prefix(p.as_str())
            })
    }
}

#[derive(Debug, Serialize)]
struct ResourceRow {
    filament: FilamentId,
    #[serde(flatten)]
    replay: ResourceReplay,
    #[serde(skip_serializing_if = "Option::is_none")]
    divergence: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResourceReport {
    range: CommitRange,
    resources: Vec<ResourceRow>,
}

#[derive(Debug, Serialize)]
struct ModuleReport {
    scope: String,
    range: CommitRange,
    #[serde(flatten)]
    replay: ModuleReplay,
    divergences: Vec<String>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn default_filaments(store: &FilamentStore) -> Vec<FilamentId> {
    store
        .filaments_of_kind(FilamentKind::Resource)
        .map(|f| f.id.clone())
        .collect()
}

/// Append `records` in one journal transaction and return their ids.
fn record_all(
    session: &Session,
    records: Vec<DivergenceRecord>,
    ctx: &OpContext,
) -> Result<Vec<String>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    session.transact(|store| {
        records
            .into_iter()
            .map(|record| {
                let id = record.id.clone();
                record_divergence(store, record, ctx).map(|_| id)
            })
            .collect()
    })
}

/// Execute `fil replay`. Exits non-zero when anything diverged.
///
/// # Errors
///
/// Fails when the journal or `--live` file cannot be read, a named filament
/// does not exist, or replay diverged.
pub fn run_replay(args: &ReplayArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let store = session.load()?;
    let filaments = if args.filaments.is_empty() {
        default_filaments(&store)
    } else {
        args.filaments.clone()
    };
    if let Some(missing) = filaments.iter().find(|f| store.filament(f).is_none()) {
        let msg = format!("no filament named {missing}");
        return Err(reject(session.output, &CliError::new(msg)));
    }
    // Resolve the actor before replaying so a missing identity fails fast.
    let ctx = if args.record {
        Some(session.context(identity)?)
    } else {
        None
    };

    let diverged = match &args.module {
        Some(scope) => run_module(args, session, &store, &filaments, scope, ctx.as_ref())?,
        None => run_resources(args, session, &store, &filaments, ctx.as_ref())?,
    };
    if diverged {
        return Err(Reported("replay diverged".to_string()).into());
    }
    Ok(())
}

fn run_resources(
    args: &ReplayArgs,
    session: &Session,
    store: &FilamentStore,
    filaments: &[FilamentId],
    ctx: Option<&OpContext>,
) -> Result<bool> {
    let digest: &dyn ContentDigest = session.config.project.digest.algorithm.digest();
    let prefix_len = session.config.project.divergence.hash_prefix_len;
    let overrides: BTreeMap<FilamentId, Snapshot> = match &args.live {
        Some(path) => read_json(path)?,
        None => BTreeMap::new(),
    };
    let range = args.range();
    let index = build_index(store.all_commits());

    let replays: Vec<(FilamentId, ResourceReplay)> = filaments
        .iter()
        .map(|id| {
            let live = overrides.get(id).map_or_else(
                || live_for_range(store, id, &index, range),
                Cow::Borrowed,
            );
            let commits = store.filament(id).map(|f| f.commits()).unwrap_or_default();
            (id.clone(), replay_resource_with(commits, &index, range, &live, digest))
        })
        .collect();

    let records: Vec<DivergenceRecord> = replays
        .iter()
        .filter_map(|(id, replay)| DivergenceRecord::for_resource(id, range, replay, prefix_len))
        .collect();
    let diverged = !records.is_empty();
    let by_scope: BTreeMap<String, String> = records
        .iter()
        .map(|r| (r.scope.clone(), r.id.clone()))
        .collect();
    if let Some(ctx) = ctx {
        record_all(session, records, ctx)?;
    }

    let report = ResourceReport {
        range,
        resources: replays
            .into_iter()
            .map(|(filament, replay)| ResourceRow {
                divergence: by_scope.get(filament.as_str()).cloned(),
                filament,
                replay,
            })
            .collect(),
    };
    render(session.output, &report, |r, w| {
        section(w, &format!("Replay {}", r.range))?;
        for row in &r.resources {
            match &row.replay.status {
                ReplayStatus::Match => writeln!(
                    w,
                    "{:<24} match     {} ({} commits)",
                    row.filament,
                    truncate_hash(&row.replay.replay_hash, 16),
                    row.replay.applied
                )?,
                ReplayStatus::Divergence { keys } => writeln!(
                    w,
                    "{:<24} DIVERGED  replay {} live {} keys {}",
                    row.filament,
                    truncate_hash(&row.replay.replay_hash, 16),
                    truncate_hash(&row.replay.live_hash, 16),
                    keys.join(",")
                )?,
            }
            if let Some(id) = &row.divergence {
                writeln!(w, "{:<24} record    {id}", "")?;
            }
            if !row.replay.excluded.is_empty() {
                writeln!(
                    w,
                    "{:<24} excluded  {} unindexed commits",
                    "",
                    row.replay.excluded.len()
                )?;
            }
        }
        Ok(())
    })?;
    Ok(diverged)
}

fn run_module(
    args: &ReplayArgs,
    session: &Session,
    store: &FilamentStore,
    filaments: &[FilamentId],
    scope: &str,
    ctx: Option<&OpContext>,
) -> Result<bool> {
    let project = &session.config.project;
    let digest: &dyn ContentDigest = project.digest.algorithm.digest();
    let pipeline = args.pipeline();
    let range = args.range();
    let index = build_index(store.all_commits());
    let live: LiveStageHashes = match &args.live {
        Some(path) => read_json(path)?,
        None => live_stage_hashes(
            &pipeline,
            &StageInputs::for_range(store, filaments, &index, range),
            digest,
        ),
    };
    let request = ModuleReplayRequest {
        filaments,
        index: &index,
        range,
        live: &live,
        deriver: &pipeline,
        budget: ModuleBudget::from(&project.replay),
        digest,
    };
    let replay = replay_module(store, &request);

    let records =
        DivergenceRecord::for_module(scope, range, &replay, project.divergence.hash_prefix_len);
    let diverged = !records.is_empty();
    let divergences = match ctx {
        Some(ctx) => record_all(session, records, ctx)?,
        None => records.into_iter().map(|r| r.id).collect(),
    };

    let report = ModuleReport {
        scope: scope.to_string(),
        range,
        replay,
        divergences,
    };
    render(session.output, &report, |r, w| {
        section(w, &format!("Module {} {}", r.scope, r.range))?;
        for stage in &r.replay.stages {
            let status = match (&stage.status, stage.vacuous) {
                (ReplayStatus::Match, true) => "match (n/a)",
                (ReplayStatus::Match, false) => "match",
                (ReplayStatus::Divergence { .. }, _) => "DIVERGED",
            };
            writeln!(
                w,
                "{:<12} {:<12} {:>8} rows  {}",
                stage.stage.as_str(),
                status,
                stage.rows,
                stage.replay_hash.as_deref().map_or("-", |h| truncate_hash(h, 16))
            )?;
        }
        writeln!(
            w,
            "{} rows in {}us{}",
            r.replay.rows,
            r.replay.elapsed.as_micros(),
            if r.replay.within_budget { "" } else { " (over budget)" }
        )?;
        for id in &r.divergences {
            writeln!(w, "divergence   {id}")?;
        }
        Ok(())
    })?;
    Ok(diverged)
}
