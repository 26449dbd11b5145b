//! End-to-end coordination scenarios against an in-memory store, plus one
//! pass through the on-disk journal.
//!
//! Covers:
//!   - Overlapping proposals opening a conflict that blocks merge until an
//!     authority resolves it
//!   - Queue order independent of enqueue order
//!   - Resource replay over ten commits matching the live snapshot
//!   - Module replay and divergence recording after live drift
//!   - Persisting the whole flow and reloading it from disk

use std::collections::BTreeMap;
use std::time::Duration;

use filament_core::canon::{Blake3Digest, content_hash};
use filament_core::conflict::{ConflictRecord, check_no_silent_arbitration, resolve_conflict};
use filament_core::error::ErrorCode;
use filament_core::index::{CommitRange, build_index};
use filament_core::journal::Journal;
use filament_core::model::{
    Actor, CommitRef, FilamentId, OpContext, Operation, Resolution, Snapshot, StateWriteData,
};
use filament_core::queue::{EntryState, MergeQueue, enqueue, merge};
use filament_core::replay::{
    DivergenceRecord, LiveStageHashes, ModuleBudget, ModuleReplayRequest, Stage, StageInputs,
    StandardPipeline, divergence_records, live_stage_hashes, record_divergence, replay_filament,
    replay_module,
};
use filament_core::store::{FilamentStore, GENESIS_HASH};
use serde_json::{Value, json};

use generators::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write(store: &mut FilamentStore, filament: &str, ts: i64, writes: &[(&str, Value)]) {
    let commit = store
        .next_commit(
            &FilamentId::new_unchecked(filament),
            &OpContext::new(Actor::human("alice"), ts),
            Operation::StateWrite(StateWriteData {
                writes: writes
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
            }),
        )
        .expect("commit");
    store.append(commit).expect("append");
}

/// Ten commits: odd positions set `value`, even positions refresh `derived`.
fn ten_commit_resource(store: &mut FilamentStore, filament: &str) -> Snapshot {
    let mut expected = Snapshot::new();
    for i in 1..=10i64 {
        let (key, value) = if i % 2 == 1 {
            ("value", json!(i * 10))
        } else {
            ("derived", json!((i - 1) * 20))
        };
        write(store, filament, i, &[(key, value.clone())]);
        expected.insert(key.to_string(), value);
    }
    expected
}

// ---------------------------------------------------------------------------
// Merge queue and conflicts
// ---------------------------------------------------------------------------

#[test]
fn overlapping_proposals_require_arbitration() {
    let mut store = FilamentStore::new();
    enqueue(
        &mut store,
        entry("example", "pa", "task-A", &["A1", "B1"], GENESIS_HASH),
        &ctx(1),
    )
    .expect("enqueue a");
    let second = enqueue(
        &mut store,
        entry("example", "pb", "task-B", &["B1", "C1"], GENESIS_HASH),
        &ctx(2),
    )
    .expect("enqueue b");

    let conflict_id = res("example").conflict_filament_id(&pid("pa"), &pid("pb"));
    assert_eq!(conflict_id.as_str(), "conflict:example:pa+pb");
    assert_eq!(second.conflicts, vec![CommitRef::new(conflict_id.clone(), 0)]);

    let record = ConflictRecord::load(&store, &conflict_id).expect("record");
    assert_eq!(
        record.overlap.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        ["B1"]
    );
    assert!(!record.is_resolved());

    let queue = MergeQueue::load(&store, &res("example"));
    assert!(check_no_silent_arbitration(&queue, &ConflictRecord::all(&store)).is_empty());

    for p in ["pa", "pb"] {
        let err = merge(&mut store, &res("example"), &pid(p), &ctx(3)).expect_err("blocked");
        assert!(err.is_forbidden());
    }

    resolve_conflict(
        &mut store,
        &conflict_id,
        Resolution::Select { proposal_id: pid("pa") },
        Some(&lead()),
        &ctx(4),
    )
    .expect("resolve");
    let merged = merge(&mut store, &res("example"), &pid("pa"), &ctx(5)).expect("merge");

    let queue = MergeQueue::load(&store, &res("example"));
    assert_eq!(queue.state(&pid("pa")), Some(EntryState::Merged));
    assert_eq!(queue.state(&pid("pb")), Some(EntryState::Cancelled));
    assert!(queue.is_empty());

    let resource_commit = store.commit(&merged.resource_commit).expect("resource commit");
    assert_eq!(resource_commit.refs.inputs.len(), 1);
    assert!(store.verify().is_ok());
}

#[test]
fn queue_order_is_independent_of_arrival() {
    let arrivals = [
        ["pc", "pa", "pb"],
        ["pb", "pc", "pa"],
        ["pa", "pb", "pc"],
    ];
    for arrival in arrivals {
        let mut store = FilamentStore::new();
        for (i, p) in arrival.iter().enumerate() {
            let task = format!("task-{}", &p[1..].to_uppercase());
            let ts = i64::try_from(i).expect("small");
            enqueue(&mut store, entry("example", p, &task, &[*p], GENESIS_HASH), &ctx(ts))
                .expect("enqueue");
        }
        let queue = MergeQueue::load(&store, &res("example"));
        let order: Vec<&str> = queue
            .entries()
            .iter()
            .map(|e| e.entry.task_id.as_str())
            .collect();
        assert_eq!(order, ["task-A", "task-B", "task-C"], "arrival {arrival:?}");
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[test]
fn ten_commit_replay_matches_live_snapshot() {
    let mut store = FilamentStore::new();
    let expected = ten_commit_resource(&mut store, "doc");

    let index = build_index(store.all_commits());
    let doc = FilamentId::new_unchecked("doc");
    let live = store.live_state(&doc).expect("live").clone();
    let replay = replay_filament(&store, &doc, &index, CommitRange::all(), &live);

    assert!(replay.status.is_match());
    assert_eq!(replay.applied, 10);
    let expected_value = Value::Object(expected.into_iter().collect());
    assert_eq!(replay.replay_hash, content_hash(&expected_value));
    assert_eq!(replay.replay_hash, replay.live_hash);
}

#[test]
fn drift_is_reported_and_recorded_not_repaired() {
    let mut store = FilamentStore::new();
    ten_commit_resource(&mut store, "doc");
    let doc = FilamentId::new_unchecked("doc");
    let index = build_index(store.all_commits());

    let mut drifted = store.live_state(&doc).expect("live").clone();
    drifted.insert("derived".into(), json!(-1));
    let replay = replay_filament(&store, &doc, &index, CommitRange::all(), &drifted);
    assert!(!replay.status.is_match());

    let record =
        DivergenceRecord::for_resource(&doc, CommitRange::all(), &replay, 12).expect("record");
    assert_eq!(record.keys, ["derived"]);
    assert!(record.id.starts_with("div-"));

    let first = record_divergence(&mut store, record.clone(), &ctx(50)).expect("record");
    let again = record_divergence(&mut store, record, &ctx(51)).expect("record again");
    assert!(first.created);
    assert!(!again.created);
    assert_eq!(first.commit, again.commit);
    assert_eq!(divergence_records(&store).count(), 1);

    // the log itself still replays cleanly against its own projection
    let live = store.live_state(&doc).expect("live").clone();
    assert!(replay_filament(&store, &doc, &index, CommitRange::all(), &live).status.is_match());
}

#[test]
fn module_replay_over_two_resources() {
    let mut store = FilamentStore::new();
    write(&mut store, "alpha", 1, &[("owner", json!("bob")), ("pkt.a", json!(1))]);
    write(&mut store, "beta", 2, &[("owner", json!("bob")), ("size", json!(3.50))]);
    let filaments = vec![FilamentId::new_unchecked("alpha"), FilamentId::new_unchecked("beta")];

    let pipeline = StandardPipeline::with_packet_prefix("pkt.");
    let live = live_stage_hashes(
        &pipeline,
        &StageInputs::from_live(&store, &filaments),
        &Blake3Digest,
    );
    let index = build_index(store.all_commits());
    let request = ModuleReplayRequest {
        filaments: &filaments,
        index: &index,
        range: CommitRange::all(),
        live: &live,
        deriver: &pipeline,
        budget: ModuleBudget::default(),
        digest: &Blake3Digest,
    };
    let replay = replay_module(&store, &request);
    assert!(replay.is_match());
    assert!(replay.within_budget);
    assert_eq!(replay.rows, 4);
    assert_eq!(replay.vacuous_stages().count(), 0);

    let mut tampered: LiveStageHashes = live.clone();
    tampered.set(Stage::Matches, Some("blake3:00".into()));
    let request = ModuleReplayRequest {
        live: &tampered,
        ..request
    };
    let replay = replay_module(&store, &request);
    let divergent: Vec<_> = replay.divergent_stages().map(|s| s.stage).collect();
    assert_eq!(divergent, [Stage::Matches]);
    let records = DivergenceRecord::for_module("team", CommitRange::all(), &replay, 12);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].scope, "team/matches");
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[test]
fn journal_round_trip_preserves_queue_and_conflicts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (journal, _) = Journal::init(dir.path(), Duration::from_secs(1)).expect("init");

    journal
        .transact(|s| {
            enqueue(s, entry("example", "pa", "task-A", &["A1", "B1"], GENESIS_HASH), &ctx(1))?;
            enqueue(s, entry("example", "pb", "task-B", &["B1", "C1"], GENESIS_HASH), &ctx(2))?;
            Ok(())
        })
        .expect("enqueue");

    let conflict_id = res("example").conflict_filament_id(&pid("pa"), &pid("pb"));
    let err = journal
        .transact(|s| merge(s, &res("example"), &pid("pa"), &ctx(3)))
        .expect_err("unarbitrated");
    assert_eq!(err.code(), ErrorCode::UnarbitratedConflict);

    journal
        .transact(|s| {
            resolve_conflict(
                s,
                &conflict_id,
                Resolution::Fork { proposal_id: pid("pb") },
                Some(&lead()),
                &ctx(4),
            )
        })
        .expect("fork");
    journal
        .transact(|s| merge(s, &res("example"), &pid("pa"), &ctx(5)))
        .expect("merge");

    let store = journal.load().expect("load");
    assert!(store.verify().is_ok());
    let queue = MergeQueue::load(&store, &res("example"));
    assert_eq!(queue.state(&pid("pa")), Some(EntryState::Merged));
    assert_eq!(queue.state(&pid("pb")), Some(EntryState::Cancelled));
    assert!(ConflictRecord::load(&store, &conflict_id).expect("record").is_resolved());

    let branch = store
        .live_state(&FilamentId::new_unchecked("example~pb"))
        .expect("branch state");
    assert_eq!(branch.get("pb.done"), Some(&json!(true)));
    let main: &BTreeMap<String, Value> = store
        .live_state(&res("example").filament_id())
        .expect("main state");
    assert_eq!(main.get("pa.done"), Some(&json!(true)));
    assert!(main.get("pb.done").is_none());
}
