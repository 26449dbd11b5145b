//! Append-only divergence records.
//!
//! Replay reports divergence as data; recording it is the caller's choice.
//! A record lands on the `divergence:<scope>` filament under an id derived
//! from what was detected, so detecting the same mismatch again finds the
//! existing record instead of writing a second one.

use serde::{Deserialize, Serialize};

use super::module::ModuleReplay;
use super::resource::ResourceReplay;
use crate::canon::digest::truncate_hash;
use crate::error::{ErrorCode, GraphError};
use crate::index::CommitRange;
use crate::model::{CommitRef, FilamentId, OpContext, Operation};
use crate::store::FilamentStore;

/// Prefix length used when no configuration is supplied.
pub const DEFAULT_HASH_PREFIX_LEN: usize = 12;

/// Placeholder hash for a side that produced nothing.
const NOT_APPLICABLE: &str = "n/a";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub id: String,
    pub scope: String,
    pub range: CommitRange,
    /// Hash recomputed from the log.
    pub expected_hash: String,
    /// Hash of the live side.
    pub actual_hash: String,
    /// Differing keys or stage names.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// `div-` followed by 16 hex characters of BLAKE3 over the scope, the range
/// and the first `prefix_len` hex characters of each hash.
#[must_use]
pub fn divergence_id(
    scope: &str,
    range: CommitRange,
    expected_hash: &str,
    actual_hash: &str,
    prefix_len: usize,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(scope.as_bytes());
    hasher.update(&[0]);
    hasher.update(&range.from.to_be_bytes());
    hasher.update(&range.to.to_be_bytes());
    hasher.update(truncate_hash(expected_hash, prefix_len).as_bytes());
    hasher.update(&[0]);
    hasher.update(truncate_hash(actual_hash, prefix_len).as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("div-{}", &hex.as_str()[..16])
}

impl DivergenceRecord {
    #[must_use]
    pub fn new(
        scope: impl Into<String>,
        range: CommitRange,
        expected_hash: impl Into<String>,
        actual_hash: impl Into<String>,
        keys: Vec<String>,
        prefix_len: usize,
    ) -> Self {
        let scope = scope.into();
        let expected_hash = expected_hash.into();
        let actual_hash = actual_hash.into();
        Self {
            id: divergence_id(&scope, range, &expected_hash, &actual_hash, prefix_len),
            scope,
            range,
            expected_hash,
            actual_hash,
            keys,
        }
    }

    /// Record for a diverging resource replay. `None` on a match.
    #[must_use]
    pub fn for_resource(
        filament_id: &FilamentId,
        range: CommitRange,
        replay: &ResourceReplay,
        prefix_len: usize,
    ) -> Option<Self> {
        let super::resource::ReplayStatus::Divergence { keys } = &replay.status else {
            return None;
        };
        Some(Self::new(
            filament_id.as_str(),
            range,
            &replay.replay_hash,
            &replay.live_hash,
            keys.clone(),
            prefix_len,
        ))
    }

    /// One record per diverging stage, scoped `<scope>/<stage>`.
    #[must_use]
    pub fn for_module(
        scope: &str,
        range: CommitRange,
        replay: &ModuleReplay,
        prefix_len: usize,
    ) -> Vec<Self> {
        replay
            .divergent_stages()
            .map(|outcome| {
                Self::new(
                    format!("{scope}/{}", outcome.stage),
                    range,
                    outcome.replay_hash.as_deref().unwrap_or(NOT_APPLICABLE),
                    outcome.live_hash.as_deref().unwrap_or(NOT_APPLICABLE),
                    vec![outcome.stage.as_str().to_string()],
                    prefix_len,
                )
            })
            .collect()
    }

    /// The filament this record is appended to.
    #[must_use]
    pub fn filament_id(&self) -> FilamentId {
        FilamentId::divergence(&self.scope)
    }
}

/// Outcome of [`record_divergence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDivergence {
    pub commit: CommitRef,
    /// False when an identical record already existed.
    pub created: bool,
}

/// Append `record` to its divergence filament unless a record with the same
/// id is already there.
///
/// # Errors
///
/// Returns [`GraphError::Precondition`] if the scope cannot form a filament
/// id, or any append error.
pub fn record_divergence(
    store: &mut FilamentStore,
    record: DivergenceRecord,
    ctx: &OpContext,
) -> Result<RecordedDivergence, GraphError> {
    let filament_id = record.filament_id();
    if !filament_id.is_valid() {
        return Err(GraphError::precondition(
            ErrorCode::InvalidPayload,
            format!("divergence scope {:?} is not a valid filament name", record.scope),
        ));
    }

    if let Some(existing) = find_record(store, &filament_id, &record.id) {
        tracing::debug!(id = %record.id, commit = %existing, "divergence already recorded");
        return Ok(RecordedDivergence {
            commit: existing,
            created: false,
        });
    }

    let id = record.id.clone();
    let commit = store.next_commit(&filament_id, ctx, Operation::DivergenceRecorded(record))?;
    let commit = store.append(commit)?;
    tracing::info!(%id, commit = %commit, "divergence recorded");
    Ok(RecordedDivergence {
        commit,
        created: true,
    })
}

/// Every divergence record in the store, in filament order.
pub fn divergence_records(store: &FilamentStore) -> impl Iterator<Item = &DivergenceRecord> {
    store
        .filaments_of_kind(crate::model::FilamentKind::Divergence)
        .flat_map(|f| f.commits().iter())
        .filter_map(|c| match &c.operation {
            Operation::DivergenceRecorded(r) => Some(r),
            _ => None,
        })
}

fn find_record(store: &FilamentStore, filament_id: &FilamentId, id: &str) -> Option<CommitRef> {
    store.filament(filament_id)?.commits().iter().find_map(|c| match &c.operation {
        Operation::DivergenceRecorded(r) if r.id == id => Some(c.commit_ref()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Actor;

    fn ctx() -> OpContext {
        OpContext::new(Actor::system("replayer"), 5_000)
    }

    fn sample() -> DivergenceRecord {
        DivergenceRecord::new(
            "doc",
            CommitRange::new(0, 9),
            "blake3:aaaaaaaaaaaaaaaaffff",
            "blake3:bbbbbbbbbbbbbbbbffff",
            vec!["title".into()],
            DEFAULT_HASH_PREFIX_LEN,
        )
    }

    #[test]
    fn id_is_deterministic_and_prefix_sensitive() {
        let a = sample();
        let b = sample();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("div-"));
        assert_eq!(a.id.len(), 4 + 16);

        // Differences past the prefix do not change the id.
        let same = divergence_id(
            "doc",
            CommitRange::new(0, 9),
            "blake3:aaaaaaaaaaaa0000",
            "blake3:bbbbbbbbbbbb0000",
            12,
        );
        assert_eq!(same, a.id);

        let other_range = divergence_id(
            "doc",
            CommitRange::new(0, 8),
            "blake3:aaaaaaaaaaaa",
            "blake3:bbbbbbbbbbbb",
            12,
        );
        assert_ne!(other_range, a.id);
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let mut store = FilamentStore::new();
        let first = record_divergence(&mut store, sample(), &ctx()).expect("record");
        assert!(first.created);
        let second = record_divergence(&mut store, sample(), &ctx()).expect("record again");
        assert!(!second.created);
        assert_eq!(first.commit, second.commit);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store
                .filament(&FilamentId::new_unchecked("divergence:doc"))
                .expect("filament")
                .kind,
            crate::model::FilamentKind::Divergence
        );
        assert_eq!(divergence_records(&store).count(), 1);
    }

    #[test]
    fn scope_with_whitespace_is_rejected() {
        let mut store = FilamentStore::new();
        let mut record = sample();
        record.scope = "bad scope".into();
        assert!(record_divergence(&mut store, record, &ctx()).is_err());
        assert!(store.is_empty());
    }
}
