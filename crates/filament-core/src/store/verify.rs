//! Whole-store integrity scan.
//!
//! Append already enforces these rules, so a clean in-memory store always
//! passes. The scan exists for stores that were loaded from disk or built
//! by code that bypassed [`FilamentStore::append`].

use serde::Serialize;

use super::FilamentStore;
use crate::model::CommitRef;

/// One integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityProblem {
    pub commit: CommitRef,
    pub detail: String,
}

/// Result of [`FilamentStore::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Number of commits inspected.
    pub checked: usize,
    pub problems: Vec<IntegrityProblem>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

impl FilamentStore {
    /// Recompute every commit hash and re-check index continuity and ref
    /// resolution.
    #[must_use]
    pub fn verify(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        for filament in self.filaments() {
            for (position, commit) in filament.commits().iter().enumerate() {
                report.checked += 1;
                let here = commit.commit_ref();
                let mut problem = |detail: String| {
                    report.problems.push(IntegrityProblem {
                        commit: here.clone(),
                        detail,
                    });
                };

                if commit.commit_index != position as u64 {
                    problem(format!(
                        "commit_index {} stored at position {position}",
                        commit.commit_index
                    ));
                }

                match commit.compute_hash() {
                    Ok(expected) if expected == commit.commit_hash => {}
                    Ok(expected) => problem(format!(
                        "hash mismatch: stored={} expected={expected}",
                        commit.commit_hash
                    )),
                    Err(e) => problem(format!("hash could not be computed: {e}")),
                }

                for target in commit.all_refs() {
                    let backward = target.filament_id != commit.filament_id
                        || target.commit_index < commit.commit_index;
                    if !backward || !self.contains(target) {
                        problem(format!("unresolved ref {target}"));
                    }
                }
            }
        }

        if !report.is_ok() {
            tracing::warn!(
                problems = report.problems.len(),
                checked = report.checked,
                "store integrity scan found problems"
            );
        }
        report
    }
}
