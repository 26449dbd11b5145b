//! `fil log`: commit history, globally or for one filament.

use std::io::Write as _;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use filament_core::canon::digest::truncate_hash;
use filament_core::index::build_index;
use filament_core::model::{Commit, FilamentId};
use serde::Serialize;

use super::Session;
use crate::output::{CliError, reject, render, section};

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Only show this filament.
    pub filament: Option<FilamentId>,

    /// Show at most the last N commits.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogRow {
    position: Option<u64>,
    commit: String,
    timestamp: String,
    timestamp_us: i64,
    actor: String,
    op: &'static str,
    commit_hash: String,
}

fn micros_to_rfc3339(us: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(us).map_or_else(|| us.to_string(), |ts| ts.to_rfc3339())
}

/// Execute `fil log`.
///
/// # Errors
///
/// Fails when the journal cannot be loaded or the filament does not exist.
pub fn run_log(args: &LogArgs, session: &Session) -> Result<()> {
    let store = session.load()?;
    let index = build_index(store.all_commits());

    let commits: Vec<&Commit> = match &args.filament {
        Some(id) => match store.filament(id) {
            Some(filament) => filament.commits().iter().collect(),
            None => {
                let msg = format!("no filament named {id}");
                return Err(reject(session.output, &CliError::new(msg)));
            }
        },
        None => store.appended_since(0).collect(),
    };
    let skip = args
        .limit
        .map_or(0, |limit| commits.len().saturating_sub(limit));

    let rows: Vec<LogRow> = commits
        .into_iter()
        .skip(skip)
        .map(|c| LogRow {
            position: index.get(&c.commit_hash),
            commit: c.commit_ref().to_string(),
            timestamp: micros_to_rfc3339(c.timestamp_us),
            timestamp_us: c.timestamp_us,
            actor: c.actor.to_string(),
            op: c.operation.tag(),
            commit_hash: c.commit_hash.clone(),
        })
        .collect();

    render(session.output, &rows, |rows, w| {
        if rows.is_empty() {
            return writeln!(w, "no commits");
        }
        section(w, "Commits")?;
        for row in rows {
            let position = row.position.map_or_else(|| "-".to_string(), |p| p.to_string());
            writeln!(
                w,
                "{position:>5}  {:<32} {:<20} {:<16} {}",
                row.commit,
                row.op,
                row.actor,
                truncate_hash(&row.commit_hash, 20)
            )?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::micros_to_rfc3339;

    #[test]
    fn timestamps_render_as_rfc3339() {
        assert_eq!(micros_to_rfc3339(0), "1970-01-01T00:00:00+00:00");
        assert_eq!(micros_to_rfc3339(1_500_000), "1970-01-01T00:00:01.500+00:00");
    }
}
