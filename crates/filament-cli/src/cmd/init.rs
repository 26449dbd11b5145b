use std::io::Write as _;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use filament_core::config::load_project_config;
use filament_core::journal::Journal;
use serde::Serialize;

use crate::output::{OutputMode, fail, kv, render};

#[derive(Args, Debug)]
pub struct InitArgs {}

#[derive(Debug, Serialize)]
struct InitReport {
    dir: String,
    journal: String,
    created: bool,
}

/// Execute `fil init`. Creates, if missing:
///
/// ```text
/// .filament/
///   config.toml     (default project config)
///   journal.jsonl   (empty commit log)
/// ```
///
/// Re-running on an initialized project changes nothing.
///
/// # Errors
///
/// Returns an error if the directory or files cannot be written.
pub fn run_init(_args: &InitArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let timeout = load_project_config(project_root)?.journal.lock_timeout();
    let (journal, created) = Journal::init(project_root, timeout).map_err(|e| fail(output, &e))?;
    let report = InitReport {
        dir: journal.dir().display().to_string(),
        journal: journal.journal_path().display().to_string(),
        created,
    };
    render(output, &report, |r, w| {
        if r.created {
            writeln!(w, "Initialized filament project in {}", r.dir)
        } else {
            kv(w, "exists", &r.dir)
        }
    })
}
