use std::fs;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use filament_core::evidence::{EvidenceCategory, describe_bytes, record_evidence};
use filament_core::model::FilamentId;
use serde::Serialize;

use super::{Identity, Session};
use crate::output::{kv, render};

#[derive(Args, Debug)]
pub struct EvidenceArgs {
    /// File to import.
    pub file: PathBuf,

    /// Evidence filament to append to.
    #[arg(long)]
    pub id: FilamentId,
}

#[derive(Debug, Serialize)]
struct EvidenceReport {
    commit: String,
    content_hash: String,
    size: u64,
    category: EvidenceCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute `fil evidence`: describe a file's bytes and append the result to
/// an evidence filament. Other commits cite it with `--evidence <ref>`.
///
/// # Errors
///
/// Fails when the file cannot be read or `--id` names a non-evidence
/// filament.
pub fn run_evidence(args: &EvidenceArgs, session: &Session, identity: Identity<'_>) -> Result<()> {
    let bytes = fs::read(&args.file).with_context(|| format!("read {}", args.file.display()))?;
    let data = describe_bytes(&bytes);
    let ctx = session.context(identity)?;

    let (content_hash, size, category, error) =
        (data.content_hash.clone(), data.size, data.category, data.error.clone());
    let commit = session.transact(|store| record_evidence(store, &args.id, data, &ctx))?;
    let report = EvidenceReport {
        commit: commit.to_string(),
        content_hash,
        size,
        category,
        error,
    };

    render(session.output, &report, |r, w| {
        kv(w, "commit", &r.commit)?;
        kv(w, "hash", &r.content_hash)?;
        kv(w, "size", r.size.to_string())?;
        kv(w, "category", format!("{:?}", r.category).to_lowercase())?;
        if let Some(error) = &r.error {
            kv(w, "note", error)?;
        }
        Ok(())
    })
}
