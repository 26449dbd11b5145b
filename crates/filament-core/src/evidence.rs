//! Evidence filaments for externally supplied artifacts.
//!
//! The importer boundary never rejects input. Content that cannot be
//! recognized or parsed still produces a minimal [`EvidenceData`] carrying
//! the error, so every artifact handed to the graph has a record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canon::{Blake3Digest, ContentDigest};
use crate::error::{ErrorCode, GraphError};
use crate::model::{CommitRef, FilamentId, FilamentKind, OpContext, Operation, TrustLevel};
use crate::store::FilamentStore;

/// Longest text excerpt kept in `extracted`, in characters.
pub const MAX_EXTRACTED_CHARS: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceCategory {
    Empty,
    Json,
    Text,
    Image,
    Pdf,
    Archive,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceData {
    /// Digest of the raw bytes.
    pub content_hash: String,
    pub size: u64,
    pub category: EvidenceCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<Value>,
    /// Why extraction failed or was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvidenceData {
    /// # Errors
    ///
    /// Returns [`GraphError::Precondition`] when `content_hash` is not an
    /// `<algorithm>:<hex>` string.
    pub fn validate(&self) -> Result<(), GraphError> {
        match self.content_hash.split_once(':') {
            Some((algo, hex)) if !algo.is_empty() && !hex.is_empty() => Ok(()),
            _ => Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("evidence content hash {:?} is malformed", self.content_hash),
            )),
        }
    }
}

/// Describe raw bytes. Never fails.
#[must_use]
pub fn describe_bytes(bytes: &[u8]) -> EvidenceData {
    let mut data = EvidenceData {
        content_hash: Blake3Digest.digest(bytes),
        size: bytes.len() as u64,
        category: EvidenceCategory::Binary,
        extracted: None,
        error: None,
    };

    if bytes.is_empty() {
        data.category = EvidenceCategory::Empty;
        return data;
    }
    if let Some(category) = sniff_magic(bytes) {
        data.category = category;
        return data;
    }

    let Ok(text) = std::str::from_utf8(bytes) else {
        data.error = Some("unrecognized binary content".to_string());
        return data;
    };

    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                data.category = EvidenceCategory::Json;
                data.extracted = Some(value);
                return data;
            }
            Err(e) => data.error = Some(format!("malformed json: {e}")),
        }
    }

    data.category = EvidenceCategory::Text;
    let excerpt: String = text.chars().take(MAX_EXTRACTED_CHARS).collect();
    if excerpt.len() < text.len() && data.error.is_none() {
        data.error = Some(format!("text truncated to {MAX_EXTRACTED_CHARS} characters"));
    }
    data.extracted = Some(Value::String(excerpt));
    data
}

fn sniff_magic(bytes: &[u8]) -> Option<EvidenceCategory> {
    const SIGNATURES: &[(&[u8], EvidenceCategory)] = &[
        (b"\x89PNG\r\n\x1a\n", EvidenceCategory::Image),
        (b"\xff\xd8\xff", EvidenceCategory::Image),
        (b"GIF8", EvidenceCategory::Image),
        (b"%PDF-", EvidenceCategory::Pdf),
        (b"PK\x03\x04", EvidenceCategory::Archive),
        (b"\x1f\x8b", EvidenceCategory::Archive),
    ];
    SIGNATURES
        .iter()
        .find(|(magic, _)| bytes.starts_with(magic))
        .map(|(_, category)| *category)
}

/// Append `data` as the next commit of the evidence filament `filament_id`.
///
/// Records without an extraction error are stamped
/// [`TrustLevel::Attested`]; the rest stay unverified.
///
/// # Errors
///
/// Returns [`GraphError::Precondition`] if `filament_id` already names a
/// non-evidence filament, or any append error.
pub fn record_evidence(
    store: &mut FilamentStore,
    filament_id: &FilamentId,
    data: EvidenceData,
    ctx: &OpContext,
) -> Result<CommitRef, GraphError> {
    match store.filament(filament_id).map(|f| f.kind) {
        Some(kind) if kind != FilamentKind::Evidence => {
            return Err(GraphError::precondition(
                ErrorCode::InvalidPayload,
                format!("{filament_id} is a {kind} filament, not evidence"),
            ));
        }
        _ => {}
    }

    let trust = if data.error.is_none() {
        TrustLevel::Attested
    } else {
        TrustLevel::Unverified
    };
    let category = data.category;
    let commit = store
        .next_commit(filament_id, ctx, Operation::EvidenceImport(data))?
        .with_trust(trust);
    let commit_ref = store.append(commit)?;
    tracing::debug!(commit = %commit_ref, ?category, "evidence recorded");
    Ok(commit_ref)
}
