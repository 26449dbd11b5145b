//! Shared output layer: human text or stable JSON for every command.
//!
//! Commands build a serializable result and hand it to [`render`] with a
//! closure for the human form. Errors go to stderr through [`render_error`]
//! in the same mode, so agents parsing `--json` never see free text.

use std::io::{self, Write};

use filament_core::error::GraphError;
use filament_core::journal::JournalError;
use serde::Serialize;

/// Shared width for human separators.
pub const RULE_WIDTH: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Human }
    }

    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

pub fn rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = RULE_WIDTH)
}

pub fn section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    rule(w)
}

pub fn kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

/// A structured error with an optional hint and code.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
            error_code: None,
        }
    }
}

impl From<&GraphError> for CliError {
    fn from(err: &GraphError) -> Self {
        Self {
            message: err.to_string(),
            hint: err.hint().map(str::to_string),
            error_code: Some(err.code().code().to_string()),
        }
    }
}

impl From<&JournalError> for CliError {
    fn from(err: &JournalError) -> Self {
        Self {
            message: err.to_string(),
            hint: err.hint().map(str::to_string),
            error_code: Some(err.code().code().to_string()),
        }
    }
}

/// Render `value` as pretty JSON, or through `human_fn`.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Human => human_fn(value, &mut out)?,
    }
    Ok(())
}

/// Render an error to stderr.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(mode, error, &mut out)?;
    Ok(())
}

fn write_error(mode: OutputMode, error: &CliError, out: &mut dyn Write) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut *out, &serde_json::json!({ "error": error }))?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            writeln!(out, "error: {}", error.message)?;
            if let Some(hint) = &error.hint {
                writeln!(out, "  hint: {hint}")?;
            }
        }
    }
    Ok(())
}

/// An error that has already been written to stderr. `main` exits non-zero
/// without printing it again.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Reported(pub String);

/// Render `error` and turn it into a bail-out for `main`.
pub fn reject(mode: OutputMode, error: &CliError) -> anyhow::Error {
    if let Err(render_err) = render_error(mode, error) {
        return render_err;
    }
    let summary = error.error_code.as_deref().unwrap_or(&error.message);
    Reported(summary.to_string()).into()
}

/// Render a journal or graph failure and turn it into a bail-out.
pub fn fail(mode: OutputMode, err: &JournalError) -> anyhow::Error {
    reject(mode, &CliError::from(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_core::error::ErrorCode;

    #[test]
    fn json_flag_selects_mode() {
        assert!(OutputMode::from_json_flag(true).is_json());
        assert!(!OutputMode::from_json_flag(false).is_json());
    }

    #[test]
    fn journal_errors_carry_code_and_hint() {
        let err = JournalError::NotInitialized(std::path::PathBuf::from("/tmp/x"));
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some(ErrorCode::NotInitialized.code()));
        assert!(cli.hint.is_some_and(|h| h.contains("fil init")));
    }

    #[test]
    fn rejected_errors_are_marked_reported() {
        let err = JournalError::NotInitialized(std::path::PathBuf::from("/tmp/x"));
        let bail = fail(OutputMode::Json, &err);
        let reported = bail.downcast_ref::<Reported>().expect("reported");
        assert_eq!(reported.0, ErrorCode::NotInitialized.code());
    }

    #[test]
    fn json_error_is_wrapped() {
        let mut buf = Vec::new();
        write_error(OutputMode::Json, &CliError::new("boom"), &mut buf).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["error"]["message"], "boom");
        assert!(value["error"].get("hint").is_none());
    }

    #[test]
    fn human_error_shows_hint() {
        let mut buf = Vec::new();
        let mut err = CliError::new("nope");
        err.hint = Some("try again".into());
        write_error(OutputMode::Human, &err, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(text, "error: nope\n  hint: try again\n");
    }
}
