//! Log artifacts and caller outputs
//!
//! Whatever was captured up to the resolution is written out, whichever way
//! the session ended.

use crate::config::SessionConfig;
use crate::core::outcome::Outcome;
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Environment variable naming the CI outputs file
pub const GITHUB_OUTPUT_ENV: &str = "GITHUB_OUTPUT";

/// Artifact write failure
#[derive(Error, Debug)]
#[error("Failed to write {path}: {source}")]
pub struct ArtifactError {
    /// Target file
    pub path: PathBuf,
    /// Underlying error
    #[source]
    pub source: std::io::Error,
}

/// The three flags reported to the invoking CI step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallerOutputs {
    /// Connection was established
    pub connected: bool,
    /// Session was aborted
    pub abort: bool,
    /// Session timed out
    pub timeout: bool,
}

impl CallerOutputs {
    /// Outputs for a session that never connected
    pub fn not_connected() -> Self {
        Self {
            connected: false,
            abort: false,
            timeout: false,
        }
    }
}

impl From<&Outcome> for CallerOutputs {
    fn from(outcome: &Outcome) -> Self {
        Self {
            connected: outcome.connected,
            abort: outcome.aborted,
            timeout: outcome.timed_out,
        }
    }
}

impl fmt::Display for CallerOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connected={}", self.connected)?;
        writeln!(f, "abort={}", self.abort)?;
        writeln!(f, "timeout={}", self.timeout)
    }
}

fn create_parent(path: &Path) -> Result<(), ArtifactError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| ArtifactError {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Write `lines` joined by `'\n'`, creating parent directories
pub fn write_lines(path: &Path, lines: &[String]) -> Result<(), ArtifactError> {
    create_parent(path)?;
    std::fs::write(path, lines.join("\n")).map_err(|source| ArtifactError {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), lines = lines.len(), "artifact written");
    Ok(())
}

/// Write the device and flash logs to the locations `config` names
pub fn write_log_artifacts(config: &SessionConfig, outcome: &Outcome) -> Result<(), ArtifactError> {
    if let Some(path) = &config.device_log_output {
        write_lines(path, &outcome.device_log)?;
    }
    if let Some(path) = &config.flash_log_output {
        write_lines(path, &outcome.flash_log)?;
    }
    Ok(())
}

/// Append `outputs` as `name=value` lines to `path`
pub fn append_outputs(path: &Path, outputs: &CallerOutputs) -> Result<(), ArtifactError> {
    let to_err = |source| ArtifactError {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_err)?;
    write!(file, "{outputs}").map_err(to_err)
}

/// Append `outputs` to the file named by `$GITHUB_OUTPUT`, if set
pub fn publish_outputs(outputs: &CallerOutputs) -> Result<Option<PathBuf>, ArtifactError> {
    match std::env::var_os(GITHUB_OUTPUT_ENV) {
        Some(path) if !path.is_empty() => {
            let path = PathBuf::from(path);
            append_outputs(&path, outputs)?;
            Ok(Some(path))
        }
        _ => Ok(None),
    }
}
