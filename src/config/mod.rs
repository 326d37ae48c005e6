//! Configuration module
//!
//! Handles user defaults (link and runner settings) and the per-session
//! job description.

mod job;
mod settings;

pub use job::{
    patterns_from_multiline, AtHostImages, ConfigError, JobFormat, PatternList, PowerCycle, RawJob,
    SessionConfig, DEFAULT_END_ON_WAIT_SECONDS, THINGY91_TARGET,
};
pub use settings::{AppConfig, LinkSettings, RunnerSettings, DEFAULT_RUNNER_PACKAGE};

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "fwci", "fwci")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}
