//! User defaults: serial link and external runner settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::ConfigError;

/// Runner package used by `fwci schedule` when none is configured.
pub const DEFAULT_RUNNER_PACKAGE: &str = "@nordicsemiconductor/firmware-ci-runner-azure";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial device link settings
    pub link: LinkSettings,
    /// External runner settings
    pub runner: RunnerSettings,
}

impl AppConfig {
    /// Path of the defaults file inside the config directory
    pub fn default_path() -> Option<PathBuf> {
        super::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load config from a TOML file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

}

/// Serial device link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Serial port carrying the device log (e.g. /dev/ttyACM0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Seconds without a log line before the link reports a read timeout
    pub read_timeout_seconds: u64,
    /// Flash command; `{hexfile}` and `{device}` are substituted
    pub flash_command: String,
    /// Credential provisioning command; receives the credentials JSON on stdin
    pub credentials_command: Option<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            read_timeout_seconds: 300,
            flash_command: "nrfjprog --program {hexfile} --sectoranywhere --verify -r --snr {device}"
                .to_string(),
            credentials_command: None,
        }
    }
}

/// External runner settings for the supervised variant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Launcher executable
    pub program: String,
    /// Runner package handed to the launcher; `None` uses [`DEFAULT_RUNNER_PACKAGE`]
    pub package: Option<String>,
    /// Extra arguments appended after the package
    pub args: Vec<String>,
    /// Total attempt budget
    pub tries: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            package: None,
            args: Vec::new(),
            tries: 3,
        }
    }
}

impl RunnerSettings {
    /// Package that will actually be run
    pub fn package(&self) -> &str {
        self.package.as_deref().unwrap_or(DEFAULT_RUNNER_PACKAGE)
    }

    /// Full argument list for the launcher
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![self.package().to_string()];
        args.extend(self.args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_default_package() {
        let runner = RunnerSettings::default();
        assert_eq!(runner.package(), DEFAULT_RUNNER_PACKAGE);
        assert_eq!(runner.command_args(), vec![DEFAULT_RUNNER_PACKAGE.to_string()]);
    }

    #[test]
    fn test_runner_package_override() {
        let runner = RunnerSettings {
            package: Some("my-runner@2".to_string()),
            args: vec!["--verbose".to_string()],
            ..Default::default()
        };
        assert_eq!(runner.command_args(), vec!["my-runner@2", "--verbose"]);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("[link]\nport = \"/dev/ttyUSB3\"\n").unwrap();
        assert_eq!(config.link.port, "/dev/ttyUSB3");
        assert_eq!(config.link.baud_rate, 115_200);
        assert_eq!(config.runner.tries, 3);
    }
}
