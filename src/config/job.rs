//! Job description and the validated session configuration built from it

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Grace period after the end patterns have been seen, when unset
pub const DEFAULT_END_ON_WAIT_SECONDS: u64 = 60;

/// Build target that selects the Thingy:91 AT-host image
pub const THINGY91_TARGET: &str = "thingy91_nrf9160ns";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Failed to access {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File content is malformed
    #[error("Failed to parse {path}: {message}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Required field is absent
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    /// Field has an unusable value
    #[error("Invalid setting {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Job file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFormat {
    /// TOML
    Toml,
    /// YAML
    Yaml,
    /// JSON
    Json,
}

impl JobFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::Toml,
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Json,
        }
    }
}

/// Patterns given either as a list or as one multi-line string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternList {
    /// One pattern per entry
    Lines(Vec<String>),
    /// One pattern per line
    Multiline(String),
}

impl PatternList {
    fn into_patterns(self) -> Option<Vec<String>> {
        match self {
            Self::Lines(lines) if lines.is_empty() => None,
            Self::Lines(lines) => Some(lines),
            Self::Multiline(s) => patterns_from_multiline(&s),
        }
    }
}

/// Split a multi-line input into patterns after trimming the input as a
/// whole; an empty input disables the rule.
pub fn patterns_from_multiline(s: &str) -> Option<Vec<String>> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.split('\n').map(str::to_string).collect())
    }
}

/// Power-cycle plan run before connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCycle {
    /// Plan is active
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Command that cuts power
    pub off_cmd: String,
    /// Command that restores power
    pub on_cmd: String,
    /// Settle delay after switching off
    #[serde(default)]
    pub wait_seconds_after_off: u64,
    /// Settle delay after switching on
    #[serde(default)]
    pub wait_seconds_after_on: u64,
}

fn default_true() -> bool {
    true
}

/// Neutral AT-host images the device is returned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtHostImages {
    /// Image for the Thingy:91
    pub thingy91: PathBuf,
    /// Image for the nRF9160 DK
    pub nrf9160dk: PathBuf,
}

impl Default for AtHostImages {
    fn default() -> Self {
        Self {
            thingy91: PathBuf::from("at_host/thingy91_nrf9160ns_at_host.hex"),
            nrf9160dk: PathBuf::from("at_host/nrf9160dk_nrf9160ns_at_host.hex"),
        }
    }
}

/// Job description as read from a file or the command line.
///
/// Every field is optional so that sources can be layered with [`RawJob::merge`];
/// [`SessionConfig::try_from`] does the validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawJob {
    /// Device under test
    pub device_id: Option<String>,
    /// Firmware version
    pub app_version: Option<String>,
    /// Build target
    pub target: Option<String>,
    /// Network mode
    pub network: Option<String>,
    /// Modem security tag
    pub sec_tag: Option<u32>,
    /// Session timeout in minutes
    pub timeout_minutes: Option<u64>,
    /// Firmware image
    pub hex_file: Option<PathBuf>,
    /// FOTA image
    pub fota_file: Option<PathBuf>,
    /// Abort patterns
    pub abort_on: Option<PatternList>,
    /// End patterns
    pub end_on: Option<PatternList>,
    /// Grace period after the end patterns
    pub end_on_wait_seconds: Option<u64>,
    /// Credentials directory
    pub certificate_location: Option<PathBuf>,
    /// Device log artifact
    pub device_log_output: Option<PathBuf>,
    /// Flash log artifact
    pub flash_log_output: Option<PathBuf>,
    /// Test environment settings
    pub test_env: BTreeMap<String, String>,
    /// Power-cycle plan
    pub power_cycle: Option<PowerCycle>,
    /// AT-host images
    pub at_host: Option<AtHostImages>,
}

impl RawJob {
    /// Load a job file, picking the format from its extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, JobFormat::from_path(path)).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse job content in the given format
    pub fn parse(content: &str, format: JobFormat) -> Result<Self, String> {
        match format {
            JobFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            JobFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            JobFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        }
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    #[must_use]
    pub fn merge(self, overrides: RawJob) -> Self {
        let mut test_env = self.test_env;
        test_env.extend(overrides.test_env);

        Self {
            device_id: overrides.device_id.or(self.device_id),
            app_version: overrides.app_version.or(self.app_version),
            target: overrides.target.or(self.target),
            network: overrides.network.or(self.network),
            sec_tag: overrides.sec_tag.or(self.sec_tag),
            timeout_minutes: overrides.timeout_minutes.or(self.timeout_minutes),
            hex_file: overrides.hex_file.or(self.hex_file),
            fota_file: overrides.fota_file.or(self.fota_file),
            abort_on: overrides.abort_on.or(self.abort_on),
            end_on: overrides.end_on.or(self.end_on),
            end_on_wait_seconds: overrides.end_on_wait_seconds.or(self.end_on_wait_seconds),
            certificate_location: overrides.certificate_location.or(self.certificate_location),
            device_log_output: overrides.device_log_output.or(self.device_log_output),
            flash_log_output: overrides.flash_log_output.or(self.flash_log_output),
            test_env,
            power_cycle: overrides.power_cycle.or(self.power_cycle),
            at_host: overrides.at_host.or(self.at_host),
        }
    }
}

/// Immutable parameters of one test session.
///
/// Built once from a [`RawJob`] and shared read-only afterwards. Its JSON
/// serialization is the job description handed to an external runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Device under test (probe serial number)
    pub device_id: String,
    /// Firmware version being tested
    pub app_version: Option<String>,
    /// Build target
    pub target: String,
    /// Cellular network mode
    pub network: Option<String>,
    /// Modem security tag for the credentials
    pub sec_tag: Option<u32>,
    /// Overall session timeout in minutes
    pub timeout_minutes: u64,
    /// Firmware image under test
    pub hex_file: PathBuf,
    /// FOTA image, handed through to the runner
    pub fota_file: Option<PathBuf>,
    /// Patterns that abort the session once all are seen
    pub abort_on: Option<Vec<String>>,
    /// Patterns that end the session once all are seen
    pub end_on: Option<Vec<String>>,
    /// Seconds to keep capturing after the end patterns were seen
    pub end_on_wait_seconds: u64,
    /// Directory holding `device-<device_id>.json`
    pub certificate_location: Option<PathBuf>,
    /// Device log artifact
    pub device_log_output: Option<PathBuf>,
    /// Flash log artifact
    pub flash_log_output: Option<PathBuf>,
    /// Opaque test environment settings
    pub test_env: BTreeMap<String, String>,
    /// Power-cycle plan
    pub power_cycle: Option<PowerCycle>,
    /// Neutral images
    pub at_host: AtHostImages,
}

impl SessionConfig {
    /// Overall session timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    /// Grace period for the end-pattern path
    pub fn end_on_wait(&self) -> Duration {
        Duration::from_secs(self.end_on_wait_seconds)
    }

    /// AT-host image matching the build target
    pub fn at_host_image(&self) -> &Path {
        if self.target == THINGY91_TARGET {
            &self.at_host.thingy91
        } else {
            &self.at_host.nrf9160dk
        }
    }

    /// Credentials file for this device, if a certificate location is set
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.certificate_location
            .as_ref()
            .map(|dir| dir.join(format!("device-{}.json", self.device_id)))
    }

    /// Job description for an external runner
    pub fn to_job_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn validate_patterns(
    field: &'static str,
    list: Option<PatternList>,
) -> Result<Option<Vec<String>>, ConfigError> {
    let patterns = list.and_then(PatternList::into_patterns);
    if let Some(ref patterns) = patterns {
        if patterns.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid {
                field,
                reason: "empty pattern would match every line".to_string(),
            });
        }
    }
    Ok(patterns)
}

impl TryFrom<RawJob> for SessionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        let device_id = raw.device_id.ok_or(ConfigError::Missing("device_id"))?;
        if device_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "device_id",
                reason: "must not be empty".to_string(),
            });
        }

        let timeout_minutes = raw
            .timeout_minutes
            .ok_or(ConfigError::Missing("timeout_minutes"))?;
        if timeout_minutes == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout_minutes",
                reason: "must be greater than zero".to_string(),
            });
        }

        let hex_file = raw.hex_file.ok_or(ConfigError::Missing("hex_file"))?;

        Ok(Self {
            device_id,
            app_version: raw.app_version,
            target: raw.target.unwrap_or_default(),
            network: raw.network,
            sec_tag: raw.sec_tag,
            timeout_minutes,
            hex_file,
            fota_file: raw.fota_file,
            abort_on: validate_patterns("abort_on", raw.abort_on)?,
            end_on: validate_patterns("end_on", raw.end_on)?,
            end_on_wait_seconds: raw
                .end_on_wait_seconds
                .unwrap_or(DEFAULT_END_ON_WAIT_SECONDS),
            certificate_location: raw.certificate_location,
            device_log_output: raw.device_log_output,
            flash_log_output: raw.flash_log_output,
            test_env: raw.test_env,
            power_cycle: raw.power_cycle.filter(|p| p.enabled),
            at_host: raw.at_host.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RawJob {
        RawJob {
            device_id: Some("960123456".to_string()),
            timeout_minutes: Some(5),
            hex_file: Some(PathBuf::from("app.hex")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = SessionConfig::try_from(minimal()).unwrap();
        assert_eq!(config.end_on_wait_seconds, DEFAULT_END_ON_WAIT_SECONDS);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert!(config.abort_on.is_none());
        assert!(config.end_on.is_none());
        assert!(config.power_cycle.is_none());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let raw = RawJob {
            timeout_minutes: Some(0),
            ..minimal()
        };
        assert!(matches!(
            SessionConfig::try_from(raw),
            Err(ConfigError::Invalid { field: "timeout_minutes", .. })
        ));
    }

    #[test]
    fn test_huge_timeout_accepted() {
        let raw = RawJob {
            timeout_minutes: Some(u64::MAX / 60),
            ..minimal()
        };
        let config = SessionConfig::try_from(raw).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(u64::MAX / 60 * 60));
    }

    #[test]
    fn test_missing_device_id() {
        let raw = RawJob {
            device_id: None,
            ..minimal()
        };
        assert!(matches!(
            SessionConfig::try_from(raw),
            Err(ConfigError::Missing("device_id"))
        ));
    }

    #[test]
    fn test_multiline_patterns() {
        assert_eq!(patterns_from_multiline(""), None);
        assert_eq!(
            patterns_from_multiline("Booting\nconnected"),
            Some(vec!["Booting".to_string(), "connected".to_string()])
        );
        assert_eq!(patterns_from_multiline("FATAL\n"), Some(vec!["FATAL".to_string()]));
        assert_eq!(
            patterns_from_multiline("\n  modem ready\ncloud connected\n\n"),
            Some(vec!["modem ready".to_string(), "cloud connected".to_string()])
        );
        assert_eq!(patterns_from_multiline(" \n\t\n"), None);
    }

    #[test]
    fn test_block_scalar_patterns_accepted() {
        let raw = RawJob {
            abort_on: Some(PatternList::Multiline("FATAL ERROR\nhard fault\n".to_string())),
            ..minimal()
        };
        let config = SessionConfig::try_from(raw).unwrap();
        assert_eq!(
            config.abort_on,
            Some(vec!["FATAL ERROR".to_string(), "hard fault".to_string()])
        );
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let raw = RawJob {
            end_on: Some(PatternList::Lines(vec!["done".to_string(), String::new()])),
            ..minimal()
        };
        assert!(matches!(
            SessionConfig::try_from(raw),
            Err(ConfigError::Invalid { field: "end_on", .. })
        ));
    }

    #[test]
    fn test_empty_list_disables_rule() {
        let raw = RawJob {
            abort_on: Some(PatternList::Lines(Vec::new())),
            end_on: Some(PatternList::Multiline(String::new())),
            ..minimal()
        };
        let config = SessionConfig::try_from(raw).unwrap();
        assert!(config.abort_on.is_none());
        assert!(config.end_on.is_none());
    }

    #[test]
    fn test_toml_job() {
        let content = r#"
device_id = "960123456"
target = "thingy91_nrf9160ns"
timeout_minutes = 20
hex_file = "firmware.hex"
abort_on = "FATAL\nassert"
end_on = ["cloud connected", "fota done"]
end_on_wait_seconds = 10

[power_cycle]
off_cmd = "relay off"
on_cmd = "relay on"
wait_seconds_after_on = 5
"#;
        let raw = RawJob::parse(content, JobFormat::Toml).unwrap();
        let config = SessionConfig::try_from(raw).unwrap();

        assert_eq!(config.abort_on, Some(vec!["FATAL".to_string(), "assert".to_string()]));
        assert_eq!(config.end_on.as_ref().map(Vec::len), Some(2));
        assert_eq!(config.end_on_wait(), Duration::from_secs(10));
        assert_eq!(config.at_host_image(), config.at_host.thingy91.as_path());

        let plan = config.power_cycle.unwrap();
        assert_eq!(plan.wait_seconds_after_off, 0);
        assert_eq!(plan.wait_seconds_after_on, 5);
    }

    #[test]
    fn test_yaml_job_disabled_power_cycle() {
        let content = r"
device_id: '960123456'
target: nrf9160dk_nrf9160ns
timeout_minutes: 3
hex_file: firmware.hex
power_cycle:
  enabled: false
  off_cmd: relay off
  on_cmd: relay on
";
        let raw = RawJob::parse(content, JobFormat::Yaml).unwrap();
        let config = SessionConfig::try_from(raw).unwrap();
        assert!(config.power_cycle.is_none());
        assert_eq!(config.at_host_image(), config.at_host.nrf9160dk.as_path());
    }

    #[test]
    fn test_merge_overrides_win() {
        let file = RawJob {
            timeout_minutes: Some(30),
            end_on: Some(PatternList::Multiline("done".to_string())),
            ..minimal()
        };
        let cli = RawJob {
            timeout_minutes: Some(2),
            ..Default::default()
        };
        let merged = file.merge(cli);
        assert_eq!(merged.timeout_minutes, Some(2));
        assert_eq!(merged.end_on, Some(PatternList::Multiline("done".to_string())));
        assert_eq!(merged.device_id.as_deref(), Some("960123456"));
    }

    #[test]
    fn test_credentials_path() {
        let raw = RawJob {
            certificate_location: Some(PathBuf::from("/certs")),
            ..minimal()
        };
        let config = SessionConfig::try_from(raw).unwrap();
        assert_eq!(
            config.credentials_path(),
            Some(PathBuf::from("/certs/device-960123456.json"))
        );
    }

    #[test]
    fn test_job_json_is_loadable() {
        let config = SessionConfig::try_from(minimal()).unwrap();
        let json = config.to_job_json().unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
