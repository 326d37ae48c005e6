//! CLI Exit Codes
//!
//! Exit codes for CI pipelines. A session that ran to a resolution exits
//! with a code describing how it ended; setup failures get their own codes.

use crate::core::link::LinkError;
use crate::core::orchestrator::SessionError;
use crate::core::outcome::{Outcome, Resolution};
use crate::core::supervisor::{SupervisorReport, RUNNER_SIGNALLED, RUNNER_TIMED_OUT};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Timed out
    pub const TIMEOUT: u8 = 4;

    /// Credential provisioning failed
    pub const CREDENTIALS_FAILED: u8 = 5;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Flashing the firmware failed
    pub const FLASH_FAILED: u8 = 9;

    /// Power cycle failed
    pub const POWER_CYCLE_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Runner killed by a signal
    pub const RUNNER_SIGNALLED: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, msg.into())
    }

    /// Result for a session outcome.
    ///
    /// Timeouts and pattern matches are reported through the `timeout` and
    /// `abort` outputs, not the exit code. Only a session that never connected
    /// or was interrupted by the operator fails.
    pub fn from_outcome(outcome: &Outcome) -> Self {
        match outcome.resolution {
            None => Self::Error(ExitCodes::CONNECTION_FAILED, "Not connected".to_string()),
            Some(Resolution::Interrupted) => {
                Self::Error(ExitCodes::CANCELLED, "Interrupted".to_string())
            }
            Some(resolution) => Self::success_with_message(resolution.to_string()),
        }
    }

    /// Result for a supervised runner
    pub fn from_report(report: &SupervisorReport) -> Self {
        match report.exit_code {
            0 if report.success => Self::success(),
            RUNNER_TIMED_OUT => Self::Error(ExitCodes::TIMEOUT, "Runner timed out".to_string()),
            RUNNER_SIGNALLED if report.interrupted => {
                Self::Error(ExitCodes::CANCELLED, "Interrupted".to_string())
            }
            RUNNER_SIGNALLED => {
                Self::Error(ExitCodes::RUNNER_SIGNALLED, "Runner terminated by a signal".to_string())
            }
            code => Self::Error(
                u8::try_from(code)
                    .ok()
                    .filter(|c| *c != 0)
                    .unwrap_or(ExitCodes::ERROR),
                format!("Runner exited with {} after {} attempts", code, report.attempts),
            ),
        }
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&SessionError> for CliResult {
    fn from(err: &SessionError) -> Self {
        let code = match err {
            SessionError::Power(_) => ExitCodes::POWER_CYCLE_FAILED,
            SessionError::Connect(LinkError::PortNotFound(_)) => ExitCodes::PORT_NOT_FOUND,
            SessionError::Connect(LinkError::PermissionDenied(_)) => ExitCodes::PERMISSION_DENIED,
            SessionError::Connect(_) => ExitCodes::CONNECTION_FAILED,
            SessionError::Credentials(_) => ExitCodes::CREDENTIALS_FAILED,
            SessionError::Flash(_) => ExitCodes::FLASH_FAILED,
            SessionError::Interrupted => ExitCodes::CANCELLED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timed out",
        5 => "Credential provisioning failed",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Flashing firmware failed",
        10 => "Power cycle failed",
        11 => "Operation cancelled",
        13 => "Runner terminated by a signal",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::power::PowerError;
    use chrono::Utc;
    use uuid::Uuid;

    fn outcome(resolution: Resolution) -> Outcome {
        Outcome::resolved(Uuid::new_v4(), Utc::now(), resolution, Vec::new(), Vec::new())
    }

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_outcome() {
        for resolution in [
            Resolution::Ended,
            Resolution::StreamClosed,
            Resolution::Timeout,
            Resolution::DeviceTimeout,
            Resolution::Aborted,
        ] {
            let result = CliResult::from_outcome(&outcome(resolution));
            assert!(result.is_success(), "{resolution} should exit 0");
        }
        assert_eq!(CliResult::from_outcome(&outcome(Resolution::Interrupted)).code(), ExitCodes::CANCELLED);

        let never = Outcome::not_connected(Uuid::new_v4(), Utc::now());
        assert_eq!(CliResult::from_outcome(&never).code(), ExitCodes::CONNECTION_FAILED);
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::Power(PowerError::CommandFailed {
            cmd: "relay off".to_string(),
            code: 1,
        });
        assert_eq!(CliResult::from(&err).code(), ExitCodes::POWER_CYCLE_FAILED);

        let err = SessionError::Connect(LinkError::PortNotFound("/dev/ttyACM9".to_string()));
        assert_eq!(CliResult::from(&err).code(), ExitCodes::PORT_NOT_FOUND);

        let err = SessionError::Credentials(LinkError::Credentials("bad".to_string()));
        assert_eq!(CliResult::from(&err).code(), ExitCodes::CREDENTIALS_FAILED);
    }

    #[test]
    fn test_from_report() {
        let report = |success, timed_out, exit_code| SupervisorReport {
            success,
            timed_out,
            interrupted: false,
            exit_code,
            attempts: 3,
            output: Vec::new(),
        };
        assert!(CliResult::from_report(&report(true, false, 0)).is_success());
        assert_eq!(CliResult::from_report(&report(false, true, RUNNER_TIMED_OUT)).code(), ExitCodes::TIMEOUT);
        assert_eq!(
            CliResult::from_report(&report(false, false, RUNNER_SIGNALLED)).code(),
            ExitCodes::RUNNER_SIGNALLED
        );
        assert_eq!(CliResult::from_report(&report(false, false, 4)).code(), 4);
        assert_eq!(CliResult::from_report(&report(false, false, 2)).code(), 2);
        assert_eq!(CliResult::from_report(&report(false, false, 300)).code(), ExitCodes::ERROR);
        assert_eq!(CliResult::from_report(&report(false, false, -7)).code(), ExitCodes::ERROR);
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
    }
}
