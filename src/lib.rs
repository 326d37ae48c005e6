//! # fwci Core Library
//!
//! Hardware-in-the-loop firmware test sessions:
//! - Power cycle the device under test
//! - Connect, provision credentials and flash the firmware
//! - Watch the device log for abort / end criteria under a session timeout
//! - Report `connected` / `abort` / `timeout` and write the captured logs
//!
//! The same job can instead be handed to an external runner process, which
//! is supervised with a deadline and a bounded number of attempts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fwci_core::{LinkSettings, Orchestrator, RawJob, SerialLink, SessionConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let raw = RawJob::load("job.toml".as_ref())?;
//!     let config = Arc::new(SessionConfig::try_from(raw)?);
//!     let link = Arc::new(SerialLink::new(LinkSettings::default(), &config.device_id));
//!
//!     let resolved = Orchestrator::new(config, link).run().await?;
//!     println!("timed out: {}", resolved.outcome.timed_out);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, LinkSettings, RawJob, RunnerSettings, SessionConfig};
pub use crate::core::link::{Connection, DeviceLink, DeviceLog, LinkError, LinkEvent, SerialLink};
pub use crate::core::orchestrator::{Orchestrator, Resolved, SessionError};
pub use crate::core::outcome::{Outcome, Resolution, SessionState};
pub use crate::core::power::{PowerControl, ShellPowerControl};
pub use crate::core::supervisor::{Supervisor, SupervisorOptions, SupervisorReport};
pub use crate::core::watcher::{PatternWatcher, RuleKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
