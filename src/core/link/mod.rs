//! Device link contract
//!
//! The device link owns everything hardware-specific: connecting to the
//! device, provisioning credentials, flashing images and producing the live
//! log stream. The orchestrator only talks to it through [`DeviceLink`] and
//! [`Connection`].

mod serial;

pub use serial::{spawn_line_reader, DeviceLineCodec, SerialConnection, SerialLink, MAX_LINE_LENGTH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the link event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Device link error types
#[derive(Error, Debug)]
pub enum LinkError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Flashing an image failed
    #[error("Flashing {hexfile} failed: {message}")]
    Flash {
        /// Image that was being flashed
        hexfile: PathBuf,
        /// Failure detail
        message: String,
    },

    /// Credential provisioning failed
    #[error("Credential provisioning failed: {0}")]
    Credentials(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Event on the device log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One log line (already appended to the device log)
    Line(String),
    /// Stream ended
    End {
        /// Human-readable reason
        reason: String,
        /// The link's own read timeout expired
        timeout: bool,
    },
}

/// Append-only device log shared between the link and the orchestrator
#[derive(Debug, Clone, Default)]
pub struct DeviceLog {
    lines: Arc<RwLock<Vec<String>>>,
}

impl DeviceLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line
    pub fn push(&self, line: impl Into<String>) {
        self.lines.write().push(line.into());
    }

    /// Copy of the lines captured so far
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.read().clone()
    }

    /// Number of lines captured
    pub fn len(&self) -> usize {
        self.lines.read().len()
    }

    /// Nothing captured yet
    pub fn is_empty(&self) -> bool {
        self.lines.read().is_empty()
    }
}

/// Device credentials, opaque to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

impl Credentials {
    /// Read a credentials JSON file
    pub fn load(path: &Path) -> Result<Self, LinkError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Credentials(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            LinkError::Credentials(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

/// An established device connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Close the connection. Calling it again is a no-op.
    async fn end(&self) -> Result<(), LinkError>;

    /// Still open
    fn is_open(&self) -> bool;

    /// Connection info string
    fn info(&self) -> String;
}

/// What [`DeviceLink::connect`] hands back
pub struct LinkSession {
    /// Connection handle
    pub connection: Arc<dyn Connection>,
    /// Log the link appends to
    pub device_log: DeviceLog,
    /// Live log stream
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Device link capability consumed by the orchestrator
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Connect to `device_id`, using `at_host` as the image that accepts AT
    /// commands during provisioning.
    async fn connect(&self, device_id: &str, at_host: &Path) -> Result<LinkSession, LinkError>;

    /// Provision credentials over an established connection
    async fn flash_credentials(
        &self,
        credentials: &Credentials,
        connection: &dyn Connection,
    ) -> Result<(), LinkError>;

    /// Flash an image, returning the flash log
    async fn flash(&self, hexfile: &Path) -> Result<Vec<String>, LinkError>;
}
