//! Simulated device link
//!
//! Scriptable stand-in for a real device. A script lists the log lines the
//! device prints and when, and can inject failures into connecting,
//! credential provisioning and flashing. Lines are written into an in-memory
//! pipe and read back through the same line reader the serial link uses, so
//! read timeouts and stream closure behave like on hardware.

use crate::config::ConfigError;
use crate::core::link::{
    spawn_line_reader, Connection, Credentials, DeviceLink, DeviceLog, LinkError, LinkSession,
    EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PIPE_CAPACITY: usize = 64 * 1024;

fn default_read_timeout() -> u64 {
    300
}

/// One scripted device action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScriptStep {
    /// Print a log line
    Line {
        /// Delay since the previous step
        #[serde(default)]
        after_ms: u64,
        /// Line text, without the newline
        text: String,
    },
    /// Close the stream
    Close {
        /// Delay since the previous step
        #[serde(default)]
        after_ms: u64,
    },
}

/// Device behaviour script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationScript {
    /// Silence after which the link reports a read timeout
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
    /// Steps, in order. Without a final `close` the device stays silent.
    pub steps: Vec<ScriptStep>,
    /// Output of a successful flash
    pub flash_log: Vec<String>,
    /// How long each flash takes
    pub flash_ms: u64,
    /// Connecting fails with this message
    pub fail_connect: Option<String>,
    /// Credential provisioning fails with this message
    pub fail_credentials: Option<String>,
    /// Flashing these images fails
    pub fail_flash: Vec<PathBuf>,
}

impl Default for SimulationScript {
    fn default() -> Self {
        Self {
            read_timeout_seconds: default_read_timeout(),
            steps: Vec::new(),
            flash_log: vec!["Parsing image file.".to_string(), "Verified OK.".to_string()],
            flash_ms: 0,
            fail_connect: None,
            fail_credentials: None,
            fail_flash: Vec::new(),
        }
    }
}

impl SimulationScript {
    /// Load a YAML script
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Append a line printed `after_ms` after the previous step
    #[must_use]
    pub fn line(mut self, after_ms: u64, text: &str) -> Self {
        self.steps.push(ScriptStep::Line {
            after_ms,
            text: text.to_string(),
        });
        self
    }

    /// Append a stream close
    #[must_use]
    pub fn close(mut self, after_ms: u64) -> Self {
        self.steps.push(ScriptStep::Close { after_ms });
        self
    }

    /// Set the read timeout
    #[must_use]
    pub fn read_timeout(mut self, seconds: u64) -> Self {
        self.read_timeout_seconds = seconds;
        self
    }
}

/// What the simulated link was asked to do
#[derive(Debug, Clone, Default)]
pub struct SimulatorCalls {
    /// Connect attempts
    pub connects: u32,
    /// Provisioned credentials
    pub credentials: Vec<Credentials>,
    /// Flashed images, in order (including failed attempts)
    pub flashed: Vec<PathBuf>,
    /// Calls to [`Connection::end`]
    pub end_calls: u32,
}

/// Simulated connection; `end` only takes effect once
pub struct SimulatedConnection {
    open: AtomicBool,
    cancel: CancellationToken,
    calls: Arc<Mutex<SimulatorCalls>>,
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn end(&self) -> Result<(), LinkError> {
        self.calls.lock().end_calls += 1;
        if self.open.swap(false, Ordering::AcqRel) {
            self.cancel.cancel();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn info(&self) -> String {
        "simulator".to_string()
    }
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Scripted device link
pub struct SimulatedLink {
    script: SimulationScript,
    calls: Arc<Mutex<SimulatorCalls>>,
}

impl SimulatedLink {
    /// Create a link playing `script`
    pub fn new(script: SimulationScript) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(SimulatorCalls::default())),
        }
    }

    /// Calls recorded so far
    pub fn calls(&self) -> SimulatorCalls {
        self.calls.lock().clone()
    }
}

async fn play(steps: Vec<ScriptStep>, mut pipe: tokio::io::DuplexStream, cancel: CancellationToken) {
    for step in steps {
        let (after_ms, text) = match step {
            ScriptStep::Line { after_ms, text } => (after_ms, Some(text)),
            ScriptStep::Close { after_ms } => (after_ms, None),
        };

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(after_ms)) => {}
        }

        match text {
            Some(text) => {
                if pipe.write_all(format!("{text}\r\n").as_bytes()).await.is_err() {
                    return;
                }
            }
            None => {
                debug!("simulated device closed the stream");
                return;
            }
        }
    }

    // Keep the stream open but silent until the host hangs up.
    cancel.cancelled().await;
}

#[async_trait]
impl DeviceLink for SimulatedLink {
    async fn connect(&self, device_id: &str, at_host: &Path) -> Result<LinkSession, LinkError> {
        self.calls.lock().connects += 1;
        if let Some(message) = &self.script.fail_connect {
            return Err(LinkError::ConnectionFailed(message.clone()));
        }
        info!(device = %device_id, image = %at_host.display(), "simulated device connected");

        let (device_side, host_side) = tokio::io::duplex(PIPE_CAPACITY);
        let device_log = DeviceLog::new();
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(play(self.script.steps.clone(), device_side, cancel.clone()));
        spawn_line_reader(
            host_side,
            device_log.clone(),
            tx,
            Duration::from_secs(self.script.read_timeout_seconds),
            cancel.clone(),
        );

        Ok(LinkSession {
            connection: Arc::new(SimulatedConnection {
                open: AtomicBool::new(true),
                cancel,
                calls: Arc::clone(&self.calls),
            }),
            device_log,
            events,
        })
    }

    async fn flash_credentials(
        &self,
        credentials: &Credentials,
        connection: &dyn Connection,
    ) -> Result<(), LinkError> {
        if !connection.is_open() {
            return Err(LinkError::NotConnected);
        }
        self.calls.lock().credentials.push(credentials.clone());
        match &self.script.fail_credentials {
            Some(message) => Err(LinkError::Credentials(message.clone())),
            None => Ok(()),
        }
    }

    async fn flash(&self, hexfile: &Path) -> Result<Vec<String>, LinkError> {
        self.calls.lock().flashed.push(hexfile.to_path_buf());
        if self.script.flash_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.flash_ms)).await;
        }
        if self.script.fail_flash.iter().any(|p| p == hexfile) {
            return Err(LinkError::Flash {
                hexfile: hexfile.to_path_buf(),
                message: "simulated flash failure".to_string(),
            });
        }
        Ok(self.script.flash_log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::link::LinkEvent;

    #[test]
    fn test_yaml_script() {
        let yaml = r"
read_timeout_seconds: 20
steps:
  - type: line
    text: '*** Booting nRF Connect SDK ***'
  - type: line
    after_ms: 1500
    text: cloud connected
  - type: close
    after_ms: 100
flash_ms: 2500
fail_flash:
  - broken.hex
";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.yaml");
        std::fs::write(&path, yaml).unwrap();

        let script = SimulationScript::load(&path).unwrap();
        assert_eq!(script.read_timeout_seconds, 20);
        assert_eq!(script.steps.len(), 3);
        assert_eq!(
            script.steps[1],
            ScriptStep::Line {
                after_ms: 1500,
                text: "cloud connected".to_string()
            }
        );
        assert_eq!(script.flash_ms, 2500);
        assert_eq!(script.fail_flash, vec![PathBuf::from("broken.hex")]);
        assert_eq!(script.flash_log.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_lines_then_closes() {
        let script = SimulationScript::default().line(10, "boot").line(10, "ready").close(10);
        let link = SimulatedLink::new(script);
        let mut session = link.connect("1", Path::new("at_host.hex")).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = session.events.recv().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                LinkEvent::Line("boot".to_string()),
                LinkEvent::Line("ready".to_string()),
                LinkEvent::End { reason: "stream closed".to_string(), timeout: false },
            ]
        );
        assert_eq!(session.device_log.snapshot(), vec!["boot", "ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_becomes_read_timeout() {
        let link = SimulatedLink::new(SimulationScript::default().read_timeout(5));
        let mut session = link.connect("1", Path::new("at_host.hex")).await.unwrap();

        let event = session.events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::End { timeout: true, .. }));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let script = SimulationScript {
            fail_connect: Some("probe not found".to_string()),
            ..Default::default()
        };
        let link = SimulatedLink::new(script);
        let err = link.connect("1", Path::new("at_host.hex")).await.err().unwrap();
        assert!(matches!(err, LinkError::ConnectionFailed(_)));
        assert_eq!(link.calls().connects, 1);

        let script = SimulationScript {
            fail_flash: vec![PathBuf::from("app.hex")],
            ..Default::default()
        };
        let link = SimulatedLink::new(script);
        assert!(link.flash(Path::new("app.hex")).await.is_err());
        assert!(link.flash(Path::new("at_host.hex")).await.is_ok());
        assert_eq!(link.calls().flashed.len(), 2);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let link = SimulatedLink::new(SimulationScript::default());
        let session = link.connect("1", Path::new("at_host.hex")).await.unwrap();

        session.connection.end().await.unwrap();
        session.connection.end().await.unwrap();
        assert!(!session.connection.is_open());
        assert_eq!(link.calls().end_calls, 2);
    }
}
