//! Termination race orchestrator
//!
//! Drives one test session: optional power cycle, connect, provision
//! credentials, flash the firmware under test, then race the termination
//! sources until exactly one of them wins.
//!
//! Once armed, four sources are live at the same time:
//! - the session timer,
//! - the device link's own end-of-stream / read-timeout signal,
//! - the abort watcher (if configured),
//! - the end watcher (if configured).
//!
//! The first source to fire wins the [`ResolutionGuard`]; everything else
//! becomes inert. Teardown always closes the connection, and the abort and
//! end paths additionally return the device to the AT-host image in the
//! background.

use crate::config::SessionConfig;
use crate::core::link::{Connection, Credentials, DeviceLink, DeviceLog, LinkError, LinkEvent};
use crate::core::outcome::{Outcome, Resolution, ResolutionGuard};
use crate::core::power::{power_cycle, PowerControl, PowerError, ShellPowerControl};
use crate::core::timer::JobTimer;
use crate::core::watcher::{PatternWatcher, RuleKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Setup failures. None of these produce an [`Outcome`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// Power cycle failed
    #[error("Power cycle failed: {0}")]
    Power(#[from] PowerError),

    /// Connecting to the device failed
    #[error("Connecting to device failed: {0}")]
    Connect(#[source] LinkError),

    /// Loading or provisioning credentials failed
    #[error("Credential provisioning failed: {0}")]
    Credentials(#[source] LinkError),

    /// Flashing the firmware under test failed
    #[error("Flashing firmware failed: {0}")]
    Flash(#[source] LinkError),

    /// Interrupted before the session was armed
    #[error("Interrupted before the session was armed")]
    Interrupted,
}

/// A resolved session
#[derive(Debug)]
pub struct Resolved {
    /// Session result
    pub outcome: Outcome,
    idle_reflash: Option<JoinHandle<()>>,
}

impl Resolved {
    /// An AT-host reflash is running in the background
    pub fn has_idle_reflash(&self) -> bool {
        self.idle_reflash.is_some()
    }

    /// Wait up to `limit` for the background AT-host reflash, then hand back
    /// the outcome. The outcome does not depend on the reflash result.
    pub async fn settle(self, limit: Duration) -> Outcome {
        if let Some(handle) = self.idle_reflash {
            if tokio::time::timeout(limit, handle).await.is_err() {
                warn!("AT host reflash still running, not waiting for it");
            }
        }
        self.outcome
    }
}

/// Live connection after a successful setup
struct Armed {
    connection: Arc<dyn Connection>,
    device_log: DeviceLog,
    events: mpsc::Receiver<LinkEvent>,
    flash_log: Vec<String>,
}

/// Termination race orchestrator for one session
pub struct Orchestrator {
    session_id: Uuid,
    config: Arc<SessionConfig>,
    link: Arc<dyn DeviceLink>,
    power: Arc<dyn PowerControl>,
    interrupt: CancellationToken,
    guard: Arc<ResolutionGuard>,
}

impl Orchestrator {
    /// Create an orchestrator; power commands run through the shell
    pub fn new(config: Arc<SessionConfig>, link: Arc<dyn DeviceLink>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            config,
            link,
            power: Arc::new(ShellPowerControl),
            interrupt: CancellationToken::new(),
            guard: Arc::new(ResolutionGuard::new()),
        }
    }

    /// Use a different power control
    #[must_use]
    pub fn with_power(mut self, power: Arc<dyn PowerControl>) -> Self {
        self.power = power;
        self
    }

    /// Resolve as [`Resolution::Interrupted`] when `token` is cancelled
    #[must_use]
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    /// Session identifier
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Handle to observe the session state from outside
    pub fn guard(&self) -> Arc<ResolutionGuard> {
        Arc::clone(&self.guard)
    }

    /// Run the session to its single resolution
    pub async fn run(self) -> Result<Resolved, SessionError> {
        let span = info_span!(
            "session",
            id = %self.session_id,
            device = %self.config.device_id
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<Resolved, SessionError> {
        let started_at = Utc::now();

        let armed = tokio::select! {
            result = self.setup() => result?,
            () = self.interrupt.cancelled() => {
                warn!("Interrupted while connecting");
                return Err(SessionError::Interrupted);
            }
        };

        self.race(armed, started_at).await
    }

    async fn setup(&self) -> Result<Armed, SessionError> {
        let config = &self.config;

        if let Some(plan) = &config.power_cycle {
            power_cycle(self.power.as_ref(), plan, &config.device_id).await?;
        }

        info!("Connecting...");
        let session = self
            .link
            .connect(&config.device_id, config.at_host_image())
            .await
            .map_err(SessionError::Connect)?;
        info!(connection = %session.connection.info(), "Connected");

        let flash_log = match self.provision_and_flash(session.connection.as_ref()).await {
            Ok(flash_log) => flash_log,
            Err(e) => {
                end_connection(session.connection.as_ref()).await;
                return Err(e);
            }
        };

        Ok(Armed {
            connection: session.connection,
            device_log: session.device_log,
            events: session.events,
            flash_log,
        })
    }

    async fn provision_and_flash(&self, connection: &dyn Connection) -> Result<Vec<String>, SessionError> {
        if let Some(path) = self.config.credentials_path() {
            let credentials = Credentials::load(&path).map_err(SessionError::Credentials)?;
            info!("Flashing credentials");
            self.link
                .flash_credentials(&credentials, connection)
                .await
                .map_err(SessionError::Credentials)?;
        }

        info!(hexfile = %self.config.hex_file.display(), "Flash Firmware");
        let flash_log = self
            .link
            .flash(&self.config.hex_file)
            .await
            .map_err(SessionError::Flash)?;
        Ok(flash_log)
    }

    async fn race(&self, armed: Armed, started_at: DateTime<Utc>) -> Result<Resolved, SessionError> {
        let Armed {
            connection,
            device_log,
            mut events,
            flash_log,
        } = armed;
        let config = &self.config;

        // Output that arrived while flashing is not part of the race, but a
        // stream end is.
        let mut pending_end = None;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LinkEvent::End { .. }) {
                pending_end = Some(event);
                break;
            }
        }

        self.guard.arm();
        info!("Setting timeout to {} minutes", config.timeout_minutes);
        let mut timer = JobTimer::start(config.timeout());

        let mut watchers: Vec<PatternWatcher> = [
            (RuleKind::Abort, config.abort_on.as_deref()),
            (RuleKind::End, config.end_on.as_deref()),
        ]
        .into_iter()
        .filter_map(|(kind, patterns)| patterns.and_then(|p| PatternWatcher::new(kind, p)))
        .collect();

        for watcher in &watchers {
            info!(
                rule = %watcher.kind(),
                "Setting up {} traps. Job will terminate if output contains:",
                watcher.kind()
            );
            for pattern in watcher.patterns() {
                info!(rule = %watcher.kind(), "{}", pattern);
            }
        }

        let resolution = loop {
            let candidate = if let Some(event) = pending_end.take() {
                on_link_event(Some(event), &mut watchers)
            } else {
                tokio::select! {
                    () = timer.expired() => Some(Resolution::Timeout),
                    () = self.interrupt.cancelled() => Some(Resolution::Interrupted),
                    event = events.recv() => on_link_event(event, &mut watchers),
                }
            };

            if let Some(resolution) = candidate {
                if self.guard.try_resolve() {
                    break resolution;
                }
            }
        };

        timer.cancel();
        match resolution {
            Resolution::Timeout => warn!("Timeout reached."),
            Resolution::DeviceTimeout => warn!("Device read timeout occurred."),
            Resolution::StreamClosed => warn!("Device stream closed."),
            Resolution::Interrupted => warn!("Interrupted."),
            Resolution::Aborted => warn!(rule = %RuleKind::Abort, "Aborting session."),
            Resolution::Ended => {
                info!(
                    rule = %RuleKind::End,
                    "Waiting {} seconds for trailing output",
                    config.end_on_wait_seconds
                );
                self.grace_period(&mut events, config.end_on_wait()).await;
            }
        }

        end_connection(connection.as_ref()).await;
        drop(events);

        let idle_reflash = resolution.reflash_to_idle().then(|| self.spawn_idle_reflash());
        let outcome = Outcome::resolved(
            self.session_id,
            started_at,
            resolution,
            device_log.snapshot(),
            flash_log,
        );
        self.guard.finish();

        info!(
            %resolution,
            timed_out = outcome.timed_out,
            aborted = outcome.aborted,
            device_log_lines = outcome.device_log.len(),
            "Session resolved"
        );

        Ok(Resolved {
            outcome,
            idle_reflash,
        })
    }

    /// Keep the stream flowing for `grace` so trailing lines reach the log.
    async fn grace_period(&self, events: &mut mpsc::Receiver<LinkEvent>, grace: Duration) {
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        let mut stream_open = true;

        loop {
            tokio::select! {
                () = &mut deadline => break,
                () = self.interrupt.cancelled() => {
                    warn!("Interrupted during grace period");
                    break;
                }
                event = events.recv(), if stream_open => {
                    if !matches!(event, Some(LinkEvent::Line(_))) {
                        stream_open = false;
                    }
                }
            }
        }
    }

    fn spawn_idle_reflash(&self) -> JoinHandle<()> {
        let link = Arc::clone(&self.link);
        let image = self.config.at_host_image().to_path_buf();
        let span = info_span!("idle_reflash", id = %self.session_id, device = %self.config.device_id);

        tokio::spawn(
            async move {
                info!(image = %image.display(), "Resetting device with AT Host");
                match link.flash(&image).await {
                    Ok(_) => info!("Device reset to AT host"),
                    Err(e) => warn!(error = %e, "Resetting device with AT host failed"),
                }
            }
            .instrument(span),
        )
    }
}

fn on_link_event(event: Option<LinkEvent>, watchers: &mut [PatternWatcher]) -> Option<Resolution> {
    match event {
        Some(LinkEvent::Line(line)) => on_line(&line, watchers),
        Some(LinkEvent::End { reason, timeout: true }) => {
            warn!(%reason, "device link reported a read timeout");
            Some(Resolution::DeviceTimeout)
        }
        Some(LinkEvent::End { reason, timeout: false }) => {
            info!(%reason, "device stream ended");
            Some(Resolution::StreamClosed)
        }
        None => Some(Resolution::StreamClosed),
    }
}

/// Feed a line to every watcher. Each watcher sees the line even if an
/// earlier one fired on it; the first to fire names the resolution.
fn on_line(line: &str, watchers: &mut [PatternWatcher]) -> Option<Resolution> {
    let mut resolution = None;

    for watcher in watchers.iter_mut() {
        let kind = watcher.kind();
        for pattern in watcher.matches(line) {
            warn!(rule = %kind, %pattern, "Termination criteria seen");
        }
        if watcher.observe(line) {
            warn!(rule = %kind, "All termination criteria have been seen.");
            resolution.get_or_insert(match kind {
                RuleKind::Abort => Resolution::Aborted,
                RuleKind::End => Resolution::Ended,
            });
        }
    }

    resolution
}

async fn end_connection(connection: &dyn Connection) {
    if let Err(e) = connection.end().await {
        warn!(error = %e, "Closing device connection failed");
    }
}
