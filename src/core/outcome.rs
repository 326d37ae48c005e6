//! Session outcome and the single-resolution guard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use uuid::Uuid;

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// Power cycling, connecting, provisioning and flashing
    Connecting = 0,
    /// All termination sources are live
    Armed = 1,
    /// A source won; teardown in progress
    Resolving = 2,
    /// Terminal
    Resolved = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Armed,
            2 => Self::Resolving,
            _ => Self::Resolved,
        }
    }
}

/// Once-primitive deciding which termination source wins.
///
/// Transitions are compare-and-set, so of any number of concurrent
/// [`try_resolve`](Self::try_resolve) calls exactly one succeeds.
#[derive(Debug)]
pub struct ResolutionGuard {
    state: AtomicU8,
}

impl Default for ResolutionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionGuard {
    /// New guard in `Connecting`
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Connecting as u8),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Connecting -> Armed`
    pub fn arm(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Armed)
    }

    /// `Armed -> Resolving`; `true` for the single winner
    pub fn try_resolve(&self) -> bool {
        self.transition(SessionState::Armed, SessionState::Resolving)
    }

    /// `Resolving -> Resolved`
    pub fn finish(&self) -> bool {
        self.transition(SessionState::Resolving, SessionState::Resolved)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Why an armed session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Session timer expired
    Timeout,
    /// Device link reported its own read timeout
    DeviceTimeout,
    /// All abort patterns seen
    Aborted,
    /// All end patterns seen
    Ended,
    /// Device stream closed without a read timeout
    StreamClosed,
    /// Operator interrupt
    Interrupted,
}

impl Resolution {
    /// Reported as a timeout
    pub fn timed_out(self) -> bool {
        matches!(self, Self::Timeout | Self::DeviceTimeout)
    }

    /// Reported as aborted
    pub fn aborted(self) -> bool {
        matches!(self, Self::Aborted | Self::Interrupted)
    }

    /// Device gets the AT-host image flashed after teardown
    pub fn reflash_to_idle(self) -> bool {
        matches!(self, Self::Aborted | Self::Ended)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::DeviceTimeout => write!(f, "device read timeout"),
            Self::Aborted => write!(f, "abort patterns seen"),
            Self::Ended => write!(f, "end patterns seen"),
            Self::StreamClosed => write!(f, "device stream closed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Result of one test session, produced exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Session identifier
    pub session_id: Uuid,
    /// Connection was established
    pub connected: bool,
    /// Ended by a timeout
    pub timed_out: bool,
    /// Ended by an abort
    pub aborted: bool,
    /// Winning termination source; `None` when never connected
    pub resolution: Option<Resolution>,
    /// Device log captured up to teardown
    pub device_log: Vec<String>,
    /// Output of flashing the firmware under test
    pub flash_log: Vec<String>,
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Resolution time
    pub resolved_at: DateTime<Utc>,
}

impl Outcome {
    /// Outcome of a resolved session
    pub fn resolved(
        session_id: Uuid,
        started_at: DateTime<Utc>,
        resolution: Resolution,
        device_log: Vec<String>,
        flash_log: Vec<String>,
    ) -> Self {
        Self {
            session_id,
            connected: true,
            timed_out: resolution.timed_out(),
            aborted: resolution.aborted(),
            resolution: Some(resolution),
            device_log,
            flash_log,
            started_at,
            resolved_at: Utc::now(),
        }
    }

    /// Outcome reported when the session never got connected
    pub fn not_connected(session_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            connected: false,
            timed_out: false,
            aborted: false,
            resolution: None,
            device_log: Vec::new(),
            flash_log: Vec::new(),
            started_at,
            resolved_at: Utc::now(),
        }
    }

    /// Ended normally (end patterns or stream closure)
    pub fn is_normal_end(&self) -> bool {
        self.connected && !self.timed_out && !self.aborted
    }
}
