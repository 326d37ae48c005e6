//! Session timeout timer
//!
//! An explicit handle owned by the orchestrator. Waiting on it is cancel-safe
//! inside `tokio::select!`, and cancelling is idempotent.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Timer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Counting down
    Pending,
    /// Deadline reached
    Fired,
    /// Cancelled before firing
    Cancelled,
}

/// Roughly 30 years; stands in for deadlines past what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `duration` from now, saturating instead of overflowing `Instant`
pub fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// One-shot session timeout
#[derive(Debug)]
pub struct JobTimer {
    sleep: Pin<Box<Sleep>>,
    state: TimerState,
}

impl JobTimer {
    /// Start counting down from now
    pub fn start(duration: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep_until(deadline_after(duration))),
            state: TimerState::Pending,
        }
    }

    /// Completes when the deadline passes. Never completes once the timer
    /// has fired or been cancelled.
    pub async fn expired(&mut self) {
        if self.state != TimerState::Pending {
            std::future::pending::<()>().await;
        }
        (&mut self.sleep).await;
        self.state = TimerState::Fired;
    }

    /// Cancel the timer. Returns whether it was still pending; cancelling a
    /// fired or already cancelled timer is a no-op.
    pub fn cancel(&mut self) -> bool {
        if self.state == TimerState::Pending {
            self.state = TimerState::Cancelled;
            true
        } else {
            false
        }
    }

    /// Current state
    pub fn state(&self) -> TimerState {
        self.state
    }
}
