//! Power control and the power-cycle plan

use crate::config::PowerCycle;
use crate::core::shell::run_captured;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Power control errors
#[derive(Error, Debug)]
pub enum PowerError {
    /// Command could not be started
    #[error("Failed to run `{cmd}`: {source}")]
    Spawn {
        /// Command line
        cmd: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Command exited unsuccessfully
    #[error("`{cmd}` exited with code {code}")]
    CommandFailed {
        /// Command line
        cmd: String,
        /// Exit code
        code: i32,
    },

    /// Command was terminated by a signal
    #[error("`{0}` was terminated by a signal")]
    Signalled(String),
}

/// Switches the device's supply
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Run a power command and return its exit code
    async fn run_cmd(&self, cmd: &str) -> Result<i32, PowerError>;
}

/// Runs power commands through the platform shell
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellPowerControl;

#[async_trait]
impl PowerControl for ShellPowerControl {
    async fn run_cmd(&self, cmd: &str) -> Result<i32, PowerError> {
        let output = run_captured(cmd, None).await.map_err(|source| PowerError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;
        for line in &output.lines {
            debug!(%cmd, "{}", line);
        }
        output.code.ok_or_else(|| PowerError::Signalled(cmd.to_string()))
    }
}

async fn switch(control: &dyn PowerControl, cmd: &str) -> Result<(), PowerError> {
    match control.run_cmd(cmd).await? {
        0 => Ok(()),
        code => Err(PowerError::CommandFailed {
            cmd: cmd.to_string(),
            code,
        }),
    }
}

/// Switch the device off, settle, switch it on, settle.
pub async fn power_cycle(
    control: &dyn PowerControl,
    plan: &PowerCycle,
    device_id: &str,
) -> Result<(), PowerError> {
    info!(device = %device_id, "Power cycling device");

    info!(device = %device_id, cmd = %plan.off_cmd, "Turning off ...");
    switch(control, &plan.off_cmd).await?;
    info!(device = %device_id, "Waiting {} seconds ...", plan.wait_seconds_after_off);
    tokio::time::sleep(Duration::from_secs(plan.wait_seconds_after_off)).await;

    info!(device = %device_id, cmd = %plan.on_cmd, "Turning on ...");
    switch(control, &plan.on_cmd).await?;
    info!(device = %device_id, "Waiting {} seconds ...", plan.wait_seconds_after_on);
    tokio::time::sleep(Duration::from_secs(plan.wait_seconds_after_on)).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use tokio::time::Instant;

    fn plan() -> PowerCycle {
        PowerCycle {
            enabled: true,
            off_cmd: "relay off".to_string(),
            on_cmd: "relay on".to_string(),
            wait_seconds_after_off: 3,
            wait_seconds_after_on: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_then_on_with_delays() {
        let mut control = MockPowerControl::new();
        let mut seq = Sequence::new();
        control
            .expect_run_cmd()
            .withf(|cmd| cmd == "relay off")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        control
            .expect_run_cmd()
            .withf(|cmd| cmd == "relay on")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));

        let start = Instant::now();
        power_cycle(&control, &plan(), "960123").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_off_stops_plan() {
        let mut control = MockPowerControl::new();
        control
            .expect_run_cmd()
            .withf(|cmd| cmd == "relay off")
            .times(1)
            .returning(|_| Ok(1));
        control
            .expect_run_cmd()
            .withf(|cmd| cmd == "relay on")
            .never();

        let err = power_cycle(&control, &plan(), "960123").await.unwrap_err();
        assert!(matches!(err, PowerError::CommandFailed { code: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_power_control_exit_code() {
        let control = ShellPowerControl;
        assert_eq!(control.run_cmd("true").await.unwrap(), 0);
        assert_eq!(control.run_cmd("exit 7").await.unwrap(), 7);
    }
}
