//! External runner supervisor
//!
//! Runs the test in a child process instead of in-process: the job
//! description goes to the runner's stdin as one JSON document, stdout and
//! stderr are captured line by line, and a non-zero exit is retried with a
//! fresh process until the attempt budget is spent. The wall-clock deadline
//! covers all attempts; hitting it terminates the child and is never retried.

use crate::config::{RunnerSettings, SessionConfig};
use crate::core::timer::deadline_after;
use parking_lot::Mutex;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Exit code reported when the runner hit the deadline
pub const RUNNER_TIMED_OUT: i32 = -1;

/// Exit code reported when the runner was killed by a signal
pub const RUNNER_SIGNALLED: i32 = -2;

/// Time a runner gets to exit after SIGTERM before it is killed
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(10);

/// How long to wait for output capture after the runner is gone
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Runner could not be started
    #[error("Failed to spawn runner `{program}`: {source}")]
    Spawn {
        /// Runner executable
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the runner failed
    #[error("Runner I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job description could not be serialized
    #[error("Failed to serialize job description: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Runner output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One captured runner line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerLine {
    /// Attempt that printed it
    pub attempt: u32,
    /// Stream it came from
    pub stream: OutputStream,
    /// Line text
    pub line: String,
}

/// Runner invocation
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Deadline for all attempts together
    pub timeout: Duration,
    /// Total attempt budget
    pub tries: u32,
    /// Time between SIGTERM and kill
    pub term_grace: Duration,
}

impl SupervisorOptions {
    /// Options for running `settings` against `config`
    pub fn from_settings(settings: &RunnerSettings, config: &SessionConfig) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.command_args(),
            timeout: config.timeout(),
            tries: settings.tries,
            term_grace: DEFAULT_TERM_GRACE,
        }
    }
}

/// Final state of a supervised run
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorReport {
    /// Last attempt exited with 0
    pub success: bool,
    /// Deadline was hit
    pub timed_out: bool,
    /// Interrupted by the operator
    pub interrupted: bool,
    /// Last attempt's exit code, or a negative sentinel
    pub exit_code: i32,
    /// Attempts spawned
    pub attempts: u32,
    /// Captured output of all attempts
    pub output: Vec<RunnerLine>,
}

enum AttemptExit {
    Exited(i32),
    Signalled,
    TimedOut,
    Interrupted,
}

/// Runs the external runner with retries and a deadline
pub struct Supervisor {
    options: SupervisorOptions,
    interrupt: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            interrupt: CancellationToken::new(),
        }
    }

    /// Terminate the runner when `token` is cancelled
    #[must_use]
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    /// Run `config` as the job description
    pub async fn run_job(&self, config: &SessionConfig) -> Result<SupervisorReport, SupervisorError> {
        let job = config.to_job_json()?;
        self.run(&job).await
    }

    /// Run with `job` on the runner's stdin until success, the deadline, or
    /// an exhausted attempt budget.
    pub async fn run(&self, job: &str) -> Result<SupervisorReport, SupervisorError> {
        let deadline = deadline_after(self.options.timeout);
        let output = Arc::new(Mutex::new(Vec::new()));
        let mut tries_remaining = self.options.tries.max(1) - 1;
        let mut attempt: u32 = 0;

        let exit = loop {
            attempt += 1;
            let span = info_span!("runner", attempt, program = %self.options.program);
            let exit = self
                .attempt(attempt, job, deadline, &output)
                .instrument(span)
                .await?;

            let failed = matches!(exit, AttemptExit::Signalled)
                || matches!(exit, AttemptExit::Exited(code) if code != 0);
            if !failed || tries_remaining == 0 {
                break exit;
            }
            tries_remaining -= 1;
            warn!(
                attempt,
                exit_code = code_or_sentinel(&exit),
                tries_remaining,
                "Runner failed, retrying"
            );
        };

        let exit_code = code_or_sentinel(&exit);
        let report = SupervisorReport {
            success: matches!(exit, AttemptExit::Exited(0)),
            timed_out: matches!(exit, AttemptExit::TimedOut),
            interrupted: matches!(exit, AttemptExit::Interrupted),
            exit_code,
            attempts: attempt,
            output: std::mem::take(&mut *output.lock()),
        };
        info!(
            success = report.success,
            timed_out = report.timed_out,
            exit_code = report.exit_code,
            attempts = report.attempts,
            "Runner finished"
        );
        Ok(report)
    }

    async fn attempt(
        &self,
        attempt: u32,
        job: &str,
        deadline: Instant,
        output: &Arc<Mutex<Vec<RunnerLine>>>,
    ) -> Result<AttemptExit, SupervisorError> {
        info!("Starting runner");
        let mut child = Command::new(&self.options.program)
            .args(&self.options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.options.program.clone(),
                source,
            })?;

        let stdout = capture(child.stdout.take(), attempt, OutputStream::Stdout, output);
        let stderr = capture(child.stderr.take(), attempt, OutputStream::Stderr, output);

        let feeder = child.stdin.take().map(|stdin| feed(stdin, job.to_string()));

        let exit = tokio::select! {
            status = child.wait() => classify(status?),
            () = tokio::time::sleep_until(deadline) => {
                warn!("Timeout reached.");
                terminate(&mut child, self.options.term_grace).await;
                AttemptExit::TimedOut
            }
            () = self.interrupt.cancelled() => {
                warn!("Interrupted.");
                terminate(&mut child, self.options.term_grace).await;
                AttemptExit::Interrupted
            }
        };

        if let Some(feeder) = feeder {
            feeder.abort();
        }
        for handle in [stdout, stderr] {
            if tokio::time::timeout(IO_CAPTURE_TIMEOUT, handle).await.is_err() {
                debug!("output capture did not finish, dropping the rest");
            }
        }

        Ok(exit)
    }
}

fn classify(status: ExitStatus) -> AttemptExit {
    match status.code() {
        Some(code) => AttemptExit::Exited(code),
        None => AttemptExit::Signalled,
    }
}

fn code_or_sentinel(exit: &AttemptExit) -> i32 {
    match exit {
        AttemptExit::Exited(code) => *code,
        AttemptExit::TimedOut => RUNNER_TIMED_OUT,
        AttemptExit::Signalled | AttemptExit::Interrupted => RUNNER_SIGNALLED,
    }
}

/// Write the job description to the runner's stdin, then close it. Runs
/// apart from the attempt so a runner that never reads cannot hold off the
/// deadline.
fn feed(mut stdin: ChildStdin, job: String) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let written = async {
                stdin.write_all(job.as_bytes()).await?;
                stdin.shutdown().await
            };
            if let Err(e) = written.await {
                warn!(error = %e, "Failed to hand the job description to the runner");
            }
        }
        .in_current_span(),
    )
}

fn capture<R>(
    reader: Option<R>,
    attempt: u32,
    stream: OutputStream,
    output: &Arc<Mutex<Vec<RunnerLine>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let output = Arc::clone(output);
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match stream {
                OutputStream::Stdout => info!(attempt, "{}", line),
                OutputStream::Stderr => warn!(attempt, "{}", line),
            }
            output.lock().push(RunnerLine {
                attempt,
                stream,
                line,
            });
        }
    })
}

/// Ask the child to stop, then kill it if it does not.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        return;
                    }
                    warn!("Runner ignored SIGTERM, killing it");
                }
                Err(e) => warn!(error = %e, "Failed to send SIGTERM to runner"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill runner");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    fn options(script: &str, timeout: Duration, tries: u32) -> SupervisorOptions {
        SupervisorOptions {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout,
            tries,
            term_grace: Duration::from_secs(2),
        }
    }

    fn flaky_runner(counter: &Path, succeed_on: u32) -> String {
        format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; echo \"attempt $n\"; [ $n -ge {succeed_on} ]",
            c = counter.display()
        )
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let script = flaky_runner(&dir.path().join("count"), 3);
        let supervisor = Supervisor::new(options(&script, Duration::from_secs(30), 3));

        let report = supervisor.run("{}").await.unwrap();
        assert!(report.success);
        assert!(!report.timed_out);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.attempts, 3);

        let lines: Vec<_> = report.output.iter().map(|l| (l.attempt, l.line.as_str())).collect();
        assert_eq!(lines, vec![(1, "attempt 1"), (2, "attempt 2"), (3, "attempt 3")]);
    }

    #[tokio::test]
    async fn test_exhausted_tries_report_last_code() {
        let supervisor = Supervisor::new(options("echo boom >&2; exit 4", Duration::from_secs(30), 2));

        let report = supervisor.run("{}").await.unwrap();
        assert!(!report.success);
        assert_eq!(report.exit_code, 4);
        assert_eq!(report.attempts, 2);
        assert!(report
            .output
            .iter()
            .all(|l| l.stream == OutputStream::Stderr && l.line == "boom"));
    }

    #[tokio::test]
    async fn test_hanging_runner_times_out_without_retry() {
        let supervisor = Supervisor::new(options("exec sleep 30", Duration::from_millis(300), 3));

        let start = std::time::Instant::now();
        let report = supervisor.run("{}").await.unwrap();
        assert!(report.timed_out);
        assert!(!report.success);
        assert_eq!(report.exit_code, RUNNER_TIMED_OUT);
        assert_eq!(report.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_signalled_attempt_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; [ $n -ge 2 ] || kill -9 $$; echo recovered",
            c = dir.path().join("count").display()
        );
        let supervisor = Supervisor::new(options(&script, Duration::from_secs(30), 3));

        let report = supervisor.run("{}").await.unwrap();
        assert!(report.success);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.output.last().map(|l| l.line.as_str()), Some("recovered"));
    }

    #[tokio::test]
    async fn test_always_signalled_runner_exhausts_tries() {
        let supervisor = Supervisor::new(options("kill -9 $$", Duration::from_secs(30), 2));

        let report = supervisor.run("{}").await.unwrap();
        assert!(!report.success);
        assert!(!report.interrupted);
        assert_eq!(report.exit_code, RUNNER_SIGNALLED);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_runner_ignoring_stdin_still_times_out() {
        let job = format!(r#"{{"padding":"{}"}}"#, "x".repeat(1024 * 1024));
        let supervisor = Supervisor::new(options("exec sleep 30", Duration::from_millis(300), 1));

        let start = std::time::Instant::now();
        let report = supervisor.run(&job).await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.exit_code, RUNNER_TIMED_OUT);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_job_description_on_stdin() {
        let supervisor = Supervisor::new(options("cat", Duration::from_secs(30), 1));

        let report = supervisor.run(r#"{"device_id":"960123"}"#).await.unwrap();
        assert!(report.success);
        assert_eq!(report.output.len(), 1);
        assert_eq!(report.output[0].line, r#"{"device_id":"960123"}"#);
    }

    #[tokio::test]
    async fn test_interrupt_terminates_runner() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::new(options("exec sleep 30", Duration::from_secs(60), 3))
            .with_interrupt(token.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let report = supervisor.run("{}").await.unwrap();
        cancel.await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.exit_code, RUNNER_SIGNALLED);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_missing_runner_is_spawn_error() {
        let supervisor = Supervisor::new(SupervisorOptions {
            program: "/nonexistent/fwci-runner".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
            tries: 3,
            term_grace: Duration::from_secs(1),
        });
        assert!(matches!(
            supervisor.run("{}").await,
            Err(SupervisorError::Spawn { .. })
        ));
    }
}
