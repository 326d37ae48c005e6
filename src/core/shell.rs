//! External command execution

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Output of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,
    /// stdout followed by stderr, line by line
    pub lines: Vec<String>,
}

impl CommandOutput {
    /// Exited with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Build a command running `cmd` through the platform shell
pub fn shell_command(cmd: &str) -> Command {
    #[cfg(unix)]
    {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
    #[cfg(not(unix))]
    {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    }
}

/// Substitute `{name}` placeholders in a command template
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

/// Run `cmd` to completion, optionally feeding `stdin`, capturing its output.
pub async fn run_captured(cmd: &str, stdin: Option<&str>) -> std::io::Result<CommandOutput> {
    let mut command = shell_command(cmd);
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::join!(read_lines(stdout), read_lines(stderr));
    let status = child.wait().await?;

    let mut lines = out?;
    lines.extend(err?);
    Ok(CommandOutput {
        code: status.code(),
        lines,
    })
}

async fn read_lines<R>(reader: Option<R>) -> std::io::Result<Vec<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    if let Some(reader) = reader {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            collected.push(line);
        }
    }
    Ok(collected)
}
