//! External tool invocation with bounded execution time
//!
//! Wine, winetricks and the package manager are opaque executables: success is
//! the exit code, output is only kept as a diagnostic attachment.

use crate::error::{AffinityError, Result};
use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes of stdout/stderr retained for diagnostics.
const OUTPUT_TAIL_BYTES: usize = 4096;

/// How long to keep reading output after the tool itself has exited.
/// Daemonized children (wineserver) may hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved external command
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Value of an environment variable set on this command
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Shell-like rendering for logs and dry-run annotations
    pub fn display(&self) -> String {
        let mut rendered = String::new();
        for (key, value) in &self.env {
            if key == "WINEPREFIX" || key == "WINEARCH" {
                rendered.push_str(&format!("{}={} ", key, value));
            }
        }
        rendered.push_str(&self.program.display().to_string());
        for arg in &self.args {
            if arg.contains(' ') {
                rendered.push_str(&format!(" \"{}\"", arg));
            } else {
                rendered.push(' ');
                rendered.push_str(arg);
            }
        }
        rendered
    }
}

/// Result of a finished (or timed out) invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Human readable failure reason with the tail of stderr attached
    pub fn failure_reason(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            }
        };
        let detail = self.stderr.trim();
        if detail.is_empty() {
            status
        } else {
            format!("{}: {}", status, detail)
        }
    }
}

/// Runs external tools. Implemented by [`SystemRunner`] and by test fakes.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion or until `command.timeout` elapses.
    ///
    /// Only a failure to start the process is an `Err`; non-zero exits and
    /// timeouts are reported through [`ToolOutput`].
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput>;
}

/// Spawns tools in their own process group so a timeout takes down
/// wineserver children along with the tool itself.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl ToolRunner for SystemRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        debug!("Running: {}", command.display());

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .group_spawn()
            .map_err(|e| AffinityError::CommandExecution {
                command: command.display(),
                error: e.to_string(),
            })?;

        let stdout = child.inner().stdout.take().map(spawn_tail_reader);
        let stderr = child.inner().stderr.take().map(spawn_tail_reader);

        let (exit_code, timed_out) =
            match tokio::time::timeout(command.timeout, child.wait()).await {
                Ok(status) => (status?.code(), false),
                Err(_) => {
                    warn!(
                        "{} exceeded {}s, killing process group",
                        command.display(),
                        command.timeout.as_secs()
                    );
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill process group: {}", e);
                    }
                    let _ = child.wait().await;
                    (None, true)
                }
            };

        Ok(ToolOutput {
            exit_code,
            timed_out,
            stdout: join_tail(stdout).await,
            stderr: join_tail(stderr).await,
        })
    }
}

fn spawn_tail_reader<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        let start = buf.len().saturating_sub(OUTPUT_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).into_owned()
    })
}

async fn join_tail(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            debug!("Output pipe still open after exit; dropping the reader");
            abort.abort();
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_exit_code_and_output() {
        let cmd = ToolCommand::new("/bin/sh", Duration::from_secs(10))
            .args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = SystemRunner.run(&cmd).await.unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.failure_reason(), "exit code 3: oops");
    }

    #[tokio::test]
    async fn timeout_is_a_failed_invocation() {
        let cmd = ToolCommand::new("/bin/sh", Duration::from_millis(200)).args(["-c", "sleep 5"]);
        let output = SystemRunner.run(&cmd).await.unwrap();

        assert!(output.timed_out);
        assert!(!output.success());
        assert!(output.failure_reason().starts_with("timed out"));
    }

    #[tokio::test]
    async fn background_child_holding_stdout_does_not_block_return() {
        let cmd = ToolCommand::new("/bin/sh", Duration::from_secs(10))
            .args(["-c", "sleep 20 & exit 0"]);

        let started = std::time::Instant::now();
        let output = SystemRunner.run(&cmd).await.unwrap();

        assert!(output.success());
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let cmd = ToolCommand::new("/nonexistent/affinity-tool", Duration::from_secs(1));
        let err = SystemRunner.run(&cmd).await.unwrap_err();
        assert!(matches!(err, AffinityError::CommandExecution { .. }));
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = ToolCommand::new("/usr/bin/wine", Duration::from_secs(1))
            .arg("/cache/Affinity Setup.exe")
            .arg("/quiet")
            .env("WINEPREFIX", "/home/u/.wine-affinity")
            .env("WINEDEBUG", "-all");
        assert_eq!(
            cmd.display(),
            "WINEPREFIX=/home/u/.wine-affinity /usr/bin/wine \"/cache/Affinity Setup.exe\" /quiet"
        );
    }
}
