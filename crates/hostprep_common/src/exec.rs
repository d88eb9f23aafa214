//! External tool invocation
//!
//! Every OS interaction outside this process goes through [`CommandRunner`]:
//! program, arguments, a hard timeout, captured exit code and output. A
//! timed-out process is killed and reported as [`ExecError::Timeout`], which
//! callers keep apart from a non-zero exit.

use crate::error::ExecError;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined, for keyword checks
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Decides when a long-running process has finished its job
pub trait CompletionDetector: Send + Sync {
    /// Called for every output line; true means done
    fn is_complete(&self, line: &str) -> bool;

    fn describe(&self) -> String;
}

/// Completion signalled by a literal phrase in the process output
#[derive(Debug, Clone)]
pub struct MarkerDetector {
    marker: String,
}

impl MarkerDetector {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl CompletionDetector for MarkerDetector {
    fn is_complete(&self, line: &str) -> bool {
        line.contains(&self.marker)
    }

    fn describe(&self) -> String {
        format!("output marker {:?}", self.marker)
    }
}

/// How a watched process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The detector fired; the process was terminated afterwards
    Signalled { transcript: Vec<String> },
    /// The process exited on its own without the detector firing
    Exited {
        exit_code: Option<i32>,
        transcript: Vec<String>,
    },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, bounded by `spec.timeout`
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Run until `detector` fires, the process exits, or `spec.timeout`
    /// elapses. The process is killed in the first and last case.
    async fn run_until(
        &self,
        spec: &CommandSpec,
        detector: &dyn CompletionDetector,
    ) -> Result<Completion, ExecError>;
}

/// Runs real processes with tokio
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW
            cmd.creation_flags(0x0800_0000);
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        debug!(command = %spec, timeout_secs = spec.timeout.as_secs(), "exec");

        let child = Self::command(spec).spawn().map_err(|source| ExecError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // kill_on_drop terminates the child if the timeout drops the future
        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ExecError::Io {
                program: spec.program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(command = %spec, "timed out, process terminated");
                return Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    after: spec.timeout,
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: decode_output(&output.stdout),
            stderr: decode_output(&output.stderr),
        };
        debug!(command = %spec, exit_code = ?result.exit_code, "exec finished");
        Ok(result)
    }

    async fn run_until(
        &self,
        spec: &CommandSpec,
        detector: &dyn CompletionDetector,
    ) -> Result<Completion, ExecError> {
        debug!(command = %spec, detector = %detector.describe(), "exec (watched)");

        let mut command = Self::command(spec);
        command.stderr(Stdio::null());
        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let io_err = |source: std::io::Error| ExecError::Io {
            program: spec.program.clone(),
            source,
        };

        let stdout = child.stdout.take().ok_or_else(|| {
            io_err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdout not captured",
            ))
        })?;
        let mut lines = BufReader::new(stdout).split(b'\n');
        let mut transcript = Vec::new();

        let watch = async {
            while let Some(raw) = lines.next_segment().await.map_err(io_err)? {
                let line = decode_output(&raw).trim_end().to_string();
                let done = detector.is_complete(&line);
                transcript.push(line);
                if done {
                    return Ok(true);
                }
            }
            Ok::<bool, ExecError>(false)
        };

        let watched = tokio::time::timeout(spec.timeout, watch).await;
        match watched {
            Ok(Ok(true)) => {
                debug!(command = %spec, "completion detected, terminating process");
                if let Err(e) = child.kill().await {
                    warn!(command = %spec, "failed to terminate after completion: {}", e);
                }
                Ok(Completion::Signalled { transcript })
            }
            Ok(Ok(false)) => {
                let status = child.wait().await.map_err(io_err)?;
                Ok(Completion::Exited {
                    exit_code: status.code(),
                    transcript,
                })
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(e)
            }
            Err(_) => {
                warn!(command = %spec, "timed out waiting for completion, process terminated");
                let _ = child.kill().await;
                Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    after: spec.timeout,
                })
            }
        }
    }
}

/// Decode process output. Several Windows tools (notably `wsl.exe`) write
/// UTF-16LE when redirected; that is detected by NUL bytes in odd positions.
pub fn decode_output(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    let odd_nuls = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    let looks_utf16 = bytes.len() >= 2 && odd_nuls * 2 >= bytes.len() / 2;

    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units).replace('\0', "")
    } else {
        String::from_utf8_lossy(bytes).replace('\0', "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_output(b"WSL version: 2.0.9.0\r\n"), "WSL version: 2.0.9.0\r\n");
    }

    #[test]
    fn test_decode_utf16le() {
        let bytes = utf16le("Default Version: 2\r\n");
        assert_eq!(decode_output(&bytes), "Default Version: 2\r\n");

        let mut with_bom = vec![0xFF, 0xFE];
        with_bom.extend(utf16le("hostprep\r\n"));
        assert_eq!(decode_output(&with_bom), "hostprep\r\n");
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new(
            "wsl.exe",
            ["--import", "hostprep", "C:\\Program Files\\x"],
            Duration::from_secs(1),
        );
        assert_eq!(spec.to_string(), "wsl.exe --import hostprep \"C:\\Program Files\\x\"");
    }

    #[test]
    fn test_marker_detector() {
        let d = MarkerDetector::new("setup complete");
        assert!(d.is_complete("[init] setup complete, shutting down"));
        assert!(!d.is_complete("setting up users"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_exit_code() {
        let runner = SystemCommandRunner;
        let out = runner
            .run(&CommandSpec::new("sh", ["-c", "echo hi; exit 3"], Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_timeout_is_distinct() {
        let runner = SystemCommandRunner;
        let err = runner
            .run(&CommandSpec::new("sleep", ["5"], Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_until_marker_terminates_process() {
        let runner = SystemCommandRunner;
        let spec = CommandSpec::new(
            "sh",
            ["-c", "echo booting; echo setup complete; sleep 30"],
            Duration::from_secs(10),
        );
        let result = runner
            .run_until(&spec, &MarkerDetector::new("setup complete"))
            .await
            .unwrap();
        match result {
            Completion::Signalled { transcript } => {
                assert_eq!(transcript, vec!["booting", "setup complete"]);
            }
            other => panic!("expected completion signal, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = SystemCommandRunner;
        let err = runner
            .run(&CommandSpec::new(
                "definitely-not-a-real-binary-hostprep",
                Vec::<String>::new(),
                Duration::from_secs(1),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
