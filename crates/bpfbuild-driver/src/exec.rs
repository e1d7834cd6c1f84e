//! Timeout-bounded execution of toolchain binaries with captured output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Applied when a caller passes a zero stage timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Shared cancellation flag spanning a whole build run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured output of a completed tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Display form of the invocation. Never executed.
    pub command: String,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` canceled")]
    Canceled { command: String },
    #[error("`{command}` exited with status {status}\nstderr:\n{stderr}")]
    NonZeroExit {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },
    #[error("i/o error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// External-process invocation capability. The build pipeline takes this as a
/// collaborator so tests can substitute a deterministic fake.
pub trait ToolRunner: Send + Sync {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ExecError>;
}

/// Default [`ToolRunner`] spawning real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ExecError> {
        let timeout = if timeout.is_zero() {
            DEFAULT_STAGE_TIMEOUT
        } else {
            timeout
        };
        let command = display_command(program, args);
        debug!(%command, "spawning tool");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout_pipe = child.stdout.take().ok_or_else(|| ExecError::Io {
            command: command.clone(),
            source: std::io::Error::other("stdout pipe missing"),
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| ExecError::Io {
            command: command.clone(),
            source: std::io::Error::other("stderr pipe missing"),
        })?;

        let stdout_thread = std::thread::spawn(move || read_all(stdout_pipe));
        let stderr_thread = std::thread::spawn(move || read_all(stderr_pipe));

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecError::Io {
                        command: command.clone(),
                        source,
                    });
                }
            }
            if cancel.is_canceled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Canceled { command });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Timeout { command, timeout });
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        if !status.success() {
            return Err(ExecError::NonZeroExit {
                command,
                status: status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            command,
        })
    }
}

fn read_all<R: Read>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Builds the display form of an invocation, quoting only arguments that
/// contain whitespace or are empty.
pub fn display_command(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(quote_arg(&program.display().to_string()));
    for arg in args {
        parts.push(quote_arg(arg));
    }
    parts.join(" ")
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace()) {
        format!("'{arg}'")
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn quotes_only_spaced_and_empty_args() {
        let cmd = display_command(
            &PathBuf::from("/usr/bin/opt"),
            &[
                "-passes=default<Oz>".to_string(),
                "a file.bc".to_string(),
                String::new(),
            ],
        );
        assert_eq!(cmd, "/usr/bin/opt -passes=default<Oz> 'a file.bc' ''");
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_on_success() {
        let out = SystemRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_string(), "printf hello".to_string()],
                Duration::from_secs(10),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(out.stdout, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_carries_stderr() {
        let err = SystemRunner
            .run(
                Path::new("/bin/sh"),
                &[
                    "-c".to_string(),
                    "echo diag 1>&2; exit 3".to_string(),
                ],
                Duration::from_secs(10),
                &CancelToken::new(),
            )
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("diag"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn slow_process_times_out_and_is_killed() {
        let started = Instant::now();
        let err = SystemRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_string(), "sleep 30".to_string()],
                Duration::from_millis(200),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }), "got {err:?}");
        // The child was killed and reaped, so we return long before its
        // nominal 30s runtime.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn canceled_token_kills_process() {
        let cancel = CancelToken::new();
        let canceler = {
            let token = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                token.cancel();
            })
        };
        let started = Instant::now();
        let err = SystemRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_string(), "sleep 30".to_string()],
                Duration::from_secs(60),
                &cancel,
            )
            .unwrap_err();
        canceler.join().unwrap();
        assert!(matches!(err, ExecError::Canceled { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_gets_default() {
        // Substitution happens before spawn, so a nonexistent binary with a
        // zero timeout still reports a spawn failure, not a timeout.
        let err = SystemRunner
            .run(
                Path::new("/nonexistent/bpfbuild-tool"),
                &[],
                Duration::ZERO,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
