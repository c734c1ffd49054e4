//! Subprocess invocation for the external `git` and `docker` binaries.
//!
//! Everything the pipeline needs from its collaborators goes through
//! [`Invoker`], which pins a working directory and produces cancellable
//! [`Invocation`]s. Stderr of long-running invocations can be streamed to
//! the log at debug level (container builds), otherwise it is captured
//! and attached to the failure.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors from subprocess execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The binary could not be started at all.
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The process exited with a non-zero status.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },

    /// The surrounding operation was cancelled and the child was killed.
    #[error("{program} cancelled")]
    Cancelled { program: String },

    /// Reading or writing a process pipe failed.
    #[error("process io: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for invocations bound to one working directory.
#[derive(Debug, Clone)]
pub struct Invoker {
    dir: PathBuf,
}

/// Returns an invoker bound to `dir`.
pub fn in_dir(dir: impl AsRef<Path>) -> Invoker {
    Invoker {
        dir: dir.as_ref().to_path_buf(),
    }
}

impl Invoker {
    /// Starts building an invocation of `program` with `args`.
    pub fn run<I, S>(&self, program: &str, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Invocation {
            program: program.to_string(),
            command,
            stdin: None,
            stream_stderr: false,
        }
    }
}

/// A prepared subprocess call.
pub struct Invocation {
    program: String,
    command: Command,
    stdin: Option<Vec<u8>>,
    stream_stderr: bool,
}

impl Invocation {
    /// Adds environment variables on top of the inherited environment.
    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in vars {
            self.command.env(key, value);
        }
        self
    }

    /// Feeds `input` to the child's stdin.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.command.stdin(Stdio::piped());
        self.stdin = Some(input.into());
        self
    }

    /// Streams child stderr lines to the log at debug level instead of
    /// only capturing them for the error message.
    pub fn stream_stderr(mut self) -> Self {
        self.stream_stderr = true;
        self
    }

    /// Runs to completion, discarding stdout.
    pub async fn exec(self, ctx: &CancellationToken) -> Result<(), CommandError> {
        self.output(ctx).await.map(|_| ())
    }

    /// Runs to completion and returns trimmed stdout.
    pub async fn output(mut self, ctx: &CancellationToken) -> Result<String, CommandError> {
        let program = self.program.clone();
        let mut child = self.command.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

        if let Some(input) = self.stdin.take() {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&input).await?;
                pipe.shutdown().await?;
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = {
            let program = program.clone();
            let stream = self.stream_stderr;
            tokio::spawn(async move {
                let mut collected = String::new();
                if let Some(pipe) = stderr {
                    let mut lines = BufReader::new(pipe).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if stream {
                            debug!(program = %program, "{line}");
                        }
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                }
                collected
            })
        };

        let stdout_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(pipe) = stdout {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let status = tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                let _ = child.kill().await;
                return Err(CommandError::Cancelled { program });
            }
            status = child.wait() => status?,
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        let stdout_text = stdout_task.await.unwrap_or_default();

        if !status.success() {
            return Err(CommandError::Failed {
                program,
                status: status.code().unwrap_or(-1),
                stderr: stderr_text.trim().to_string(),
            });
        }
        Ok(stdout_text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_output_captures_stdout() {
        let ctx = CancellationToken::new();
        let out = in_dir(".")
            .run("sh", ["-c", "echo hello"])
            .output(&ctx)
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let ctx = CancellationToken::new();
        let err = in_dir(".")
            .run("sh", ["-c", "echo broken >&2; exit 3"])
            .exec(&ctx)
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let ctx = CancellationToken::new();
        let out = in_dir(".")
            .run("cat", Vec::<&str>::new())
            .stdin("piped content")
            .output(&ctx)
            .await
            .unwrap();
        assert_eq!(out, "piped content");
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = in_dir(".")
            .run("sleep", ["30"])
            .exec(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_runs_in_directory() {
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let out = in_dir(dir.path())
            .run("ls", Vec::<&str>::new())
            .output(&ctx)
            .await
            .unwrap();
        assert!(out.contains("marker"));
    }
}
