//! External filter stages.

use crate::config::CommandSpec;
use crate::error::{CoreError, CoreResult};
use pgkeep_storage::BoxedReader;
use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 16;

/// One external program in a pipeline.
///
/// The program reads the stage input on stdin and writes the stage output on
/// stdout. Stderr is consumed by a monitor task and forwarded to `tracing`.
#[derive(Debug, Clone)]
pub struct FilterStage {
    name: String,
    command: CommandSpec,
    tolerate_exit: bool,
}

impl FilterStage {
    /// Creates a stage named `name` running `command`.
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            tolerate_exit: false,
        }
    }

    /// Logs a failed exit instead of failing the pipeline.
    ///
    /// Decompressors often exit non-zero when their reader stops early even
    /// though every byte was delivered.
    #[must_use]
    pub fn tolerate_exit(mut self) -> Self {
        self.tolerate_exit = true;
        self
    }

    /// Stage name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The command this stage runs.
    #[must_use]
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Spawns the program, feeding it `input`.
    ///
    /// Returns the program's stdout and a handle that must be drained and
    /// waited on once the output has been consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be spawned.
    pub fn run(&self, mut input: BoxedReader) -> CoreResult<(BoxedReader, StageHandle)> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CoreError::pipeline(format!(
                    "failed to start stage '{}' ({}): {err}",
                    self.name, self.command
                ))
            })?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(CoreError::pipeline(format!(
                "stage '{}' did not expose its stdio",
                self.name
            )));
        };

        let feeder = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut input, &mut stdin).await?;
            stdin.shutdown().await?;
            Ok(copied)
        });
        let monitor = tokio::spawn(monitor_stderr(self.name.clone(), stderr));

        debug!(stage = %self.name, command = %self.command, "stage started");
        Ok((
            Box::new(stdout),
            StageHandle {
                name: self.name.clone(),
                tolerate_exit: self.tolerate_exit,
                child,
                feeder,
                monitor,
            },
        ))
    }
}

/// Forwards stderr lines to `tracing`, returning the last few.
///
/// Lines need not be UTF-8. Stderr is always read to its end so the program
/// never blocks or dies writing to it.
async fn monitor_stderr(stage: String, stderr: ChildStderr) -> String {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                warn!(stage = %stage, "{line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(err) => {
                debug!(stage = %stage, error = %err, "stderr unreadable, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

/// A running stage whose stderr monitor has not been joined yet.
///
/// Only [`StageHandle::drain`] is available: every monitor of a pipeline
/// must finish before any process is waited on.
#[derive(Debug)]
pub struct StageHandle {
    name: String,
    tolerate_exit: bool,
    child: Child,
    feeder: JoinHandle<io::Result<u64>>,
    monitor: JoinHandle<String>,
}

impl StageHandle {
    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Joins the stderr monitor.
    ///
    /// Resolves once the program closed its stderr, which normally happens
    /// when it exits.
    pub async fn drain(self) -> DrainedStage {
        let stderr = match self.monitor.await {
            Ok(tail) => tail,
            Err(err) => {
                warn!(stage = %self.name, error = %err, "stderr monitor task failed");
                String::new()
            }
        };
        DrainedStage {
            name: self.name,
            tolerate_exit: self.tolerate_exit,
            child: self.child,
            feeder: self.feeder,
            stderr,
        }
    }
}

/// A stage whose stderr has been fully consumed.
#[derive(Debug)]
pub struct DrainedStage {
    name: String,
    tolerate_exit: bool,
    child: Child,
    feeder: JoinHandle<io::Result<u64>>,
    stderr: String,
}

impl DrainedStage {
    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the program and its input feeder.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StageFailed`] for a non-zero exit unless the
    /// stage tolerates it, or the feeder's error if the input could not be
    /// read.
    pub async fn wait(mut self) -> CoreResult<()> {
        let status = self.child.wait().await?;
        let fed = self
            .feeder
            .await
            .map_err(|err| CoreError::pipeline(format!("stage '{}' feeder: {err}", self.name)))?;

        if !status.success() {
            if self.tolerate_exit {
                warn!(stage = %self.name, status = %status, "ignoring stage exit status");
                return Ok(());
            }
            return Err(CoreError::StageFailed {
                stage: self.name,
                code: status.code(),
                stderr: self.stderr,
            });
        }

        match fed {
            Ok(bytes) => {
                debug!(stage = %self.name, bytes, "stage finished");
                Ok(())
            }
            // The program exited cleanly without reading all of its input.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!(stage = %self.name, "stage closed stdin early");
                Ok(())
            }
            Err(err) => Err(CoreError::Io(err)),
        }
    }
}
