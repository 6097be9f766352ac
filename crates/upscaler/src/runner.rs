use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Number of trailing output lines kept for error diagnostics
const OUTPUT_TAIL_LINES: usize = 8;

/// How a supervised subprocess ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Process exited on its own; `tail` holds its last output lines
    Exited { code: i32, tail: Vec<String> },
    /// Cancellation arrived first and the process was terminated
    Canceled,
}

/// Supervisor for a single external process.
///
/// One runner is scoped to one subprocess invocation; it holds no state
/// between invocations. Combined stdout/stderr output is streamed
/// line-by-line to the caller in arrival order, and the calling stage blocks
/// until the process exits or the cancellation token fires — in which case
/// the process gets a termination request, a bounded grace period, and a
/// forced kill if it is still around.
pub struct ToolRunner {
    term_grace: Duration,
}

impl ToolRunner {
    pub fn new(term_grace: Duration) -> Self {
        Self { term_grace }
    }

    /// Run one subprocess to completion or cancellation
    pub async fn run<F>(
        &self,
        program: &Path,
        args: &[String],
        work_dir: Option<&Path>,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<RunOutcome, PipelineError>
    where
        F: FnMut(&str),
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }

        debug!("Running: {} {}", program.display(), args.join(" "));

        let mut child = cmd.spawn()?;

        // Fan both pipes into one channel so lines arrive in the order the
        // tool produced them.
        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut tail: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                maybe_line = rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            push_tail(&mut tail, &line);
                            on_line(&line);
                        }
                        None => {
                            // Both pipes hit EOF; all that is left is the exit status
                            let status = tokio::select! {
                                status = child.wait() => status?,
                                _ = cancel.cancelled() => {
                                    self.terminate(&mut child, program).await;
                                    return Ok(RunOutcome::Canceled);
                                }
                            };
                            let code = status.code().unwrap_or(-1);
                            return Ok(RunOutcome::Exited { code, tail });
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    self.terminate(&mut child, program).await;
                    return Ok(RunOutcome::Canceled);
                }
            }
        }
    }

    /// Termination request first, forced kill after the grace period
    async fn terminate(&self, child: &mut tokio::process::Child, program: &Path) {
        warn!("Cancellation requested, terminating {}", program.display());
        if let Err(e) = child.start_kill() {
            warn!("Failed to signal {}: {}", program.display(), e);
        }
        if timeout(self.term_grace, child.wait()).await.is_err() {
            warn!(
                "{} did not exit within {}s, force killing",
                program.display(),
                self.term_grace.as_secs()
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program.display(), e);
            }
        }
    }
}

fn push_tail(tail: &mut Vec<String>, line: &str) {
    if tail.len() == OUTPUT_TAIL_LINES {
        tail.remove(0);
    }
    tail.push(line.to_string());
}
