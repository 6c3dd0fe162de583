//! The sandbox executor
//!
//! Runs one validated snippet inside a bounded worker. The worker is a
//! subprocess: the hard timeout, memory breach and build-abort paths all
//! terminate it with `start_kill`, never a cooperative signal, and the
//! slot is reclaimed after the kill is reaped.

use crate::context::ContextGroup;
use crate::harness::{split_envelope, WorkerBackend, WorkerJob};
use snipbox_core::{Bindings, ExecutionResult, ExecutionStatus};
use snipbox_policy::Policy;
use snipbox_validate::ValidatedSnippet;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::watch;
use uuid::Uuid;

/// Outcome of one sandbox run
#[derive(Debug)]
pub struct SandboxRun {
    /// Terminal result handed back to the pipeline
    pub result: ExecutionResult,
    /// Bindings produced on success, for cache replay; `None` on failure
    pub bindings: Option<Bindings>,
}

/// Executor errors that are not snippet results
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The encompassing build was aborted; the worker was hard-killed
    #[error("execution aborted")]
    Aborted,
}

/// Runs validated snippets in bounded workers
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    backend: Arc<dyn WorkerBackend>,
    sample_interval: Duration,
}

impl SandboxExecutor {
    /// Create an executor around a worker backend
    #[inline]
    #[must_use]
    pub fn new(backend: Arc<dyn WorkerBackend>) -> Self {
        Self {
            backend,
            sample_interval: Duration::from_millis(25),
        }
    }

    /// Override the memory sampling interval
    #[inline]
    #[must_use]
    pub fn with_sample_interval(mut self, sample_interval: Duration) -> Self {
        self.sample_interval = sample_interval;
        self
    }

    /// Execute a validated snippet under the given policy
    ///
    /// Context bindings (when a group lease is held by the caller) are
    /// injected as the worker's initial environment; on `Success` the new
    /// bindings are applied to the context atomically and also returned
    /// for cache replay. No mutation is visible on any failure path.
    ///
    /// # Errors
    /// Only [`SandboxError::Aborted`] when the build is cancelled; every
    /// other failure is a terminal [`ExecutionResult`].
    pub async fn execute(
        &self,
        validated: &ValidatedSnippet,
        mut context: Option<&mut ContextGroup>,
        policy: &Policy,
        abort: watch::Receiver<bool>,
    ) -> Result<SandboxRun, SandboxError> {
        let snippet = validated.snippet();
        let job = WorkerJob {
            source: snippet.source_text.clone(),
            bindings: context
                .as_ref()
                .map(|ctx| ctx.bindings().clone())
                .unwrap_or_default(),
            network_allowed: policy.network_allowed(),
            allowed_symbol_patterns: policy
                .allowed_symbol_patterns()
                .iter()
                .map(ToString::to_string)
                .collect(),
            forbidden_symbols: policy.forbidden_symbols().iter().cloned().collect(),
        };
        let marker = format!("::snipbox-result::{}::", Uuid::new_v4());
        let started = Instant::now();

        let mut child = match self.backend.launch(&job, &marker).await {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "worker failed to spawn");
                return Ok(SandboxRun {
                    result: ExecutionResult::failure(
                        ExecutionStatus::RuntimeError,
                        format!("worker failed to spawn: {e}"),
                        started.elapsed(),
                    ),
                    bindings: None,
                });
            }
        };

        // Feed the job; a worker that exits early just closes the pipe.
        if let Some(mut stdin) = child.stdin.take() {
            match serde_json::to_vec(&job) {
                Ok(payload) => {
                    let _ = stdin.write_all(&payload).await;
                    let _ = stdin.shutdown().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "job serialization failed");
                }
            }
        }

        let stdout_task = child.stdout.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });

        let verdict = self
            .supervise(&mut child, policy, abort, started)
            .await;

        // After a hard kill an orphaned grandchild may still hold the
        // pipes open; collection gets a bounded grace period instead of
        // waiting for EOF.
        let killed = !matches!(verdict, Verdict::Exited { .. });
        let stdout = collect_pipe(stdout_task, killed).await;
        let stderr = collect_pipe(stderr_task, killed).await;
        let duration = started.elapsed();

        let (result, bindings) = match verdict {
            Verdict::Aborted => return Err(SandboxError::Aborted),
            Verdict::TimedOut { peak } => {
                tracing::debug!(
                    timeout_ms = policy.timeout().as_millis() as u64,
                    "worker hard-killed on timeout"
                );
                let mut result = ExecutionResult::failure(
                    ExecutionStatus::Timeout,
                    format!("wall-clock timeout after {:?}", policy.timeout()),
                    duration,
                );
                result.stdout = stdout;
                result.peak_memory_bytes = peak;
                (result, None)
            }
            Verdict::MemoryExceeded { peak } => {
                tracing::debug!(
                    peak_memory_bytes = peak,
                    limit = policy.memory_limit_bytes(),
                    "worker hard-killed on memory ceiling"
                );
                let mut result = ExecutionResult::failure(
                    ExecutionStatus::ResourceExceeded,
                    format!(
                        "memory ceiling exceeded: {} bytes observed, {} allowed",
                        peak,
                        policy.memory_limit_bytes()
                    ),
                    duration,
                );
                result.stdout = stdout;
                result.peak_memory_bytes = peak;
                (result, None)
            }
            Verdict::Exited { peak, status } => self.interpret_exit(
                &marker,
                status,
                stdout,
                stderr,
                duration,
                peak,
                &mut context,
                snippet.sequence_index,
            ),
        };

        Ok(SandboxRun { result, bindings })
    }

    /// Wait for the child while enforcing timeout, memory and abort
    async fn supervise(
        &self,
        child: &mut Child,
        policy: &Policy,
        mut abort: watch::Receiver<bool>,
        started: Instant,
    ) -> Verdict {
        let pid = child.id();
        let deadline = tokio::time::sleep(policy.timeout());
        tokio::pin!(deadline);
        let mut sampler = tokio::time::interval(self.sample_interval);
        let mut peak = 0u64;

        loop {
            tokio::select! {
                () = &mut deadline => {
                    Self::kill(child).await;
                    tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "timeout");
                    return Verdict::TimedOut { peak };
                }
                _ = sampler.tick() => {
                    // Exit detection rides the sampling tick; the first
                    // tick fires immediately so short runs stay fast.
                    if let Ok(Some(status)) = child.try_wait() {
                        return Verdict::Exited { peak, status };
                    }
                    if let Some(rss) = pid.and_then(sample_resident_bytes) {
                        peak = peak.max(rss);
                        if rss > policy.memory_limit_bytes() {
                            Self::kill(child).await;
                            return Verdict::MemoryExceeded { peak };
                        }
                    }
                }
                changed = abort.changed() => {
                    let aborted = changed.is_err() || *abort.borrow();
                    if aborted {
                        Self::kill(child).await;
                        return Verdict::Aborted;
                    }
                }
            }
        }
    }

    async fn kill(child: &mut Child) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    #[allow(clippy::too_many_arguments)]
    fn interpret_exit(
        &self,
        marker: &str,
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration: Duration,
        peak: u64,
        context: &mut Option<&mut ContextGroup>,
        sequence_index: u32,
    ) -> (ExecutionResult, Option<Bindings>) {
        match split_envelope(&stdout, marker) {
            // A success envelope is only trusted when the interpreter
            // itself exited cleanly; a crash after the write (or a
            // fabricated envelope followed by `_exit`) must not land
            // bindings in the context.
            Some((output, envelope)) if envelope.ok && !status.success() => {
                tracing::warn!(%status, "worker reported success but exited with failure");
                let mut result = ExecutionResult::failure(
                    ExecutionStatus::RuntimeError,
                    format!("worker exited with {status} after reporting success"),
                    duration,
                );
                result.stdout = output;
                if !stderr.is_empty() {
                    result.stderr.push(b'\n');
                    result.stderr.extend_from_slice(&stderr);
                }
                result.peak_memory_bytes = peak;
                (result, None)
            }
            Some((output, envelope)) if envelope.ok => {
                if let Some(ctx) = context.as_deref_mut() {
                    ctx.apply(envelope.bindings.clone(), sequence_index);
                }
                (
                    ExecutionResult::success(
                        output,
                        stderr,
                        envelope.return_summary,
                        duration,
                        peak,
                    ),
                    Some(envelope.bindings),
                )
            }
            Some((output, envelope)) => {
                let mut message = stderr;
                if let Some(error) = &envelope.error {
                    if !message.is_empty() {
                        message.push(b'\n');
                    }
                    message.extend_from_slice(error.as_bytes());
                }
                let mut result = ExecutionResult {
                    status: ExecutionStatus::RuntimeError,
                    stdout: output,
                    stderr: message,
                    return_summary: None,
                    duration,
                    peak_memory_bytes: peak,
                    computed_at: chrono::Utc::now(),
                };
                if result.stderr.is_empty() {
                    result.stderr = b"snippet raised an error".to_vec();
                }
                (result, None)
            }
            None => {
                // Interpreter crash or protocol violation
                let mut result = ExecutionResult::failure(
                    ExecutionStatus::RuntimeError,
                    "worker exited without a result envelope",
                    duration,
                );
                if !stderr.is_empty() {
                    result.stderr = stderr;
                }
                result.stdout = stdout;
                result.peak_memory_bytes = peak;
                (result, None)
            }
        }
    }
}

async fn collect_pipe(
    task: Option<tokio::task::JoinHandle<Vec<u8>>>,
    killed: bool,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    if killed {
        match tokio::time::timeout(Duration::from_millis(200), task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    } else {
        task.await.unwrap_or_default()
    }
}

enum Verdict {
    Exited { peak: u64, status: ExitStatus },
    TimedOut { peak: u64 },
    MemoryExceeded { peak: u64 },
    Aborted,
}

/// Sample the worker's resident set size
///
/// Linux procfs only; other platforms report no samples and rely on the
/// wall-clock ceiling alone.
#[cfg(target_os = "linux")]
fn sample_resident_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn sample_resident_bytes(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn sampling_own_process_reports_memory() {
        let rss = sample_resident_bytes(std::process::id());
        assert!(rss.is_some_and(|bytes| bytes > 0));
    }
}
