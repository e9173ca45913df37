//! Pipeline builder (§4.B): composes a sequence of stages into a single
//! chained stdin→stdout pipeline, spawns them, and guarantees teardown on
//! every exit path.

use std::io;
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, Error};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::exec::{self, ExecError, StderrMode};

/// Bounded grace period given to a stage to exit on its own before the
/// pipeline sends it a termination signal (§4.B, §5: "no operation has an
/// internal timeout" refers to suspension points other than teardown; the
/// teardown grace periods themselves are a deliberately bounded exception so
/// a wedged filter can't hang the whole invocation forever).
const WAIT_GRACE: Duration = Duration::from_secs(10);
/// Further grace given after sending `SIGTERM`, before escalating to a
/// forced `SIGKILL` (§4.B "wait (with a bounded grace), then send
/// termination, then force-kill").
const TERM_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One not-yet-spawned element of a pipeline: an argv plus whether it runs
/// through the remote-command prefix.
#[derive(Debug, Clone)]
pub struct RawStage {
    pub argv: Vec<String>,
    pub remote: bool,
}

impl RawStage {
    pub fn new(argv: Vec<String>, remote: bool) -> Self {
        RawStage { argv, remote }
    }

    pub fn local(argv: Vec<String>) -> Self {
        RawStage { argv, remote: false }
    }

    pub fn remote(argv: Vec<String>) -> Self {
        RawStage { argv, remote: true }
    }

    fn resolve(&self, remote_cmd: Option<&[String]>) -> Vec<String> {
        if self.remote {
            exec::remote_argv(remote_cmd, &self.argv)
        } else {
            self.argv.clone()
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum PipelineError {
    /// No stages were given to build.
    #[display("pipeline has no stages")]
    Empty,

    /// Building failed part-way through; already-spawned stages have been
    /// torn down before this error is returned (§4.B, §7 "pipeline build
    /// error").
    #[display("failed to spawn pipeline stage {argv:?}: {source}")]
    Spawn {
        #[error(ignore)]
        argv: Vec<String>,
        source: ExecError,
    },
}

struct SpawnedStage {
    argv: Vec<String>,
    child: Option<Child>,
}

/// The outcome of one stage after the pipeline has finished executing.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub stderr: Option<String>,
}

/// A spawned, live chain of processes. Dropping a [`Pipeline`] that hasn't
/// been explicitly [`wait`](Pipeline::wait)ed tears down every still-running
/// stage, in reverse spawn order (§4.B, §9 scoped-release).
pub struct Pipeline {
    stages: Vec<SpawnedStage>,
    stderr_mode: StderrMode,
}

impl Pipeline {
    /// Spawns every stage in `raw`, wiring each stage's stdout directly into
    /// the next stage's stdin. The parent's copy of every intermediate pipe
    /// end is released as soon as it is handed to the next `spawn` call, so
    /// EOF propagates correctly (§4.B "pipe wiring"; §9 "cyclic
    /// producer/consumer coupling").
    pub fn build(
        raw: Vec<RawStage>,
        remote_cmd: Option<&[String]>,
        stderr_mode: StderrMode,
    ) -> Result<Pipeline, PipelineError> {
        if raw.is_empty() {
            return Err(PipelineError::Empty);
        }

        let last = raw.len() - 1;
        let mut stages: Vec<SpawnedStage> = Vec::with_capacity(raw.len());
        let mut next_stdin = Stdio::null();

        for (i, stage) in raw.into_iter().enumerate() {
            let argv = stage.resolve(remote_cmd);
            let stdout_disp = if i == last { Stdio::null() } else { Stdio::piped() };

            match exec::spawn(&argv, next_stdin, stdout_disp, stderr_mode) {
                Ok(mut child) => {
                    next_stdin = match child.stdout.take() {
                        Some(out) => Stdio::from(out),
                        None => Stdio::null(),
                    };
                    stages.push(SpawnedStage {
                        argv,
                        child: Some(child),
                    });
                }
                Err(source) => {
                    let mut partial = Pipeline { stages, stderr_mode };
                    partial.teardown();
                    return Err(PipelineError::Spawn { argv, source });
                }
            }
        }

        Ok(Pipeline { stages, stderr_mode })
    }

    /// Waits for every stage to exit, in reverse spawn order (§5 "Ordering
    /// guarantees"), and returns each stage's outcome in original (forward)
    /// order.
    pub fn wait(mut self) -> Vec<StageOutcome> {
        let mut outcomes: Vec<Option<StageOutcome>> = self.stages.iter().map(|_| None).collect();

        for i in (0..self.stages.len()).rev() {
            let stage = &mut self.stages[i];
            let Some(mut child) = stage.child.take() else {
                continue;
            };
            let status = wait_with_grace(&mut child);
            let stderr = matches!(self.stderr_mode, StderrMode::Capture)
                .then(|| read_stderr(&mut child))
                .flatten();

            let exit_code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
            outcomes[i] = Some(StageOutcome {
                argv: stage.argv.clone(),
                exit_code,
                stderr,
            });
        }

        outcomes.into_iter().map(|o| o.expect("every stage was waited on")).collect()
    }

    fn teardown(&mut self) {
        for stage in self.stages.iter_mut().rev() {
            if let Some(mut child) = stage.child.take() {
                let _ = wait_with_grace(&mut child);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The three-phase teardown discipline required by §4.B: wait for the stage
/// to exit on its own (bounded grace), then send it a termination signal and
/// give it a second, shorter grace to act on it, and only then force-kill.
fn wait_with_grace(child: &mut Child) -> io::Result<ExitStatus> {
    if let Some(status) = poll_for(child, WAIT_GRACE)? {
        return Ok(status);
    }

    log::warn!(target: "pipeline", "stage exceeded teardown grace period, sending SIGTERM");
    send_term(child);
    if let Some(status) = poll_for(child, TERM_GRACE)? {
        return Ok(status);
    }

    log::warn!(target: "pipeline", "stage ignored SIGTERM, killing it");
    let _ = child.kill();
    child.wait()
}

/// Polls `child` for exit until `timeout` elapses, returning `None` if it is
/// still running when the deadline passes.
fn poll_for(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Sends `SIGTERM` to `child`, best-effort: a failure here (e.g. the process
/// exited in the race between the last `try_wait` and this call) just means
/// the next phase's `try_wait`/`kill` will find it already gone.
fn send_term(child: &Child) {
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
        log::debug!(target: "pipeline", "SIGTERM to pid {pid} failed: {err}");
    }
}

fn read_stderr(child: &mut Child) -> Option<String> {
    use std::io::Read;
    let mut stderr = child.stderr.take()?;
    let mut buf = String::new();
    let _ = stderr.read_to_string(&mut buf);
    Some(buf)
}

/// True iff every stage in `outcomes` exited with code zero (§4.B).
pub fn is_success(outcomes: &[StageOutcome]) -> bool {
    outcomes.iter().all(|o| o.exit_code == 0)
}
