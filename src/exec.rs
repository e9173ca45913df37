//! Command executor (§4.A): spawns single processes, locally or — via a
//! caller-supplied remote-command prefix — on a remote host, and reports
//! their outcome.

use std::io;
use std::process::{Child, Command, Stdio};

use derive_more::{Display, Error, From};

/// How a spawned command's stderr should be handled.
///
/// `Capture` degrades to `Discard` when `--no-read-stderr` is in effect
/// (§4.A): reading stderr from a long-lived remote connection that keeps it
/// open (e.g. SSH with `ControlPersist`) would block the parent forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    Capture,
    Inherit,
    Discard,
}

impl StderrMode {
    /// Applies the `--no-read-stderr` policy at the call site.
    pub fn effective(self, no_read_stderr: bool) -> StderrMode {
        if no_read_stderr && self == StderrMode::Capture {
            StderrMode::Discard
        } else {
            self
        }
    }

    fn to_stdio(self) -> Stdio {
        match self {
            StderrMode::Capture => Stdio::piped(),
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Discard => Stdio::null(),
        }
    }
}

/// The result of a completed (non-streaming) command invocation.
#[derive(Debug)]
pub struct Executed {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Option<String>,
}

#[derive(Debug, Display, Error, From)]
pub enum ExecError {
    /// `argv` was empty — nothing to execute.
    #[display("empty command")]
    EmptyArgv,

    /// The process could not even be spawned (binary missing, permission
    /// denied, ...).
    #[display("failed to spawn {argv:?}: {source}")]
    Spawn {
        #[error(ignore)]
        argv: Vec<String>,
        source: io::Error,
    },

    /// The process was spawned and ran, but exited with a non-zero status.
    /// `stderr` is `None` when the caller discarded it (§4.A).
    #[display("command {argv:?} exited with code {exit_code}{}", stderr.as_deref().map(|s| format!(": {s}")).unwrap_or_default())]
    CommandFailed {
        #[error(ignore)]
        argv: Vec<String>,
        #[error(ignore)]
        exit_code: i32,
        #[error(ignore)]
        stderr: Option<String>,
    },

    /// Waiting on an already-spawned child failed at the OS level.
    #[display("failed while waiting on a spawned command: {_0}")]
    #[from]
    Wait(io::Error),
}

/// Prefixes `argv` with a remote-command vector, if any. This is the only
/// place remote-prefixing composition happens; every caller (pipeline
/// builder, repository) routes through here (§4.B design note).
pub fn remote_argv(remote_cmd: Option<&[String]>, argv: &[String]) -> Vec<String> {
    match remote_cmd {
        Some(prefix) => prefix.iter().cloned().chain(argv.iter().cloned()).collect(),
        None => argv.to_vec(),
    }
}

fn build_command(argv: &[String]) -> Result<Command, ExecError> {
    let (program, args) = argv.split_first().ok_or(ExecError::EmptyArgv)?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Spawns `argv` with the given stdio dispositions, returning the live
/// [`Child`] for the caller (the pipeline builder) to wire into a chain.
pub fn spawn(
    argv: &[String],
    stdin: Stdio,
    stdout: Stdio,
    stderr_mode: StderrMode,
) -> Result<Child, ExecError> {
    let mut cmd = build_command(argv)?;
    cmd.stdin(stdin).stdout(stdout).stderr(stderr_mode.to_stdio());
    cmd.spawn().map_err(|source| ExecError::Spawn {
        argv: argv.to_vec(),
        source,
    })
}

/// Runs `argv` to completion (no streaming), optionally capturing stdout.
/// This is the executor's `run` operation (§4.A) used by callers that need
/// a single command's result rather than a pipeline stage.
pub fn run(
    argv: &[String],
    stdin: Stdio,
    capture_stdout: bool,
    stderr_mode: StderrMode,
) -> Result<Executed, ExecError> {
    let stdout_disp = if capture_stdout { Stdio::piped() } else { Stdio::null() };
    let child = spawn(argv, stdin, stdout_disp, stderr_mode)?;
    let output = child.wait_with_output()?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stderr = matches!(stderr_mode, StderrMode::Capture)
        .then(|| String::from_utf8_lossy(&output.stderr).into_owned());

    if !output.status.success() {
        return Err(ExecError::CommandFailed {
            argv: argv.to_vec(),
            exit_code,
            stderr,
        });
    }

    Ok(Executed {
        exit_code,
        stdout: output.stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn runs_a_successful_command_and_captures_stdout() {
        let executed = run(&argv(&["printf", "hi"]), Stdio::null(), true, StderrMode::Discard).unwrap();
        assert_eq!(executed.exit_code, 0);
        assert_eq!(executed.stdout, b"hi");
    }

    #[test]
    fn nonzero_exit_is_reported_as_command_failed() {
        let err = run(&argv(&["false"]), Stdio::null(), false, StderrMode::Discard).unwrap_err();
        assert!(matches!(err, ExecError::CommandFailed { exit_code: 1, .. }));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = run(&argv(&["definitely-not-a-real-binary-xyz"]), Stdio::null(), false, StderrMode::Discard)
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn no_read_stderr_degrades_capture_to_discard() {
        assert_eq!(StderrMode::Capture.effective(true), StderrMode::Discard);
        assert_eq!(StderrMode::Capture.effective(false), StderrMode::Capture);
        assert_eq!(StderrMode::Inherit.effective(true), StderrMode::Inherit);
    }

    #[test]
    fn remote_prefix_is_prepended() {
        let remote = argv(&["ssh", "host"]);
        let cmd = argv(&["btrfs", "send", "x"]);
        assert_eq!(
            remote_argv(Some(&remote), &cmd),
            argv(&["ssh", "host", "btrfs", "send", "x"])
        );
        assert_eq!(remote_argv(None, &cmd), cmd);
    }
}
