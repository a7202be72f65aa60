//! Command runner abstraction used by the SSH transport.

use std::ffi::OsString;
use std::process::Stdio;

use tokio::process::Command;

use super::{TransportError, TransportFuture};

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Implementations return [`TransportError::Spawn`] if the command
    /// cannot be started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> TransportFuture<'a, CommandOutput>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> TransportFuture<'a, CommandOutput> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| TransportError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
