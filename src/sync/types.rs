//! Local process plumbing and rsync destinations.
//!
//! Helpers such as `rsync`, `ssh-keygen` and `git` run through
//! [`CommandRunner`] so tests can script their results.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;
use tracing::debug;

use crate::sync::SyncError;

/// Exit code and captured streams of a finished helper.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, absent when a signal ended the process.
    pub code: Option<i32>,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the helper exited zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Turns a non-zero exit into [`SyncError::CommandFailure`] for `program`.
    ///
    /// # Errors
    ///
    /// Returns the failure when the helper did not exit zero.
    pub fn success_or_failure(self, program: &str) -> Result<Self, SyncError> {
        if self.is_success() {
            return Ok(self);
        }
        let status_text = self
            .code
            .map_or_else(|| String::from("signal"), |code| code.to_string());
        Err(SyncError::CommandFailure {
            program: program.to_owned(),
            status: self.code,
            status_text,
            stderr: self.stderr.trim_end().to_owned(),
        })
    }
}

/// Runs a local helper to completion.
pub trait CommandRunner {
    /// Runs `program` with `args` and captures both output streams.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Spawn`] if the program cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SyncError>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SyncError> {
        debug!(program, args = args.len(), "running local helper");
        let finished = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| SyncError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(CommandOutput {
            code: finished.status.code(),
            stdout: String::from_utf8_lossy(&finished.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&finished.stderr).into_owned(),
        })
    }
}

/// Where rsync copies the workspace to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncDestination {
    /// An environment reached over SSH.
    Remote {
        /// Remote login.
        user: String,
        /// Host name or address.
        host: String,
        /// SSH port.
        port: u16,
        /// Private key used for authentication.
        identity: Utf8PathBuf,
        /// Remote directory receiving the files.
        path: Utf8PathBuf,
    },
    /// A local directory, used by tests.
    Local {
        /// Target directory.
        path: Utf8PathBuf,
    },
}
