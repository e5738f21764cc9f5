//! Workspace upload and remote command shaping.
//!
//! [`Syncer`] mirrors the local checkout into the environment's working
//! directory with `rsync` over the same SSH options the control channel
//! uses. Version-control metadata never leaves the machine.

use std::ffi::OsString;

use camino::Utf8Path;

use crate::connect::ConnectTarget;

mod config;
mod remote_command;
mod types;

pub use camino::Utf8PathBuf;
pub use config::{DEFAULT_REMOTE_PATH, SyncConfig, SyncError};
pub use remote_command::{
    MAX_COMMAND_LENGTH, render_command_args, validate_command_args, validate_remote_command,
    wrap_in_directory,
};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, SyncDestination};

/// Paths excluded from every upload.
const ALWAYS_EXCLUDED: [&str; 1] = [".git/"];

/// Uploads the workspace with `rsync`.
#[derive(Clone, Debug)]
pub struct Syncer<R: CommandRunner> {
    config: SyncConfig,
    runner: R,
}

impl Syncer<ProcessCommandRunner> {
    /// Syncer that spawns the real `rsync`.
    ///
    /// # Errors
    ///
    /// See [`Syncer::new`].
    pub fn with_process_runner(config: SyncConfig) -> Result<Self, SyncError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Syncer<R> {
    /// Validates `config` and pairs it with `runner`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] naming the first blank field.
    pub fn new(config: SyncConfig, runner: R) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Builds the remote destination for `target`.
    #[must_use]
    pub fn destination_for(&self, target: &ConnectTarget) -> SyncDestination {
        self.config.remote_destination(target)
    }

    /// Mirrors `source` into `destination`, honouring `.gitignore` and the
    /// configured exclusions.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingSource`] when `source` is not a directory,
    /// or [`SyncError::CommandFailure`] when `rsync` exits non-zero.
    pub fn sync(&self, source: &Utf8Path, destination: &SyncDestination) -> Result<(), SyncError> {
        let args = self.rsync_args(source, destination)?;
        self.runner
            .run(&self.config.rsync_bin, &args)?
            .success_or_failure(&self.config.rsync_bin)
            .map(drop)
    }

    fn rsync_args(
        &self,
        source: &Utf8Path,
        destination: &SyncDestination,
    ) -> Result<Vec<OsString>, SyncError> {
        if !source.is_dir() {
            return Err(SyncError::MissingSource {
                path: source.to_path_buf(),
            });
        }

        let mut args: Vec<OsString> = [
            "--archive",
            "--compress",
            "--delete",
            "--filter=:- .gitignore",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.extend(
            ALWAYS_EXCLUDED
                .iter()
                .copied()
                .chain(self.config.exclude.iter().map(String::as_str))
                .map(|pattern| OsString::from(format!("--exclude={pattern}"))),
        );

        let target = match destination {
            SyncDestination::Remote {
                user,
                host,
                port,
                identity,
                path,
            } => {
                args.push(OsString::from("--rsh"));
                args.push(OsString::from(self.remote_shell(*port, identity)));
                format!("{user}@{host}:{path}")
            }
            SyncDestination::Local { path } => path.to_string(),
        };
        // The trailing slash copies the directory's contents, not the directory.
        args.push(OsString::from(format!("{source}/")));
        args.push(OsString::from(target));
        Ok(args)
    }

    fn remote_shell(&self, port: u16, identity: &Utf8Path) -> String {
        let mut words = vec![self.config.ssh_bin.clone()];
        words.extend(
            self.config
                .ssh_options(port, identity)
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        words.join(" ")
    }
}

#[cfg(test)]
mod tests;
