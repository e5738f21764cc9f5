//! `[sync]` settings: helper binaries and the SSH options every session
//! shares.
//!
//! The same [`SyncConfig`] drives rsync's remote shell and the control
//! channel, so an option set here applies to probes, commands, and uploads
//! alike.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::connect::ConnectTarget;

use super::types::SyncDestination;

/// Default remote working directory used for rsync and commands.
pub const DEFAULT_REMOTE_PATH: &str = "/root/workspace";

/// Synchronisation and SSH settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BIVOUAC_SYNC",
    discovery(
        app_name = "bivouac",
        env_var = "BIVOUAC_CONFIG_PATH",
        config_file_name = "bivouac.toml",
        dotfile_name = ".bivouac.toml",
        project_file_name = "bivouac.toml"
    )
)]
pub struct SyncConfig {
    /// `rsync` binary used for uploads.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// `ssh` binary used for probes, commands, tunnels, and rsync.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Login on the environment.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote path receiving the repository contents; commands run here.
    #[ortho_config(default = DEFAULT_REMOTE_PATH.to_owned())]
    pub remote_path: String,
    /// Enforce host key checking. Off by default: every environment gets a
    /// fresh host key.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file; `/dev/null` keeps throwaway keys out of the user's.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Per-probe SSH connect timeout in seconds.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u64,
    /// Extra rsync exclude patterns, on top of `.gitignore` and `.git/`.
    /// `BIVOUAC_SYNC_EXCLUDE` takes a comma-separated list.
    #[serde(default)]
    #[ortho_config(default = vec![], merge_strategy = "append")]
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rsync_bin: String::from("rsync"),
            ssh_bin: String::from("ssh"),
            ssh_user: String::from("root"),
            remote_path: DEFAULT_REMOTE_PATH.to_owned(),
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            ssh_connect_timeout_secs: 10,
            exclude: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Rejects blank binaries, user, remote path, or exclude entries.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), SyncError> {
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_value(&self.remote_path, "remote_path")?;
        if self.exclude.iter().any(|pattern| pattern.trim().is_empty()) {
            return Err(SyncError::InvalidConfig {
                field: String::from("exclude"),
            });
        }
        Ok(())
    }

    /// Loads `[sync]` from `bivouac.toml` and `BIVOUAC_SYNC_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] naming the loader failure when
    /// merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SyncError> {
        Self::load_from_iter([OsString::from("bivouac")]).map_err(|err| SyncError::Load {
            message: err.to_string(),
        })
    }

    /// Builds a remote destination for `target`.
    #[must_use]
    pub fn remote_destination(&self, target: &ConnectTarget) -> SyncDestination {
        SyncDestination::Remote {
            user: target.user.clone(),
            host: target.host.clone(),
            port: target.port,
            identity: target.key_file.clone(),
            path: Utf8PathBuf::from(&self.remote_path),
        }
    }

    /// SSH options shared by rsync's remote shell and the control channel.
    ///
    /// Batch mode is always on; nothing here may prompt.
    #[must_use]
    pub fn ssh_options(&self, port: u16, identity: &Utf8Path) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(port.to_string()),
            OsString::from("-i"),
            OsString::from(identity.as_str()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("IdentitiesOnly=yes"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.ssh_connect_timeout_secs
            )),
        ];

        if !self.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.ssh_known_hosts_file
            )));
        }

        args
    }

    fn require_value(value: &str, field: &str) -> Result<(), SyncError> {
        if value.trim().is_empty() {
            return Err(SyncError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}

/// Errors surfaced while synchronising or running local helper commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// A required setting is blank; the message names where to set it.
    #[error("missing {field}: set BIVOUAC_SYNC_{env_suffix} or add {field} to [sync] in bivouac.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Field name under `[sync]`.
        field: String,
    },
    /// `[sync]` layers could not be merged.
    #[error("sync configuration parsing failed: {message}")]
    Load {
        /// Loader message.
        message: String,
    },
    /// The workspace to upload is not a directory.
    #[error("workspace to upload is not a directory: {path}")]
    MissingSource {
        /// Workspace path.
        path: Utf8PathBuf,
    },
    /// A local helper could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Helper binary.
        program: String,
        /// Spawn error text.
        message: String,
    },
    /// A local helper exited non-zero.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Helper binary.
        program: String,
        /// Exit code, absent when a signal ended the helper.
        status: Option<i32>,
        /// Exit code as text, or `signal`.
        status_text: String,
        /// Trimmed stderr of the helper.
        stderr: String,
    },
    /// A remote command is empty or too long.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}
