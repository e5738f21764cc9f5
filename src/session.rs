//! Local cache of live connection records.
//!
//! A record names the process that owns an environment's session and the
//! coordinates needed to reach its instance. Records whose owner process no
//! longer exists are stale and are removed when read.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::connect::ConnectTarget;

const SESSION_SUFFIX: &str = ".session.json";

/// Answers whether a process id is still alive.
pub trait ProcessProbe {
    /// Returns `true` when `pid` names a running process.
    fn is_running(&self, pid: u32) -> bool;
}

/// Checks liveness by sending the null signal to the process.
///
/// `EPERM` means the process exists under another user, so it counts as
/// alive. Ids outside the platform's pid range are never alive.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_running(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(Errno::ESRCH) => false,
            Err(err) => {
                debug!(pid, error = %err, "liveness check failed; treating process as gone");
                false
            }
        }
    }
}

/// Persisted description of a live session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConnectionRecord {
    /// Environment name.
    pub name: String,
    /// Process owning the session.
    pub pid: u32,
    /// Provider instance id.
    pub instance_id: String,
    /// Zone hosting the instance.
    pub zone: String,
    /// Public address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Remote login.
    pub user: String,
    /// Private key path.
    pub key_file: Utf8PathBuf,
}

impl ConnectionRecord {
    /// Control-channel coordinates stored in the record.
    #[must_use]
    pub fn target(&self) -> ConnectTarget {
        ConnectTarget {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            key_file: self.key_file.clone(),
        }
    }
}

/// Errors raised while writing or removing records.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Environment names must be usable as file names.
    #[error("invalid environment name for a session record: {0:?}")]
    InvalidName(String),
    /// Filesystem access failed.
    #[error("session cache error at {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Error text.
        message: String,
    },
    /// The record could not be encoded.
    #[error("failed to encode session record: {0}")]
    Encode(String),
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Records stored under `<state_dir>/sessions`.
#[derive(Clone, Debug)]
pub struct SessionCache {
    dir: Utf8PathBuf,
}

impl SessionCache {
    /// Creates a cache rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Utf8Path) -> Self {
        Self {
            dir: state_dir.join("sessions"),
        }
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Path of the record for `name`.
    #[must_use]
    pub fn path_for(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(format!("{name}{SESSION_SUFFIX}"))
    }

    fn io_error(&self, name: &str, err: &std::io::Error) -> SessionError {
        SessionError::Io {
            path: self.path_for(name),
            message: err.to_string(),
        }
    }

    fn open_dir(&self) -> std::io::Result<Dir> {
        Dir::open_ambient_dir(&self.dir, ambient_authority())
    }

    /// Writes `record`, replacing any previous record for the same name.
    ///
    /// The record is written to a temporary file and renamed into place so a
    /// reader never sees a partial record.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the name is unusable or the write fails.
    pub fn write(&self, record: &ConnectionRecord) -> Result<(), SessionError> {
        if !valid_name(&record.name) {
            return Err(SessionError::InvalidName(record.name.clone()));
        }
        let rendered = serde_json::to_string_pretty(record)
            .map_err(|err| SessionError::Encode(err.to_string()))?;
        Dir::create_ambient_dir_all(&self.dir, ambient_authority())
            .map_err(|err| self.io_error(&record.name, &err))?;
        let dir = self
            .open_dir()
            .map_err(|err| self.io_error(&record.name, &err))?;

        let file_name = format!("{}{SESSION_SUFFIX}", record.name);
        let tmp_name = format!("{file_name}.tmp");
        dir.write(&tmp_name, rendered)
            .and_then(|()| dir.rename(&tmp_name, &dir, &file_name))
            .map_err(|err| self.io_error(&record.name, &err))?;
        debug!(name = %record.name, pid = record.pid, "session record written");
        Ok(())
    }

    /// Reads the record for `name`.
    ///
    /// Missing and malformed records both read as `None`.
    #[must_use]
    pub fn read(&self, name: &str) -> Option<ConnectionRecord> {
        if !valid_name(name) {
            return None;
        }
        let contents = self
            .open_dir()
            .and_then(|dir| dir.read_to_string(format!("{name}{SESSION_SUFFIX}")))
            .ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(name, error = %err, "ignoring malformed session record");
                None
            }
        }
    }

    /// Removes the record for `name`. A missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Io`] when an existing record cannot be removed.
    pub fn invalidate(&self, name: &str) -> Result<(), SessionError> {
        if !valid_name(name) {
            return Err(SessionError::InvalidName(name.to_owned()));
        }
        let dir = match self.open_dir() {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_error(name, &err)),
        };
        match dir.remove_file(format!("{name}{SESSION_SUFFIX}")) {
            Ok(()) => {
                debug!(name, "session record removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(name, &err)),
        }
    }

    /// Returns `true` when a record exists and its owner process is alive.
    ///
    /// A record whose owner is gone is deleted as a side effect.
    pub fn is_alive(&self, name: &str, probe: &impl ProcessProbe) -> bool {
        self.read_alive(name, probe).is_some()
    }

    /// Reads the record for `name` if its owner process is alive, deleting
    /// it otherwise.
    pub fn read_alive(&self, name: &str, probe: &impl ProcessProbe) -> Option<ConnectionRecord> {
        let record = self.read(name)?;
        if probe.is_running(record.pid) {
            return Some(record);
        }
        debug!(name, pid = record.pid, "discarding stale session record");
        if let Err(err) = self.invalidate(name) {
            warn!(name, error = %err, "failed to remove stale session record");
        }
        None
    }
}
