//! Remote command rendering and validation.
//!
//! Commands reach the remote shell as a single string. Arguments from the
//! local command line are shell-escaped and the whole command is wrapped so
//! it runs inside the synchronised workspace directory.

use shell_escape::unix::escape;

use super::SyncError;

/// Longest command accepted for remote execution, in characters.
pub const MAX_COMMAND_LENGTH: usize = 100_000;

/// Wraps `command` so it runs from `remote_dir` under `bash -c`.
///
/// The directory is created first so commands work before the initial sync.
#[must_use]
pub fn wrap_in_directory(remote_dir: &str, command: &str) -> String {
    let escaped_dir = escape(remote_dir.into());
    let escaped_command = escape(command.into());
    format!("mkdir -p {escaped_dir} && cd {escaped_dir} && bash -c {escaped_command}")
}

/// Rejects empty or oversized commands before any remote call.
///
/// # Errors
///
/// Returns [`SyncError::InvalidCommand`] describing the problem.
pub fn validate_remote_command(command: &str) -> Result<(), SyncError> {
    if command.trim().is_empty() {
        return Err(SyncError::InvalidCommand(String::from(
            "command must not be empty",
        )));
    }
    if command.chars().count() > MAX_COMMAND_LENGTH {
        return Err(SyncError::InvalidCommand(format!(
            "command exceeds {MAX_COMMAND_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Joins local arguments into one shell-escaped command string.
#[must_use]
pub fn render_command_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rejects arguments containing ASCII control characters.
///
/// # Errors
///
/// Returns [`SyncError::InvalidCommand`] for the first offending argument.
pub fn validate_command_args(args: &[String]) -> Result<(), SyncError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(SyncError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}
