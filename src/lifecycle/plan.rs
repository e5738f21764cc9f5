//! What runs once the control channel is up.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use thiserror::Error;

use super::env::with_exports;
use crate::sync::{DEFAULT_REMOTE_PATH, SyncError, validate_remote_command};

/// Local-to-remote port forward requested with `--port`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortForward {
    /// Loopback port bound locally.
    pub local: u16,
    /// Port on the instance.
    pub remote: u16,
}

/// Raised for unparsable `--port` values.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid port forward {value:?}: expected PORT or LOCAL:REMOTE with ports 1-65535")]
pub struct PortForwardParseError {
    /// Rejected input.
    pub value: String,
}

impl FromStr for PortForward {
    type Err = PortForwardParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let error = || PortForwardParseError {
            value: value.to_owned(),
        };
        let parse = |raw: &str| {
            raw.trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(error)
        };
        match value.split_once(':') {
            Some((local, remote)) => Ok(Self {
                local: parse(local)?,
                remote: parse(remote)?,
            }),
            None => {
                let port = parse(value)?;
                Ok(Self {
                    local: port,
                    remote: port,
                })
            }
        }
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Result of one collaborator step, reduced to success or an exit code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollaboratorOutcome {
    /// Exit code zero.
    Succeeded,
    /// Non-zero exit code.
    Failed {
        /// Exit code reported by the step.
        code: i32,
    },
}

impl CollaboratorOutcome {
    /// Classifies an exit code.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        if code == 0 {
            Self::Succeeded
        } else {
            Self::Failed { code }
        }
    }

    /// Exit code, zero on success.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed { code } => code,
        }
    }
}

/// Collaborator steps for one session, run in field order: sync, setup
/// script, tunnels, pre-command, command, post-command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunPlan {
    /// Local workspace synced before anything runs; `None` skips sync.
    pub sync_source: Option<Utf8PathBuf>,
    /// Remote working directory for every command.
    pub remote_dir: String,
    /// Provisioning script run once after connecting.
    pub setup_script: Option<String>,
    /// Ports forwarded for the session.
    pub ports: Vec<PortForward>,
    /// Hook run before the command.
    pub pre_command: Option<String>,
    /// Main command; `None` holds the session open until interrupted.
    pub command: Option<String>,
    /// Hook run after the command.
    pub post_command: Option<String>,
    /// Variables exported before every step.
    pub env: BTreeMap<String, String>,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            sync_source: None,
            remote_dir: DEFAULT_REMOTE_PATH.to_owned(),
            setup_script: None,
            ports: Vec::new(),
            pre_command: None,
            command: None,
            post_command: None,
            env: BTreeMap::new(),
        }
    }
}

impl RunPlan {
    /// Rejects empty or oversized commands before any resource exists.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidCommand`] naming the first bad step.
    pub fn validate(&self) -> Result<(), SyncError> {
        let steps = [
            ("setup_script", &self.setup_script),
            ("pre_command", &self.pre_command),
            ("command", &self.command),
            ("post_command", &self.post_command),
        ];
        for (stage, command) in steps {
            if let Some(command) = command {
                validate_remote_command(command)
                    .and_then(|()| validate_remote_command(&self.remote_command(command)))
                    .map_err(|err| SyncError::InvalidCommand(format!("{stage}: {err}")))?;
            }
        }
        Ok(())
    }

    /// `command` as sent to the instance, after the forwarded exports.
    #[must_use]
    pub fn remote_command(&self, command: &str) -> String {
        with_exports(command, &self.env)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::single("8080", 8080, 8080)]
    #[case::pair("9000:3000", 9000, 3000)]
    #[case::spaces(" 80 : 8080 ", 80, 8080)]
    fn port_forwards_parse(#[case] raw: &str, #[case] local: u16, #[case] remote: u16) {
        assert_eq!(raw.parse(), Ok(PortForward { local, remote }));
    }

    #[rstest]
    #[case::zero("0")]
    #[case::too_large("70000")]
    #[case::text("http")]
    #[case::missing_remote("8080:")]
    fn bad_port_forwards_are_rejected(#[case] raw: &str) {
        assert!(raw.parse::<PortForward>().is_err());
    }

    #[test]
    fn exit_codes_map_to_outcomes() {
        assert_eq!(CollaboratorOutcome::from_code(0), CollaboratorOutcome::Succeeded);
        assert_eq!(
            CollaboratorOutcome::from_code(3),
            CollaboratorOutcome::Failed { code: 3 }
        );
        assert_eq!(CollaboratorOutcome::Failed { code: 3 }.code(), 3);
    }

    #[test]
    fn empty_command_fails_validation() {
        let plan = RunPlan {
            command: Some(String::from("   ")),
            ..RunPlan::default()
        };
        let Err(err) = plan.validate() else {
            panic!("blank command should be rejected");
        };
        assert!(err.to_string().contains("command"), "{err}");
    }

    #[test]
    fn absent_steps_validate() {
        assert!(RunPlan::default().validate().is_ok());
    }

    #[test]
    fn forwarded_variables_count_towards_command_length() {
        let plan = RunPlan {
            command: Some(String::from("true")),
            env: BTreeMap::from([(
                String::from("HUGE"),
                "x".repeat(crate::sync::MAX_COMMAND_LENGTH),
            )]),
            ..RunPlan::default()
        };

        assert!(plan.validate().is_err());
    }

    #[test]
    fn remote_command_carries_exports() {
        let plan = RunPlan {
            env: BTreeMap::from([(String::from("RUST_LOG"), String::from("debug"))]),
            ..RunPlan::default()
        };

        assert_eq!(
            plan.remote_command("cargo test"),
            "export RUST_LOG=debug && cargo test"
        );
    }
}
