//! Control-channel establishment with bounded retry.
//!
//! A [`Connector`] probes an instance and opens a [`ControlChannel`] once the
//! probe succeeds. [`ConnectionEstablisher`] drives the probes on the
//! [`RetryPolicy`] schedule, failing fast on rejections and checking the
//! cancellation flag before every attempt and during every backoff sleep.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cancel::CancellationFlag;

mod retry;
mod ssh;

pub use retry::RetryPolicy;
pub use ssh::{SshConnector, SshControlChannel, SshTunnel, classify_probe};

/// Future returned by connector and channel operations.
pub type ConnectFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Coordinates of an environment's control channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectTarget {
    /// Public address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Remote login.
    pub user: String,
    /// Private key authenticating `user`.
    pub key_file: Utf8PathBuf,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Result of one reachability probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    /// The channel accepted the session.
    Reachable,
    /// Not reachable yet; worth retrying.
    Unreachable(String),
    /// Reachable but refused; retrying cannot help.
    Rejected(String),
}

/// Exit of a remote command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitOutcome {
    /// Remote exit code, or `128 + signal` when the client was killed.
    Exited(i32),
    /// Local cancellation stopped the command.
    Cancelled,
}

/// Opens control channels to an environment.
pub trait Connector: Send + Sync {
    /// Channel type produced once reachable.
    type Channel: ControlChannel;

    /// Checks whether `target` accepts a session right now.
    fn probe<'a>(&'a self, target: &'a ConnectTarget) -> ConnectFuture<'a, ProbeOutcome>;

    /// Builds a channel for a target that just probed reachable.
    fn open(&self, target: &ConnectTarget) -> Self::Channel;
}

/// Established control channel.
pub trait ControlChannel: Send + Sync {
    /// Handle keeping a port forward open until dropped.
    type Tunnel: Send;

    /// Runs `command` remotely, streaming its output to local stdout and
    /// stderr, until it exits or `cancel` fires.
    fn execute<'a>(
        &'a self,
        command: &'a str,
        cancel: &'a CancellationFlag,
    ) -> ConnectFuture<'a, Result<ExitOutcome, ConnectError>>;

    /// Forwards `127.0.0.1:local_port` to `remote_port` on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidTunnel`] for unusable ports,
    /// [`ConnectError::Spawn`] when the forwarder cannot start, and
    /// [`ConnectError::TunnelExited`] when it has already given up.
    fn open_tunnel(&self, local_port: u16, remote_port: u16)
    -> Result<Self::Tunnel, ConnectError>;
}

/// One probe made by the establisher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectAttempt {
    /// One-based attempt number.
    pub attempt: u32,
    /// Time since the first attempt started.
    pub started_after: Duration,
    /// Probe result.
    pub outcome: ProbeOutcome,
}

/// Errors raised while connecting or using a channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    /// Every allowed attempt failed with a retryable outcome.
    #[error("failed to establish SSH connection to {target} after {attempts} attempts: {last_reason}")]
    Exhausted {
        /// Rendered target.
        target: String,
        /// Number of probes made.
        attempts: u32,
        /// Reason reported by the final probe.
        last_reason: String,
    },
    /// The target refused the session.
    #[error("SSH connection to {target} rejected: {reason}")]
    Rejected {
        /// Rendered target.
        target: String,
        /// Refusal reason.
        reason: String,
    },
    /// Cancellation stopped the retry loop.
    #[error("connection attempt cancelled")]
    Cancelled,
    /// A local process could not be started or awaited.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// A port forward request was unusable.
    #[error("invalid port forward {local_port}:{remote_port}: {reason}")]
    InvalidTunnel {
        /// Local port requested.
        local_port: u16,
        /// Remote port requested.
        remote_port: u16,
        /// Why it was refused.
        reason: String,
    },
    /// The forwarder exited before the tunnel was in use.
    #[error("port forward {local_port}:{remote_port} exited with status {code}")]
    TunnelExited {
        /// Local port requested.
        local_port: u16,
        /// Remote port requested.
        remote_port: u16,
        /// Exit code of the forwarder.
        code: i32,
    },
}

/// Rejects port forwards that cannot work.
///
/// # Errors
///
/// Returns [`ConnectError::InvalidTunnel`] for port zero.
pub fn validate_tunnel_ports(local_port: u16, remote_port: u16) -> Result<(), ConnectError> {
    if local_port == 0 || remote_port == 0 {
        return Err(ConnectError::InvalidTunnel {
            local_port,
            remote_port,
            reason: String::from("ports must be between 1 and 65535"),
        });
    }
    Ok(())
}

/// Drives a [`Connector`] through the retry schedule.
#[derive(Debug)]
pub struct ConnectionEstablisher<C> {
    connector: C,
    policy: RetryPolicy,
    history: Vec<ConnectAttempt>,
}

impl<C: Connector> ConnectionEstablisher<C> {
    /// Creates an establisher using `policy`.
    #[must_use]
    pub const fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            history: Vec::new(),
        }
    }

    /// Attempts made by the most recent [`ConnectionEstablisher::connect`].
    #[must_use]
    pub fn history(&self) -> &[ConnectAttempt] {
        &self.history
    }

    /// Borrow the connector, for opening channels without probing.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Probes `target` until reachable, rejected, cancelled, or out of budget.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Rejected`] on the first rejection,
    /// [`ConnectError::Cancelled`] when `cancel` fires, and
    /// [`ConnectError::Exhausted`] once either budget is spent.
    pub async fn connect(
        &mut self,
        target: &ConnectTarget,
        cancel: &CancellationFlag,
    ) -> Result<C::Channel, ConnectError> {
        self.history.clear();
        let started = Instant::now();
        let mut attempts = 0;
        let mut last_reason = String::new();

        while attempts < self.policy.max_attempts() {
            if cancel.is_cancelled() {
                return Err(ConnectError::Cancelled);
            }
            let started_after = started.elapsed();
            let outcome = self.connector.probe(target).await;
            attempts += 1;
            self.history.push(ConnectAttempt {
                attempt: attempts,
                started_after,
                outcome: outcome.clone(),
            });

            match outcome {
                ProbeOutcome::Reachable => {
                    info!(endpoint = %target, attempts, "control channel reachable");
                    return Ok(self.connector.open(target));
                }
                ProbeOutcome::Rejected(reason) => {
                    return Err(ConnectError::Rejected {
                        target: target.to_string(),
                        reason,
                    });
                }
                ProbeOutcome::Unreachable(reason) => last_reason = reason,
            }

            if attempts >= self.policy.max_attempts() {
                break;
            }
            let delay = self.policy.delay_after(attempts - 1);
            if started.elapsed().saturating_add(delay) > self.policy.max_elapsed() {
                break;
            }
            debug!(endpoint = %target, attempt = attempts, delay_secs = delay.as_secs(), reason = %last_reason, "not reachable yet");
            cancel
                .sleep(delay)
                .await
                .map_err(|_| ConnectError::Cancelled)?;
        }

        Err(ConnectError::Exhausted {
            target: target.to_string(),
            attempts,
            last_reason,
        })
    }
}

#[cfg(test)]
mod tests;
