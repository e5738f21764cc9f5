//! Control channel backed by the system `ssh` client.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cancel::CancellationFlag;
use crate::sync::SyncConfig;

use super::{
    ConnectError, ConnectFuture, ConnectTarget, Connector, ControlChannel, ExitOutcome,
    ProbeOutcome, validate_tunnel_ports,
};

/// Exit status `ssh` reports for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

const REJECTION_MARKERS: [&str; 3] = [
    "Permission denied",
    "Host key verification failed",
    "REMOTE HOST IDENTIFICATION HAS CHANGED",
];

/// Classifies a finished probe from its exit code and stderr.
///
/// Any exit other than the client's own failure code means a remote shell
/// ran, so the host is reachable.
#[must_use]
pub fn classify_probe(code: Option<i32>, stderr: &str) -> ProbeOutcome {
    match code {
        Some(SSH_CLIENT_FAILURE) | None => {
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map_or_else(|| String::from("ssh exited without output"), str::to_owned);
            if REJECTION_MARKERS
                .iter()
                .any(|marker| stderr.contains(marker))
            {
                ProbeOutcome::Rejected(reason)
            } else {
                ProbeOutcome::Unreachable(reason)
            }
        }
        Some(_) => ProbeOutcome::Reachable,
    }
}

fn ssh_base_args(config: &SyncConfig, target: &ConnectTarget) -> Vec<OsString> {
    let mut args = config.ssh_options(target.port, &target.key_file);
    args.push(OsString::from("-o"));
    args.push(OsString::from("LogLevel=ERROR"));
    args
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

fn tunnel_args(local_port: u16, remote_port: u16) -> Vec<OsString> {
    vec![
        OsString::from("-N"),
        OsString::from("-o"),
        OsString::from("ExitOnForwardFailure=yes"),
        OsString::from("-L"),
        OsString::from(format!("127.0.0.1:{local_port}:localhost:{remote_port}")),
    ]
}

/// Fails when the forwarder process has already exited.
fn ensure_forwarding(
    child: &mut Child,
    local_port: u16,
    remote_port: u16,
) -> Result<(), ConnectError> {
    match child.try_wait() {
        Ok(None) => Ok(()),
        Ok(Some(status)) => Err(ConnectError::TunnelExited {
            local_port,
            remote_port,
            code: exit_code_of(status),
        }),
        Err(err) => {
            debug!(local_port, error = %err, "could not poll port forward");
            Ok(())
        }
    }
}

async fn forward<R, W>(reader: Option<R>, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(mut source) = reader {
        tokio::io::copy(&mut source, &mut writer).await.ok();
        writer.flush().await.ok();
    }
}

/// Probes and opens SSH sessions with the system client.
#[derive(Clone, Debug)]
pub struct SshConnector {
    config: SyncConfig,
}

impl SshConnector {
    /// Creates a connector using the shared SSH settings.
    #[must_use]
    pub const fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

impl Connector for SshConnector {
    type Channel = SshControlChannel;

    fn probe<'a>(&'a self, target: &'a ConnectTarget) -> ConnectFuture<'a, ProbeOutcome> {
        Box::pin(async move {
            let mut args = ssh_base_args(&self.config, target);
            args.push(OsString::from(format!("{}@{}", target.user, target.host)));
            args.push(OsString::from("true"));

            let output = Command::new(&self.config.ssh_bin)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await;
            match output {
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    classify_probe(output.status.code(), &stderr)
                }
                Err(err) => ProbeOutcome::Rejected(format!(
                    "failed to spawn {}: {err}",
                    self.config.ssh_bin
                )),
            }
        })
    }

    fn open(&self, target: &ConnectTarget) -> Self::Channel {
        SshControlChannel {
            config: self.config.clone(),
            target: target.clone(),
        }
    }
}

/// SSH session coordinates; each command runs in a fresh client process.
#[derive(Clone, Debug)]
pub struct SshControlChannel {
    config: SyncConfig,
    target: ConnectTarget,
}

impl SshControlChannel {
    /// Target this channel talks to.
    #[must_use]
    pub const fn target(&self) -> &ConnectTarget {
        &self.target
    }

    fn spawn(&self, extra: &[OsString], command: Option<&str>) -> Result<Child, ConnectError> {
        let mut args = ssh_base_args(&self.config, &self.target);
        args.extend_from_slice(extra);
        args.push(OsString::from(format!(
            "{}@{}",
            self.target.user, self.target.host
        )));
        let mut process = Command::new(&self.config.ssh_bin);
        process.args(&args).kill_on_drop(true);
        match command {
            Some(remote) => {
                process
                    .arg(remote)
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            None => {
                process
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
        }
        process.spawn().map_err(|err| ConnectError::Spawn {
            program: self.config.ssh_bin.clone(),
            message: err.to_string(),
        })
    }
}

impl ControlChannel for SshControlChannel {
    type Tunnel = SshTunnel;

    fn execute<'a>(
        &'a self,
        command: &'a str,
        cancel: &'a CancellationFlag,
    ) -> ConnectFuture<'a, Result<ExitOutcome, ConnectError>> {
        Box::pin(async move {
            let mut child = self.spawn(&[], Some(command))?;
            let stdout_task = tokio::spawn(forward(child.stdout.take(), tokio::io::stdout()));
            let stderr_task = tokio::spawn(forward(child.stderr.take(), tokio::io::stderr()));

            let status = tokio::select! {
                status = child.wait() => status.map_err(|err| ConnectError::Spawn {
                    program: self.config.ssh_bin.clone(),
                    message: err.to_string(),
                })?,
                () = cancel.cancelled() => {
                    child.kill().await.ok();
                    stdout_task.abort();
                    stderr_task.abort();
                    return Ok(ExitOutcome::Cancelled);
                }
            };

            stdout_task.await.ok();
            stderr_task.await.ok();
            let code = exit_code_of(status);
            debug!(endpoint = %self.target, code, "remote command finished");
            Ok(ExitOutcome::Exited(code))
        })
    }

    fn open_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self::Tunnel, ConnectError> {
        validate_tunnel_ports(local_port, remote_port)?;
        if local_port < 1024 {
            warn!(
                local_port,
                "binding a privileged local port usually requires root"
            );
        }
        let mut child = self.spawn(&tunnel_args(local_port, remote_port), None)?;
        ensure_forwarding(&mut child, local_port, remote_port)?;
        debug!(local_port, remote_port, "port forward started");
        Ok(SshTunnel {
            child,
            local_port,
            remote_port,
        })
    }
}

/// Running `ssh -N -L` forwarder; killed on drop.
#[derive(Debug)]
pub struct SshTunnel {
    child: Child,
    local_port: u16,
    remote_port: u16,
}

impl SshTunnel {
    /// Local loopback port.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote port on the instance.
    #[must_use]
    pub const fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Stops the forwarder and waits for it to exit.
    pub async fn close(mut self) {
        self.child.kill().await.ok();
    }
}
