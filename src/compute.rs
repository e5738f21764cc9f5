//! Compute instance lifecycle.
//!
//! [`ComputeManager`] creates, starts, stops, and terminates instances,
//! mirroring the provider's state on an [`InstanceHandle`]. Every wait polls
//! the provider on a fixed interval and observes the cancellation flag, so a
//! wait ends as ready, timed out, or cancelled.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, InstanceSnapshot, InstanceState, LaunchSpec, retry_transient,
    retry_transient_until,
};
use crate::cancel::CancellationFlag;

/// Interval between state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Ceiling on waiting for an instance to run.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(300);
/// Ceiling on waiting for an instance to terminate.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(600);
/// How long a powered-on instance may still report `stopped` before the
/// start counts as failed.
pub const STOPPED_GRACE: Duration = Duration::from_secs(30);

/// Poll cadence and wait ceilings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ComputeSettings {
    /// Interval between state polls.
    pub poll_interval: Duration,
    /// Ceiling for launch, start, and stop waits.
    pub launch_timeout: Duration,
    /// Ceiling for terminate waits.
    pub terminate_timeout: Duration,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

/// Local mirror of a provider instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Hosting zone.
    pub zone: String,
    /// Last observed state.
    pub state: InstanceState,
    /// Public address, once assigned.
    pub public_ip: Option<IpAddr>,
    /// Provider tags.
    pub tags: Vec<String>,
}

impl InstanceHandle {
    /// Token linking the instance to its credential and policy.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|tag| tag.strip_prefix(crate::backend::TOKEN_TAG_PREFIX))
    }

    fn observe(&mut self, snapshot: InstanceSnapshot) {
        self.state = snapshot.state;
        self.public_ip = snapshot.public_ip;
        self.tags = snapshot.tags;
    }
}

impl From<InstanceSnapshot> for InstanceHandle {
    fn from(snapshot: InstanceSnapshot) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            zone: snapshot.zone,
            state: snapshot.state,
            public_ip: snapshot.public_ip,
            tags: snapshot.tags,
        }
    }
}

/// Errors raised by compute operations.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// An instance with this environment's name is already running.
    #[error("environment {name} is already running as {id}; use `bivouac exec` or stop it first")]
    AlreadyRunning {
        /// Environment name.
        name: String,
        /// Existing instance id.
        id: String,
    },
    /// The existing instance is transitioning; retrying later may succeed.
    #[error("instance {id} ({name}) is {state}; wait for it to settle and retry")]
    UnstableState {
        /// Environment name.
        name: String,
        /// Instance id.
        id: String,
        /// Observed state.
        state: InstanceState,
    },
    /// The requested transition is not allowed from the current state.
    #[error("cannot {operation} instance {id} while it is {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Instance id.
        id: String,
        /// Observed state.
        state: InstanceState,
    },
    /// The instance did not reach the awaited state in time.
    #[error("timed out after {waited_secs}s waiting for instance {id} to {operation}")]
    Timeout {
        /// Awaited transition.
        operation: &'static str,
        /// Instance id.
        id: String,
        /// Seconds waited.
        waited_secs: u64,
    },
    /// Cancellation interrupted the wait.
    #[error("cancelled while waiting for instance {id} to {operation}")]
    Cancelled {
        /// Awaited transition.
        operation: &'static str,
        /// Instance id.
        id: String,
    },
    /// The instance disappeared or failed while starting.
    #[error("instance {id} entered {state} while waiting to {operation}")]
    Failed {
        /// Awaited transition.
        operation: &'static str,
        /// Instance id.
        id: String,
        /// Observed state.
        state: InstanceState,
    },
    /// No managed instance matched.
    #[error("no managed instance matches {target}")]
    NotFound {
        /// Name or id requested.
        target: String,
    },
    /// More than one managed instance matched.
    #[error("{target} matches several instances ({ids}); pass an instance id")]
    AmbiguousTarget {
        /// Name or id requested.
        target: String,
        /// Matching ids, comma separated.
        ids: String,
    },
    /// A provider call failed.
    #[error("{operation} failed: {source}")]
    Provider {
        /// Provider call.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: BackendError,
    },
}

impl ComputeError {
    fn provider(operation: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::Provider { operation, source }
    }
}

/// Waits end in one of these outcomes besides readiness.
enum WaitStop {
    Timeout,
    Cancelled,
}

/// Drives instance power state through a [`Backend`].
#[derive(Clone, Debug)]
pub struct ComputeManager<B> {
    backend: B,
    settings: ComputeSettings,
}

impl<B: Backend> ComputeManager<B> {
    /// Creates a manager.
    #[must_use]
    pub const fn new(backend: B, settings: ComputeSettings) -> Self {
        Self { backend, settings }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ComputeSettings {
        &self.settings
    }

    /// Lists managed instances.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Provider`] when listing fails.
    pub async fn list(&self) -> Result<Vec<InstanceHandle>, ComputeError> {
        let snapshots = retry_transient("list_instances", || self.backend.list_instances())
            .await
            .map_err(ComputeError::provider("list instances"))?;
        Ok(snapshots.into_iter().map(InstanceHandle::from).collect())
    }

    /// Finds the live instance carrying `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::AmbiguousTarget`] when several match.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<InstanceHandle>, ComputeError> {
        let mut matches: Vec<InstanceHandle> = self
            .list()
            .await?
            .into_iter()
            .filter(|instance| instance.name == name && instance.state != InstanceState::Terminated)
            .collect();
        if matches.len() > 1 {
            return Err(ambiguous(name, &matches));
        }
        Ok(matches.pop())
    }

    /// Resolves `target` as an instance id, then as a name.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::NotFound`] or [`ComputeError::AmbiguousTarget`].
    pub async fn resolve(&self, target: &str) -> Result<InstanceHandle, ComputeError> {
        let instances = self.list().await?;
        if let Some(found) = instances.iter().find(|instance| instance.id == target) {
            return Ok(found.clone());
        }
        let mut named: Vec<InstanceHandle> = instances
            .into_iter()
            .filter(|instance| instance.name == target)
            .collect();
        match named.len() {
            0 => Err(ComputeError::NotFound {
                target: target.to_owned(),
            }),
            1 => named.pop().ok_or_else(|| ComputeError::NotFound {
                target: target.to_owned(),
            }),
            _ => Err(ambiguous(target, &named)),
        }
    }

    /// Brings up an instance for `spec`, reusing a stopped one with the same
    /// name.
    ///
    /// Creation is a single provider call that leaves the server stopped;
    /// only the power-on is retried, against the id just returned. A created
    /// instance that fails to reach `running` is terminated before the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::AlreadyRunning`] or
    /// [`ComputeError::UnstableState`] for an existing instance, and
    /// timeout, cancellation, or provider errors otherwise.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationFlag,
    ) -> Result<InstanceHandle, ComputeError> {
        if let Some(mut existing) = self.find_by_name(&spec.name).await? {
            ensure_reusable(&existing)?;
            info!(name = %spec.name, id = %existing.id, "starting stopped instance");
            self.start(&mut existing, cancel).await?;
            return Ok(existing);
        }

        let snapshot = self
            .backend
            .create_instance(spec)
            .await
            .map_err(ComputeError::provider("create instance"))?;
        let mut instance = InstanceHandle::from(snapshot);
        info!(name = %instance.name, id = %instance.id, "instance created");

        if let Err(err) = self.power_on_created(&mut instance, cancel).await {
            warn!(id = %instance.id, error = %err, "instance did not start, terminating it");
            // Rollback waits ignore the caller's flag, which may already be set.
            let mut doomed = instance.clone();
            if let Err(rollback) = self.terminate(&mut doomed, &CancellationFlag::new()).await {
                warn!(id = %instance.id, error = %rollback, "failed to terminate unstarted instance");
            }
            return Err(err);
        }
        Ok(instance)
    }

    async fn power_on_created(
        &self,
        instance: &mut InstanceHandle,
        cancel: &CancellationFlag,
    ) -> Result<(), ComputeError> {
        retry_transient_until("power_on", cancel, || self.backend.power_on(&instance.id))
            .await
            .map_err(ComputeError::provider("power on"))?;
        instance.state = InstanceState::Pending;
        self.wait_running(instance, cancel).await
    }

    /// Powers on a stopped instance and waits for it to run.
    ///
    /// Returns immediately without provider calls when the instance is
    /// already running or starting.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::InvalidState`] unless the instance is stopped.
    pub async fn start(
        &self,
        instance: &mut InstanceHandle,
        cancel: &CancellationFlag,
    ) -> Result<(), ComputeError> {
        match instance.state {
            InstanceState::Running | InstanceState::Pending => return Ok(()),
            InstanceState::Stopped => {}
            _ => {
                return Err(ComputeError::InvalidState {
                    operation: "start",
                    id: instance.id.clone(),
                    state: instance.state.clone(),
                });
            }
        }
        self.power_on_created(instance, cancel).await
    }

    /// Powers off an instance, preserving its disks.
    ///
    /// Returns immediately without provider calls when the instance is
    /// already stopped or stopping.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::InvalidState`] for an instance being deleted,
    /// and timeout, cancellation, or provider errors otherwise.
    pub async fn stop(
        &self,
        instance: &mut InstanceHandle,
        cancel: &CancellationFlag,
    ) -> Result<(), ComputeError> {
        match instance.state {
            InstanceState::Stopped | InstanceState::Stopping => return Ok(()),
            InstanceState::ShuttingDown | InstanceState::Terminated => {
                return Err(ComputeError::InvalidState {
                    operation: "stop",
                    id: instance.id.clone(),
                    state: instance.state.clone(),
                });
            }
            _ => {}
        }
        retry_transient_until("power_off", cancel, || self.backend.power_off(&instance.id))
            .await
            .map_err(ComputeError::provider("power off"))?;
        instance.state = InstanceState::Stopping;

        let waited = self
            .poll(&instance.id, self.settings.launch_timeout, cancel, |snapshot| {
                snapshot.is_none_or(|current| current.state == InstanceState::Stopped)
            })
            .await;
        match waited {
            Ok(snapshot) => {
                if let Some(current) = snapshot {
                    instance.observe(current);
                }
                instance.state = InstanceState::Stopped;
                info!(id = %instance.id, "instance stopped");
                Ok(())
            }
            Err(stop) => Err(wait_error(stop, "stop", instance, self.settings.launch_timeout)),
        }
    }

    /// Deletes an instance and waits until the provider no longer lists it.
    ///
    /// Returns immediately without provider calls when the instance is
    /// already shutting down or gone.
    ///
    /// # Errors
    ///
    /// Returns timeout, cancellation, or provider errors.
    pub async fn terminate(
        &self,
        instance: &mut InstanceHandle,
        cancel: &CancellationFlag,
    ) -> Result<(), ComputeError> {
        if matches!(
            instance.state,
            InstanceState::ShuttingDown | InstanceState::Terminated
        ) {
            return Ok(());
        }
        match retry_transient_until("terminate", cancel, || self.backend.terminate(&instance.id))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                instance.state = InstanceState::Terminated;
                return Ok(());
            }
            Err(err) => return Err(ComputeError::provider("terminate")(err)),
        }
        instance.state = InstanceState::ShuttingDown;

        let waited = self
            .poll(&instance.id, self.settings.terminate_timeout, cancel, |snapshot| {
                snapshot.is_none_or(|current| current.state == InstanceState::Terminated)
            })
            .await;
        match waited {
            Ok(_) => {
                instance.state = InstanceState::Terminated;
                info!(id = %instance.id, "instance terminated");
                Ok(())
            }
            Err(stop) => Err(wait_error(
                stop,
                "terminate",
                instance,
                self.settings.terminate_timeout,
            )),
        }
    }

    async fn wait_running(
        &self,
        instance: &mut InstanceHandle,
        cancel: &CancellationFlag,
    ) -> Result<(), ComputeError> {
        // Power-on is asynchronous; a server may still report stopped briefly.
        let stopped_deadline = Instant::now() + STOPPED_GRACE;
        let waited = self
            .poll(&instance.id, self.settings.launch_timeout, cancel, |snapshot| {
                snapshot.is_none_or(|current| match current.state {
                    InstanceState::ShuttingDown | InstanceState::Terminated => true,
                    InstanceState::Stopped => Instant::now() >= stopped_deadline,
                    InstanceState::Running => current.public_ip.is_some(),
                    _ => false,
                })
            })
            .await;
        match waited {
            Ok(Some(current)) if current.state == InstanceState::Running => {
                instance.observe(current);
                info!(id = %instance.id, ip = ?instance.public_ip, "instance running");
                Ok(())
            }
            Ok(Some(current)) => Err(ComputeError::Failed {
                operation: "start",
                id: instance.id.clone(),
                state: current.state,
            }),
            Ok(None) => Err(ComputeError::Failed {
                operation: "start",
                id: instance.id.clone(),
                state: InstanceState::Terminated,
            }),
            Err(stop) => Err(wait_error(stop, "start", instance, self.settings.launch_timeout)),
        }
    }

    /// Describes `id` until `done` accepts the observation.
    async fn poll<F>(
        &self,
        id: &str,
        timeout: Duration,
        cancel: &CancellationFlag,
        done: F,
    ) -> Result<Option<InstanceSnapshot>, WaitStop>
    where
        F: Fn(Option<&InstanceSnapshot>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(WaitStop::Cancelled);
            }
            match retry_transient_until("describe_instance", cancel, || {
                self.backend.describe_instance(id)
            })
            .await
            {
                Ok(snapshot) if done(snapshot.as_ref()) => return Ok(snapshot),
                Ok(snapshot) => {
                    debug!(id, state = ?snapshot.map(|current| current.state), "waiting");
                }
                Err(err) => warn!(id, error = %err, "describe failed while waiting"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitStop::Timeout);
            }
            let pause = self
                .settings
                .poll_interval
                .min(deadline.saturating_duration_since(now));
            cancel.sleep(pause).await.map_err(|_| WaitStop::Cancelled)?;
        }
    }
}

/// Accepts an existing same-named instance only when it is stopped.
///
/// # Errors
///
/// Returns [`ComputeError::AlreadyRunning`] for a running instance and
/// [`ComputeError::UnstableState`] for any other state.
pub fn ensure_reusable(existing: &InstanceHandle) -> Result<(), ComputeError> {
    match &existing.state {
        InstanceState::Stopped => Ok(()),
        InstanceState::Running => Err(ComputeError::AlreadyRunning {
            name: existing.name.clone(),
            id: existing.id.clone(),
        }),
        state => Err(ComputeError::UnstableState {
            name: existing.name.clone(),
            id: existing.id.clone(),
            state: state.clone(),
        }),
    }
}

fn wait_error(
    stop: WaitStop,
    operation: &'static str,
    instance: &InstanceHandle,
    timeout: Duration,
) -> ComputeError {
    match stop {
        WaitStop::Cancelled => ComputeError::Cancelled {
            operation,
            id: instance.id.clone(),
        },
        WaitStop::Timeout => ComputeError::Timeout {
            operation,
            id: instance.id.clone(),
            waited_secs: timeout.as_secs(),
        },
    }
}

fn ambiguous(target: &str, matches: &[InstanceHandle]) -> ComputeError {
    ComputeError::AmbiguousTarget {
        target: target.to_owned(),
        ids: matches
            .iter()
            .map(|instance| instance.id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    }
}
