//! Session orchestration: acquire, connect, run, release.
//!
//! The [`Orchestrator`] is the only writer of the [`LifecycleState`] and the
//! only owner of the [`CleanupLedger`]. Each confirmed creation is appended
//! to the ledger before the next step starts, so whatever interrupts
//! acquisition, release tears down exactly what exists.

use std::net::IpAddr;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, InstanceState, LaunchSpecBuilder};
use crate::cancel::CancellationFlag;
use crate::compute::{ComputeError, ComputeManager, InstanceHandle, ensure_reusable};
use crate::connect::{
    ConnectError, ConnectTarget, ConnectionEstablisher, Connector, ControlChannel, ExitOutcome,
};
use crate::identity::EnvironmentIdentity;
use crate::ledger::{
    CleanupLedger, LedgerError, ReleaseFailure, ReleaseReport, ResourceHandle, ResourceKind,
};
use crate::provisioner::{KeyGenerator, ProvisionError, Provisioner};
use crate::session::{ConnectionRecord, ProcessProbe, SessionCache, SessionError};
use crate::sync::{CommandRunner, SyncError, Syncer, wrap_in_directory};

mod env;
mod plan;
mod prompt;
mod state;

pub use env::{EnvForwarder, with_exports};
pub use plan::{CollaboratorOutcome, PortForward, PortForwardParseError, RunPlan};
pub use prompt::{DialoguerPrompt, ExitPrompt, FixedPrompt};
pub use state::{InvalidTransition, LifecycleState, OnExit, StateMachine};

/// Failures while acquiring resources.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Credential or policy creation failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// Instance lookup, creation, or start failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),
    /// The launch request was incomplete.
    #[error("invalid launch request: {0}")]
    Launch(#[source] BackendError),
    /// Discovering the resources of a stopped instance failed.
    #[error("failed to look up resources of {name}: {source}")]
    Discover {
        /// Environment name.
        name: String,
        /// Provider error.
        #[source]
        source: BackendError,
    },
    /// A stopped instance exists but its private key is gone.
    #[error("private key {path} for {name} is missing; run `bivouac destroy {name}` and start again")]
    MissingKey {
        /// Environment name.
        name: String,
        /// Expected key path.
        path: Utf8PathBuf,
    },
    /// A stopped instance carries no token tag.
    #[error("instance {id} has no token tag and cannot be reused")]
    Untagged {
        /// Instance id.
        id: String,
    },
    /// The instance came up without a public address.
    #[error("instance {id} ({name}) has no public address")]
    Unaddressed {
        /// Environment name.
        name: String,
        /// Instance id.
        id: String,
    },
    /// The ledger refused a handle.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Failures while running collaborators.
#[derive(Debug, Error)]
pub enum RunError {
    /// Workspace sync failed.
    #[error("initial sync failed: {0}")]
    Sync(#[source] SyncError),
    /// A step exited non-zero.
    #[error("{stage} failed with exit code {code}")]
    CollaboratorFailed {
        /// Step name.
        stage: &'static str,
        /// Exit code.
        code: i32,
    },
    /// The channel failed to run a step or open a tunnel.
    #[error(transparent)]
    Channel(#[from] ConnectError),
}

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The run plan was rejected before any resource was created.
    #[error("invalid run plan: {0}")]
    Plan(#[source] SyncError),
    /// Acquisition failed; `rollback` records the teardown that followed.
    #[error("failed to acquire environment: {source} (rollback: {rollback})")]
    Acquire {
        /// Acquisition failure.
        #[source]
        source: AcquireError,
        /// Teardown of what had been created.
        rollback: ReleaseReport,
    },
    /// The control channel could not be established.
    #[error("{source} (release: {release})")]
    Connect {
        /// Connection failure.
        #[source]
        source: ConnectError,
        /// Teardown performed afterwards.
        release: ReleaseReport,
    },
    /// A collaborator failed.
    #[error("{source} (release: {release})")]
    Run {
        /// Collaborator failure.
        #[source]
        source: RunError,
        /// Teardown performed afterwards.
        release: ReleaseReport,
    },
    /// A compute operation on an existing environment failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),
    /// The instance has no address or key to connect with.
    #[error("environment {name} is not reachable: {reason}")]
    Unreachable {
        /// Environment name.
        name: String,
        /// What is missing.
        reason: String,
    },
    /// A remote command could not be run.
    #[error(transparent)]
    Channel(#[from] ConnectError),
    /// Discovering resources failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The session cache could not be written.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The state machine refused a transition.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    /// The ledger refused a handle.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// How a session ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionExit {
    /// The command finished with this code.
    Completed(i32),
    /// An interrupt ended the session.
    Cancelled,
}

/// Outcome of a full session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionReport {
    /// How the session ended.
    pub exit: SessionExit,
    /// Policy applied at release.
    pub on_exit: OnExit,
    /// Teardown performed.
    pub release: ReleaseReport,
}

/// What `info` reports about one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentInfo {
    /// Provider view of the instance.
    pub instance: InstanceHandle,
    /// Private key for the instance, when it exists locally.
    pub key_file: Option<Utf8PathBuf>,
    /// Session held open by a live process, if any.
    pub session: Option<ConnectionRecord>,
}

/// Settings the orchestrator applies to every session.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Launch template; name, security group, and tags are filled per run.
    pub launch: LaunchSpecBuilder,
    /// Remote login.
    pub ssh_user: String,
    /// Control-channel port.
    pub ssh_port: u16,
    /// Default exit policy.
    pub on_exit: OnExit,
    /// Remote working directory for `exec`.
    pub remote_dir: String,
}

/// Collaborators an [`Orchestrator`] drives.
#[derive(Debug)]
pub struct Components<B, K, C, R: CommandRunner> {
    /// Credential and policy provisioner.
    pub provisioner: Provisioner<B, K>,
    /// Instance manager.
    pub compute: ComputeManager<B>,
    /// Control-channel establisher.
    pub establisher: ConnectionEstablisher<C>,
    /// Session record cache.
    pub sessions: SessionCache,
    /// Workspace synchroniser.
    pub syncer: Syncer<R>,
}

/// Sequences one environment session.
pub struct Orchestrator<B, K, C, R: CommandRunner> {
    provisioner: Provisioner<B, K>,
    compute: ComputeManager<B>,
    establisher: ConnectionEstablisher<C>,
    sessions: SessionCache,
    syncer: Syncer<R>,
    settings: OrchestratorSettings,
    cancel: CancellationFlag,
    prompt: Option<Box<dyn ExitPrompt>>,
    machine: StateMachine,
    ledger: CleanupLedger,
    instance: Option<InstanceHandle>,
    identity: Option<EnvironmentIdentity>,
    adopted: bool,
}

impl<B, K, C, R> Orchestrator<B, K, C, R>
where
    B: crate::backend::Backend,
    K: KeyGenerator,
    C: Connector,
    R: CommandRunner,
{
    /// Creates an orchestrator observing `cancel`.
    #[must_use]
    pub fn new(
        components: Components<B, K, C, R>,
        settings: OrchestratorSettings,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            provisioner: components.provisioner,
            compute: components.compute,
            establisher: components.establisher,
            sessions: components.sessions,
            syncer: components.syncer,
            settings,
            cancel,
            prompt: None,
            machine: StateMachine::new(),
            ledger: CleanupLedger::new(),
            instance: None,
            identity: None,
            adopted: false,
        }
    }

    /// Asks `prompt` for the exit policy when a session ends normally.
    #[must_use]
    pub fn with_prompt(mut self, prompt: Box<dyn ExitPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.machine.current()
    }

    /// States visited so far.
    #[must_use]
    pub fn state_history(&self) -> &[LifecycleState] {
        self.machine.history()
    }

    /// Resources recorded for teardown.
    #[must_use]
    pub const fn ledger(&self) -> &CleanupLedger {
        &self.ledger
    }

    /// Instance of the current session.
    #[must_use]
    pub const fn instance(&self) -> Option<&InstanceHandle> {
        self.instance.as_ref()
    }

    /// Connection attempts made by the last connect.
    #[must_use]
    pub fn connect_history(&self) -> &[crate::connect::ConnectAttempt] {
        self.establisher.history()
    }

    /// Session cache in use.
    #[must_use]
    pub const fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Runs a full session for `identity`: acquire, connect, run `plan`,
    /// then release.
    ///
    /// An interrupt is reported as [`SessionExit::Cancelled`], not as an
    /// error. Interrupted acquisition rolls back everything this session
    /// created; a resumed environment is stopped again instead. Later
    /// interrupts apply the configured exit policy.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] for plan, acquisition, connection, and
    /// collaborator failures, each carrying the teardown that followed.
    pub async fn up(
        &mut self,
        identity: EnvironmentIdentity,
        plan: &RunPlan,
    ) -> Result<SessionReport, LifecycleError> {
        plan.validate().map_err(LifecycleError::Plan)?;
        self.machine.advance(LifecycleState::Acquiring)?;
        info!(name = %identity.name, token = %identity.token, "acquiring environment");

        let acquired = self.acquire(&identity).await;
        if self.identity.is_none() {
            self.identity = Some(identity);
        }
        let target = match acquired.and_then(|()| self.current_target()) {
            Ok(target) => target,
            Err(source) => {
                let cancelled = self.cancel.is_cancelled();
                let policy = self.rollback_policy();
                let rollback = self.release(policy).await;
                if cancelled {
                    return Ok(self.cancelled_report(policy, rollback));
                }
                return Err(LifecycleError::Acquire { source, rollback });
            }
        };
        self.machine.advance(LifecycleState::Running)?;

        self.machine.advance(LifecycleState::Connecting)?;
        let channel = match self.establisher.connect(&target, &self.cancel).await {
            Ok(channel) => channel,
            Err(ConnectError::Cancelled) => {
                let policy = self.settings.on_exit;
                let release = self.release(policy).await;
                return Ok(self.cancelled_report(policy, release));
            }
            Err(source) => {
                self.machine.advance(LifecycleState::Error)?;
                let release = self.release(self.settings.on_exit).await;
                return Err(LifecycleError::Connect { source, release });
            }
        };
        self.record_session(&target);
        self.machine.advance(LifecycleState::Active)?;
        info!(endpoint = %target, "environment active");

        let outcome = self.run_plan(&channel, &target, plan).await;
        if outcome.is_err() {
            self.machine.advance(LifecycleState::Error)?;
        }
        let policy = self.choose_on_exit();
        let release = self.release(policy).await;
        match outcome {
            Ok(exit) => Ok(SessionReport {
                exit,
                on_exit: policy,
                release,
            }),
            Err(source) => Err(LifecycleError::Run { source, release }),
        }
    }

    fn cancelled_report(&self, on_exit: OnExit, release: ReleaseReport) -> SessionReport {
        debug!(state = %self.machine.current(), "session cancelled");
        SessionReport {
            exit: SessionExit::Cancelled,
            on_exit,
            release,
        }
    }

    /// Policy for a failed or interrupted acquisition. A resumed environment
    /// existed before this session, so it is stopped rather than deleted.
    const fn rollback_policy(&self) -> OnExit {
        match (self.adopted, self.settings.on_exit) {
            (false, _) => OnExit::Terminate,
            (true, OnExit::KeepRunning) => OnExit::KeepRunning,
            (true, _) => OnExit::Stop,
        }
    }

    fn choose_on_exit(&self) -> OnExit {
        let default = self.settings.on_exit;
        if self.cancel.is_cancelled() {
            return default;
        }
        self.prompt
            .as_ref()
            .map_or(default, |prompt| prompt.choose(default))
    }

    async fn acquire(&mut self, identity: &EnvironmentIdentity) -> Result<(), AcquireError> {
        if let Some(existing) = self.compute.find_by_name(&identity.name).await? {
            ensure_reusable(&existing)?;
            return self.adopt_stopped(existing).await;
        }

        let (credential, policy) = self.provisioner.acquire(identity).await?;
        let security_group = policy.id_or_empty().to_owned();
        self.ledger.record(credential)?;
        self.ledger.record(policy)?;

        let spec = self
            .settings
            .launch
            .clone()
            .name(identity.name.clone())
            .security_group_id(security_group)
            .tags(identity.tags())
            .build()
            .map_err(AcquireError::Launch)?;
        let instance = self.compute.launch(&spec, &self.cancel).await?;
        self.ledger
            .record(ResourceHandle::confirmed(ResourceKind::Instance, instance.id.clone()))?;
        self.instance = Some(instance);
        Ok(())
    }

    /// Takes over a stopped instance and the resources created with it.
    async fn adopt_stopped(&mut self, mut instance: InstanceHandle) -> Result<(), AcquireError> {
        let token = instance
            .token()
            .map(str::to_owned)
            .ok_or_else(|| AcquireError::Untagged {
                id: instance.id.clone(),
            })?;
        let identity = EnvironmentIdentity::with_token(instance.name.clone(), token);
        let key_path = self.provisioner.key_path(&identity.token);
        if !key_path.exists() {
            return Err(AcquireError::MissingKey {
                name: identity.name,
                path: key_path,
            });
        }
        info!(name = %identity.name, id = %instance.id, "reusing stopped instance");

        let discovered = self
            .provisioner
            .discover(&identity)
            .await
            .map_err(|source| AcquireError::Discover {
                name: identity.name.clone(),
                source,
            })?;
        self.identity = Some(identity);
        self.adopted = true;
        for handle in discovered {
            self.ledger.record(handle)?;
        }
        self.ledger
            .record(ResourceHandle::confirmed(ResourceKind::Instance, instance.id.clone()))?;
        // The handle is kept even when the start fails, so release sees the
        // state the power-on left behind.
        let started = self.compute.start(&mut instance, &self.cancel).await;
        self.instance = Some(instance);
        started.map_err(AcquireError::from)
    }

    fn current_target(&self) -> Result<ConnectTarget, AcquireError> {
        let (Some(identity), Some(instance)) = (&self.identity, &self.instance) else {
            return Err(AcquireError::Unaddressed {
                name: String::new(),
                id: String::new(),
            });
        };
        let host = instance.public_ip.ok_or_else(|| AcquireError::Unaddressed {
            name: identity.name.clone(),
            id: instance.id.clone(),
        })?;
        Ok(self.target_for(host, self.provisioner.key_path(&identity.token)))
    }

    fn target_for(&self, host: IpAddr, key_file: Utf8PathBuf) -> ConnectTarget {
        ConnectTarget {
            host: host.to_string(),
            port: self.settings.ssh_port,
            user: self.settings.ssh_user.clone(),
            key_file,
        }
    }

    fn record_session(&self, target: &ConnectTarget) {
        let (Some(identity), Some(instance)) = (&self.identity, &self.instance) else {
            return;
        };
        let record = ConnectionRecord {
            name: identity.name.clone(),
            pid: std::process::id(),
            instance_id: instance.id.clone(),
            zone: instance.zone.clone(),
            host: target.host.clone(),
            port: target.port,
            user: target.user.clone(),
            key_file: target.key_file.clone(),
        };
        if let Err(err) = self.sessions.write(&record) {
            warn!(error = %err, "failed to write session record; exec will reconnect");
        }
    }

    async fn run_plan(
        &self,
        channel: &C::Channel,
        target: &ConnectTarget,
        plan: &RunPlan,
    ) -> Result<SessionExit, RunError> {
        if let Some(source) = &plan.sync_source {
            let destination = self.syncer.destination_for(target);
            self.syncer.sync(source, &destination).map_err(RunError::Sync)?;
            info!(source = %source, "initial sync complete");
        }
        if !self
            .required_step(channel, plan, "setup_script", plan.setup_script.as_deref())
            .await?
        {
            return Ok(SessionExit::Cancelled);
        }

        let mut tunnels = Vec::with_capacity(plan.ports.len());
        for forward in &plan.ports {
            tunnels.push(channel.open_tunnel(forward.local, forward.remote)?);
            info!(local = forward.local, remote = forward.remote, "port forward open");
        }

        if !self
            .required_step(channel, plan, "pre_command", plan.pre_command.as_deref())
            .await?
        {
            return Ok(SessionExit::Cancelled);
        }

        let Some(command) = &plan.command else {
            info!("environment ready; press Ctrl+C to release it");
            self.cancel.cancelled().await;
            return Ok(SessionExit::Cancelled);
        };
        let Some(outcome) = self.step(channel, plan, command).await? else {
            return Ok(SessionExit::Cancelled);
        };
        let code = outcome.code();

        let finished = if code == 0 {
            self.required_step(channel, plan, "post_command", plan.post_command.as_deref())
                .await?
        } else {
            self.best_effort_step(channel, plan, plan.post_command.as_deref())
                .await?
        };
        drop(tunnels);
        if finished {
            Ok(SessionExit::Completed(code))
        } else {
            Ok(SessionExit::Cancelled)
        }
    }

    /// Runs an optional step that must exit zero; `false` when cancelled.
    async fn required_step(
        &self,
        channel: &C::Channel,
        plan: &RunPlan,
        stage: &'static str,
        command: Option<&str>,
    ) -> Result<bool, RunError> {
        let Some(command) = command else {
            return Ok(true);
        };
        match self.step(channel, plan, command).await? {
            Some(CollaboratorOutcome::Succeeded) => Ok(true),
            Some(CollaboratorOutcome::Failed { code }) => {
                Err(RunError::CollaboratorFailed { stage, code })
            }
            None => Ok(false),
        }
    }

    /// Runs an optional hook whose failure only warns; the main command
    /// already failed and its code is what the caller reports.
    async fn best_effort_step(
        &self,
        channel: &C::Channel,
        plan: &RunPlan,
        command: Option<&str>,
    ) -> Result<bool, RunError> {
        let Some(command) = command else {
            return Ok(true);
        };
        match self.step(channel, plan, command).await? {
            Some(CollaboratorOutcome::Failed { code }) => {
                warn!(code, "post_command failed after a failing command");
                Ok(true)
            }
            Some(CollaboratorOutcome::Succeeded) => Ok(true),
            None => Ok(false),
        }
    }

    /// Runs one step in the remote directory; `None` when cancelled.
    async fn step(
        &self,
        channel: &C::Channel,
        plan: &RunPlan,
        command: &str,
    ) -> Result<Option<CollaboratorOutcome>, RunError> {
        let wrapped = wrap_in_directory(&plan.remote_dir, &plan.remote_command(command));
        match channel.execute(&wrapped, &self.cancel).await? {
            ExitOutcome::Exited(code) => Ok(Some(CollaboratorOutcome::from_code(code))),
            ExitOutcome::Cancelled => Ok(None),
        }
    }

    /// Walks the ledger in reverse under `policy`. Runs at most once per
    /// orchestrator; later calls return an empty report.
    ///
    /// Release waits do not observe the session's cancellation flag, so an
    /// interrupt that triggered the release does not cut it short.
    pub async fn release(&mut self, policy: OnExit) -> ReleaseReport {
        if !self.machine.begin_release() {
            debug!(state = %self.machine.current(), "release already handled");
            return ReleaseReport::default();
        }
        info!(policy = %policy, resources = self.ledger.entries().len(), "releasing environment");

        match policy {
            OnExit::Terminate => {}
            OnExit::Stop => {
                self.ledger.mark_not_needed(ResourceKind::Credential);
                self.ledger.mark_not_needed(ResourceKind::Policy);
            }
            OnExit::KeepRunning => {
                for kind in [ResourceKind::Credential, ResourceKind::Policy, ResourceKind::Instance] {
                    self.ledger.mark_not_needed(kind);
                }
            }
        }

        let release_flag = CancellationFlag::new();
        let mut report = ReleaseReport::default();
        let mut provisioned = Vec::new();
        let entries: Vec<_> = self.ledger.release_order().cloned().collect();
        for entry in entries {
            let kind = entry.handle.kind;
            if !entry.needed {
                report.skipped.push(kind);
                continue;
            }
            if kind != ResourceKind::Instance {
                provisioned.push(entry.handle);
                continue;
            }
            let mut instance = self.instance_for(&entry.handle);
            let result = if policy == OnExit::Stop {
                self.compute.stop(&mut instance, &release_flag).await
            } else {
                self.compute.terminate(&mut instance, &release_flag).await
            };
            self.instance = Some(instance);
            match result {
                Ok(()) => report.released.push(kind),
                Err(err) => {
                    warn!(kind = %kind, error = %err, "release step failed; continuing");
                    report.failures.push(ReleaseFailure {
                        kind,
                        message: err.to_string(),
                    });
                }
            }
        }
        // The provisioner walks its handles newest first.
        provisioned.reverse();
        report.merge(self.provisioner.release(&provisioned).await);

        if let Some(identity) = &self.identity {
            if let Err(err) = self.sessions.invalidate(&identity.name) {
                warn!(error = %err, "failed to remove session record");
            }
        }
        if let Err(err) = self.machine.advance(LifecycleState::Released) {
            warn!(error = %err, "unexpected state after release");
        }
        if report.is_clean() {
            info!(%report, "release complete");
        } else {
            warn!(%report, "release finished with errors; check the provider console for leftovers");
        }
        report
    }

    fn instance_for(&self, handle: &ResourceHandle) -> InstanceHandle {
        match &self.instance {
            Some(instance) if instance.id == handle.id_or_empty() => instance.clone(),
            _ => InstanceHandle {
                id: handle.id_or_empty().to_owned(),
                name: String::new(),
                zone: String::new(),
                state: InstanceState::Unknown(String::from("unobserved")),
                public_ip: None,
                tags: Vec::new(),
            },
        }
    }

    /// Runs `command` in an existing environment.
    ///
    /// A live session record skips provider lookups and probing. Otherwise
    /// the instance is resolved by name or id and connected with retries.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the environment cannot be found or
    /// reached, or the command cannot be started.
    pub async fn exec(
        &mut self,
        name_or_id: &str,
        command: &str,
        probe: &impl ProcessProbe,
    ) -> Result<ExitOutcome, LifecycleError> {
        crate::sync::validate_remote_command(command).map_err(LifecycleError::Plan)?;
        let wrapped = wrap_in_directory(&self.settings.remote_dir, command);

        if let Some(record) = self.sessions.read_alive(name_or_id, probe) {
            debug!(name = %record.name, pid = record.pid, "using live session record");
            let channel = self.establisher.connector().open(&record.target());
            return Ok(channel.execute(&wrapped, &self.cancel).await?);
        }

        let instance = self.compute.resolve(name_or_id).await?;
        let unreachable = |reason: &str| LifecycleError::Unreachable {
            name: instance.name.clone(),
            reason: reason.to_owned(),
        };
        if instance.state != InstanceState::Running {
            return Err(unreachable(&format!("instance is {}", instance.state)));
        }
        let host = instance
            .public_ip
            .ok_or_else(|| unreachable("no public address"))?;
        let token = instance
            .token()
            .ok_or_else(|| unreachable("instance has no token tag"))?;
        let key_file = self.provisioner.key_path(token);
        if !key_file.exists() {
            return Err(unreachable(&format!("private key {key_file} is missing")));
        }
        let target = self.target_for(host, key_file);
        let channel = self.establisher.connect(&target, &self.cancel).await?;
        Ok(channel.execute(&wrapped, &self.cancel).await?)
    }

    /// Describes an environment: its instance, local key, and any live
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Compute`] when the instance cannot be
    /// resolved unambiguously.
    pub async fn info(
        &self,
        name_or_id: &str,
        probe: &impl ProcessProbe,
    ) -> Result<EnvironmentInfo, LifecycleError> {
        let instance = self.compute.resolve(name_or_id).await?;
        let key_file = instance
            .token()
            .map(|token| self.provisioner.key_path(token))
            .filter(|path| path.exists());
        let session = self
            .sessions
            .read_alive(&instance.name, probe)
            .filter(|record| record.instance_id == instance.id);
        Ok(EnvironmentInfo {
            instance,
            key_file,
            session,
        })
    }

    /// Deletes an environment and everything created with it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the instance cannot be resolved
    /// unambiguously or its resources cannot be listed.
    pub async fn destroy(&mut self, name_or_id: &str) -> Result<ReleaseReport, LifecycleError> {
        let instance = self.compute.resolve(name_or_id).await?;
        self.machine.advance(LifecycleState::Acquiring)?;
        if let Some(token) = instance.token() {
            let identity = EnvironmentIdentity::with_token(instance.name.clone(), token);
            for handle in self.provisioner.discover(&identity).await? {
                self.ledger.record(handle)?;
            }
            self.identity = Some(identity);
        } else {
            warn!(id = %instance.id, "instance has no token tag; only the instance will be deleted");
            self.identity = Some(EnvironmentIdentity::with_token(instance.name.clone(), ""));
        }
        self.ledger
            .record(ResourceHandle::confirmed(ResourceKind::Instance, instance.id.clone()))?;
        self.instance = Some(instance);
        self.machine.advance(LifecycleState::Running)?;
        Ok(self.release(OnExit::Terminate).await)
    }

    /// Powers off an environment, keeping its resources.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Compute`] when resolution or the stop fails.
    pub async fn stop(&mut self, name_or_id: &str) -> Result<InstanceHandle, LifecycleError> {
        let mut instance = self.compute.resolve(name_or_id).await?;
        self.compute.stop(&mut instance, &self.cancel).await?;
        if let Err(err) = self.sessions.invalidate(&instance.name) {
            warn!(error = %err, "failed to remove session record");
        }
        Ok(instance)
    }

    /// Powers on a stopped environment.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Compute`] when resolution or the start fails.
    pub async fn start(&mut self, name_or_id: &str) -> Result<InstanceHandle, LifecycleError> {
        let mut instance = self.compute.resolve(name_or_id).await?;
        self.compute.start(&mut instance, &self.cancel).await?;
        Ok(instance)
    }

    /// Lists managed environments.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Compute`] when listing fails.
    pub async fn list(&self) -> Result<Vec<InstanceHandle>, LifecycleError> {
        Ok(self.compute.list().await?)
    }
}
