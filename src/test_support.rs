//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here implement the crate's seams ([`CommandRunner`],
//! [`Backend`], [`Connector`], [`ProcessProbe`]) with scripted, in-memory
//! behaviour so lifecycle scenarios run without a provider or network.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;

use crate::backend::{
    Backend, BackendError, BackendErrorKind, BackendFuture, InstanceSnapshot, InstanceState,
    KeySpec, LaunchSpec, PolicySpec,
};
use crate::cancel::CancellationFlag;
use crate::compute::{ComputeManager, ComputeSettings};
use crate::connect::{
    ConnectError, ConnectFuture, ConnectTarget, ConnectionEstablisher, Connector, ControlChannel,
    ExitOutcome, ProbeOutcome, RetryPolicy, validate_tunnel_ports,
};
use crate::lifecycle::{Components, OnExit, Orchestrator, OrchestratorSettings};
use crate::provisioner::{KeyGenerator, ProvisionError, ProvisionSettings, Provisioner};
use crate::session::{ProcessProbe, SessionCache};
use crate::sync::{
    CommandOutput, CommandRunner, DEFAULT_REMOTE_PATH, SyncConfig, SyncError, Syncer,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SyncError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| SyncError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push((key.to_string(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Address given to instances created by [`ScriptedBackend`].
pub const SCRIPTED_PUBLIC_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

#[derive(Debug, Default)]
struct BackendState {
    calls: Vec<String>,
    next_id: u32,
    keys: BTreeMap<String, String>,
    groups: BTreeMap<String, String>,
    instances: BTreeMap<String, InstanceSnapshot>,
    pending_polls: u32,
    polls_left: BTreeMap<String, u32>,
    stale_stopped_polls: u32,
    stale_left: BTreeMap<String, u32>,
    queued_failures: BTreeMap<&'static str, VecDeque<BackendError>>,
    persistent_failures: BTreeMap<&'static str, BackendError>,
}

impl BackendState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn take_failure(&mut self, operation: &'static str) -> Option<BackendError> {
        if let Some(err) = self.persistent_failures.get(operation) {
            return Some(err.clone());
        }
        self.queued_failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut InstanceSnapshot, BackendError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, format!("no instance {id}")))
    }
}

/// In-memory provider recording every call in order.
///
/// Instances are created stopped, become `running` with
/// [`SCRIPTED_PUBLIC_IP`] after [`ScriptedBackend::set_pending_polls`]
/// describes following a power on (zero by default), stop immediately, and
/// disappear once terminated.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl ScriptedBackend {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call made so far, rendered as `operation argument`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Calls whose operation equals `operation`.
    #[must_use]
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .collect()
    }

    /// Calls that changed provider state.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                !(call.starts_with("describe_")
                    || call.starts_with("find_")
                    || call.starts_with("list_"))
            })
            .collect()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Keeps newly created or started instances pending for `polls` describes.
    pub fn set_pending_polls(&self, polls: u32) {
        lock(&self.state).pending_polls = polls;
    }

    /// Keeps powered-on instances reporting `stopped` for `polls` describes
    /// before they turn pending.
    pub fn set_stale_stopped_polls(&self, polls: u32) {
        lock(&self.state).stale_stopped_polls = polls;
    }

    /// Fails the next call to `operation` with `error`.
    pub fn fail_once(&self, operation: &'static str, error: BackendError) {
        lock(&self.state)
            .queued_failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Fails every call to `operation` with `error`.
    pub fn fail_always(&self, operation: &'static str, error: BackendError) {
        lock(&self.state)
            .persistent_failures
            .insert(operation, error);
    }

    /// Registers a key as if an earlier run had left it behind.
    pub fn seed_ssh_key(&self, name: &str) -> String {
        let mut state = lock(&self.state);
        let id = state.allocate("key");
        state.keys.insert(id.clone(), name.to_owned());
        id
    }

    /// Registers a security group as if created earlier.
    pub fn seed_security_group(&self, name: &str) -> String {
        let mut state = lock(&self.state);
        let id = state.allocate("sg");
        state.groups.insert(id.clone(), name.to_owned());
        id
    }

    /// Inserts an existing instance.
    pub fn seed_instance(&self, snapshot: InstanceSnapshot) {
        lock(&self.state)
            .instances
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Registered key ids.
    #[must_use]
    pub fn ssh_keys(&self) -> Vec<String> {
        lock(&self.state).keys.keys().cloned().collect()
    }

    /// Existing security group ids.
    #[must_use]
    pub fn security_groups(&self) -> Vec<String> {
        lock(&self.state).groups.keys().cloned().collect()
    }

    /// Current instance snapshots.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        lock(&self.state).instances.values().cloned().collect()
    }

    fn begin(&self, operation: &'static str, argument: &str) -> Result<MutexGuard<'_, BackendState>, BackendError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{operation} {argument}"));
        match state.take_failure(operation) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    fn create_ssh_key_now(&self, spec: &KeySpec) -> Result<String, BackendError> {
        let mut state = self.begin("create_ssh_key", &spec.name)?;
        if state.keys.values().any(|name| name == &spec.name) {
            return Err(BackendError::new(
                BackendErrorKind::Conflict,
                format!("key {} already exists", spec.name),
            ));
        }
        let id = state.allocate("key");
        state.keys.insert(id.clone(), spec.name.clone());
        Ok(id)
    }

    fn find_by_name(&self, operation: &'static str, name: &str, groups: bool) -> Result<Vec<String>, BackendError> {
        let state = self.begin(operation, name)?;
        let source = if groups { &state.groups } else { &state.keys };
        Ok(source
            .iter()
            .filter(|(_, existing)| existing.as_str() == name)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn delete_named(&self, operation: &'static str, id: &str, groups: bool) -> Result<(), BackendError> {
        let mut state = self.begin(operation, id)?;
        if groups {
            let in_use = state
                .instances
                .values()
                .any(|instance| instance.tags.iter().any(|tag| tag == &format!("sg={id}")));
            if in_use {
                return Err(BackendError::new(
                    BackendErrorKind::Conflict,
                    format!("security group {id} is attached to an instance"),
                ));
            }
        }
        let source = if groups { &mut state.groups } else { &mut state.keys };
        source
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, format!("no resource {id}")))
    }

    fn create_security_group_now(&self, spec: &PolicySpec) -> Result<String, BackendError> {
        let mut state = self.begin("create_security_group", &spec.name)?;
        let id = state.allocate("sg");
        state.groups.insert(id.clone(), spec.name.clone());
        Ok(id)
    }

    fn create_instance_now(&self, spec: &LaunchSpec) -> Result<InstanceSnapshot, BackendError> {
        let mut state = self.begin("create_instance", &spec.name)?;
        let id = state.allocate("i");
        let mut tags = spec.tags.clone();
        tags.push(format!("sg={}", spec.security_group_id));
        let snapshot = InstanceSnapshot {
            id: id.clone(),
            name: spec.name.clone(),
            zone: String::from("fr-par-1"),
            state: InstanceState::Stopped,
            public_ip: None,
            tags,
        };
        state.instances.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    fn describe_instance_now(&self, id: &str) -> Result<Option<InstanceSnapshot>, BackendError> {
        let mut state = self.begin("describe_instance", id)?;
        if let Some(stale) = state.stale_left.get(id).copied() {
            if stale > 0 {
                if stale != u32::MAX {
                    state.stale_left.insert(id.to_owned(), stale - 1);
                }
                return Ok(state.instances.get(id).cloned());
            }
            state.stale_left.remove(id);
            if let Some(instance) = state.instances.get_mut(id) {
                instance.state = InstanceState::Pending;
            }
        }
        let remaining = state.polls_left.get(id).copied();
        let Some(instance) = state.instances.get_mut(id) else {
            return Ok(None);
        };
        match remaining {
            Some(0) => {
                if instance.state == InstanceState::Pending {
                    instance.state = InstanceState::Running;
                    instance.public_ip = Some(SCRIPTED_PUBLIC_IP);
                }
                let snapshot = instance.clone();
                state.polls_left.remove(id);
                Ok(Some(snapshot))
            }
            Some(left) => {
                let snapshot = instance.clone();
                if left != u32::MAX {
                    state.polls_left.insert(id.to_owned(), left - 1);
                }
                Ok(Some(snapshot))
            }
            None => Ok(Some(instance.clone())),
        }
    }

    fn set_power(&self, operation: &'static str, id: &str) -> Result<(), BackendError> {
        let mut state = self.begin(operation, id)?;
        let polls = state.pending_polls;
        let stale = state.stale_stopped_polls;
        let instance = state.instance_mut(id)?;
        if operation == "power_on" {
            if stale == 0 {
                instance.state = InstanceState::Pending;
            } else {
                state.stale_left.insert(id.to_owned(), stale);
            }
            state.polls_left.insert(id.to_owned(), polls);
        } else {
            instance.state = InstanceState::Stopped;
            instance.public_ip = None;
        }
        Ok(())
    }

    fn terminate_now(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.begin("terminate", id)?;
        state.instance_mut(id)?;
        state.instances.remove(id);
        state.polls_left.remove(id);
        state.stale_left.remove(id);
        Ok(())
    }
}

impl Backend for ScriptedBackend {
    fn create_ssh_key<'a>(&'a self, spec: &'a KeySpec) -> BackendFuture<'a, String> {
        Box::pin(async move { self.create_ssh_key_now(spec) })
    }

    fn find_ssh_keys<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move { self.find_by_name("find_ssh_keys", name, false) })
    }

    fn delete_ssh_key<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.delete_named("delete_ssh_key", id, false) })
    }

    fn create_security_group<'a>(&'a self, spec: &'a PolicySpec) -> BackendFuture<'a, String> {
        Box::pin(async move { self.create_security_group_now(spec) })
    }

    fn find_security_groups<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move { self.find_by_name("find_security_groups", name, true) })
    }

    fn delete_security_group<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.delete_named("delete_security_group", id, true) })
    }

    fn create_instance<'a>(&'a self, spec: &'a LaunchSpec) -> BackendFuture<'a, InstanceSnapshot> {
        Box::pin(async move { self.create_instance_now(spec) })
    }

    fn describe_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>> {
        Box::pin(async move { self.describe_instance_now(id) })
    }

    fn list_instances(&self) -> BackendFuture<'_, Vec<InstanceSnapshot>> {
        Box::pin(async move {
            let state = self.begin("list_instances", "")?;
            Ok(state.instances.values().cloned().collect())
        })
    }

    fn power_on<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.set_power("power_on", id) })
    }

    fn power_off<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.set_power("power_off", id) })
    }

    fn terminate<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.terminate_now(id) })
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    probes: VecDeque<ProbeOutcome>,
    probe_times: Vec<Instant>,
    exits: VecDeque<ExitOutcome>,
    executed: Vec<String>,
    tunnels: Vec<(u16, u16)>,
    block_until_cancelled: bool,
}

/// Connector whose probe outcomes and command exits are scripted.
///
/// Probes answer from the queue and report reachable once it is empty.
/// Commands exit `0` unless an exit was queued.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl ScriptedConnector {
    /// Creates a connector that is reachable immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `count` unreachable probes.
    pub fn fail_probes(&self, count: u32) {
        let mut state = lock(&self.state);
        for attempt in 1..=count {
            state
                .probes
                .push_back(ProbeOutcome::Unreachable(format!("connection refused ({attempt})")));
        }
    }

    /// Queues one probe outcome.
    pub fn push_probe(&self, outcome: ProbeOutcome) {
        lock(&self.state).probes.push_back(outcome);
    }

    /// Queues the exit of the next remote command.
    pub fn push_exit(&self, outcome: ExitOutcome) {
        lock(&self.state).exits.push_back(outcome);
    }

    /// Makes remote commands run until cancellation.
    pub fn block_until_cancelled(&self) {
        lock(&self.state).block_until_cancelled = true;
    }

    /// Instants at which probes were made.
    #[must_use]
    pub fn probe_times(&self) -> Vec<Instant> {
        lock(&self.state).probe_times.clone()
    }

    /// Remote commands executed, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        lock(&self.state).executed.clone()
    }

    /// Port forwards opened as `(local, remote)`.
    #[must_use]
    pub fn tunnels(&self) -> Vec<(u16, u16)> {
        lock(&self.state).tunnels.clone()
    }
}

impl Connector for ScriptedConnector {
    type Channel = ScriptedChannel;

    fn probe<'a>(&'a self, _target: &'a ConnectTarget) -> ConnectFuture<'a, ProbeOutcome> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.probe_times.push(Instant::now());
            state.probes.pop_front().unwrap_or(ProbeOutcome::Reachable)
        })
    }

    fn open(&self, target: &ConnectTarget) -> Self::Channel {
        ScriptedChannel {
            state: Arc::clone(&self.state),
            target: target.clone(),
        }
    }
}

/// Channel produced by [`ScriptedConnector`].
#[derive(Clone, Debug)]
pub struct ScriptedChannel {
    state: Arc<Mutex<ConnectorState>>,
    target: ConnectTarget,
}

impl ScriptedChannel {
    /// Target the channel was opened for.
    #[must_use]
    pub const fn target(&self) -> &ConnectTarget {
        &self.target
    }
}

/// Port forward handle produced by [`ScriptedChannel`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScriptedTunnel {
    /// Local port.
    pub local_port: u16,
    /// Remote port.
    pub remote_port: u16,
}

impl ControlChannel for ScriptedChannel {
    type Tunnel = ScriptedTunnel;

    fn execute<'a>(
        &'a self,
        command: &'a str,
        cancel: &'a CancellationFlag,
    ) -> ConnectFuture<'a, Result<ExitOutcome, ConnectError>> {
        Box::pin(async move {
            let block = {
                let mut state = lock(&self.state);
                state.executed.push(command.to_owned());
                state.block_until_cancelled
            };
            if block {
                cancel.cancelled().await;
                return Ok(ExitOutcome::Cancelled);
            }
            if cancel.is_cancelled() {
                return Ok(ExitOutcome::Cancelled);
            }
            Ok(lock(&self.state)
                .exits
                .pop_front()
                .unwrap_or(ExitOutcome::Exited(0)))
        })
    }

    fn open_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self::Tunnel, ConnectError> {
        validate_tunnel_ports(local_port, remote_port)?;
        lock(&self.state).tunnels.push((local_port, remote_port));
        Ok(ScriptedTunnel {
            local_port,
            remote_port,
        })
    }
}

/// Process probe reporting a fixed set of live process ids.
#[derive(Clone, Debug, Default)]
pub struct StaticProcessProbe {
    alive: BTreeSet<u32>,
}

impl StaticProcessProbe {
    /// Probe for which exactly `pids` are alive.
    #[must_use]
    pub fn alive(pids: &[u32]) -> Self {
        Self {
            alive: pids.iter().copied().collect(),
        }
    }
}

impl ProcessProbe for StaticProcessProbe {
    fn is_running(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

#[derive(Debug, Default)]
struct KeygenState {
    generated: Vec<(Utf8PathBuf, String)>,
    fail_next: bool,
}

/// Key generator writing placeholder key files without `ssh-keygen`.
#[derive(Clone, Debug, Default)]
pub struct FileKeyGenerator {
    state: Arc<Mutex<KeygenState>>,
}

impl FileKeyGenerator {
    /// Creates a generator that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next generation.
    pub fn fail_next(&self) {
        lock(&self.state).fail_next = true;
    }

    /// Paths and comments passed so far.
    #[must_use]
    pub fn generated(&self) -> Vec<(Utf8PathBuf, String)> {
        lock(&self.state).generated.clone()
    }
}

impl KeyGenerator for FileKeyGenerator {
    fn generate(&self, path: &Utf8Path, comment: &str) -> Result<(), ProvisionError> {
        let mut state = lock(&self.state);
        state.generated.push((path.to_owned(), comment.to_owned()));
        if std::mem::take(&mut state.fail_next) {
            return Err(ProvisionError::KeyGeneration {
                path: path.to_owned(),
                message: String::from("simulated failure"),
            });
        }
        let write = |target: &str, contents: &str| {
            std::fs::write(target, contents).map_err(|err| ProvisionError::KeyFile {
                path: path.to_owned(),
                message: err.to_string(),
            })
        };
        write(path.as_str(), "PRIVATE KEY\n")?;
        write(&format!("{path}.pub"), &format!("ssh-ed25519 AAAAC3Nza {comment}\n"))
    }
}

/// Orchestrator wired entirely to scripted doubles.
pub type ScriptedOrchestrator =
    Orchestrator<ScriptedBackend, FileKeyGenerator, ScriptedConnector, ScriptedRunner>;

/// Shared doubles behind a [`ScriptedOrchestrator`].
///
/// Clones of the doubles share state with the orchestrator, so tests script
/// and inspect them after building it.
#[derive(Clone, Debug)]
pub struct ScriptedEnvironment {
    /// Provider double.
    pub backend: ScriptedBackend,
    /// Key generator double.
    pub keygen: FileKeyGenerator,
    /// Connector double.
    pub connector: ScriptedConnector,
    /// Runner used for workspace sync.
    pub runner: ScriptedRunner,
    /// Cancellation flag observed by the orchestrator.
    pub cancel: CancellationFlag,
    /// State directory holding keys and session records.
    pub state_dir: Utf8PathBuf,
}

impl ScriptedEnvironment {
    /// Creates doubles rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Utf8Path) -> Self {
        Self {
            backend: ScriptedBackend::new(),
            keygen: FileKeyGenerator::new(),
            connector: ScriptedConnector::new(),
            runner: ScriptedRunner::new(),
            cancel: CancellationFlag::new(),
            state_dir: state_dir.to_owned(),
        }
    }

    /// Session cache under the state directory.
    #[must_use]
    pub fn sessions(&self) -> SessionCache {
        SessionCache::new(&self.state_dir)
    }

    /// Private key path for `token`.
    #[must_use]
    pub fn key_path(&self, token: &str) -> Utf8PathBuf {
        ProvisionSettings::new(&self.state_dir).keys_dir.join(token)
    }

    /// Builds an orchestrator with the default retry schedule and `on_exit`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the default sync settings are rejected.
    pub fn orchestrator(&self, on_exit: OnExit) -> Result<ScriptedOrchestrator, SyncError> {
        let components = Components {
            provisioner: Provisioner::new(
                self.backend.clone(),
                self.keygen.clone(),
                ProvisionSettings::new(&self.state_dir),
            ),
            compute: ComputeManager::new(self.backend.clone(), ComputeSettings::default()),
            establisher: ConnectionEstablisher::new(
                self.connector.clone(),
                RetryPolicy::default(),
            ),
            sessions: self.sessions(),
            syncer: Syncer::new(SyncConfig::default(), self.runner.clone())?,
        };
        let settings = OrchestratorSettings {
            launch: LaunchSpec::builder()
                .instance_type("DEV1-S")
                .image_label("Ubuntu 24.04 Noble Numbat")
                .architecture("x86_64"),
            ssh_user: String::from("root"),
            ssh_port: 22,
            on_exit,
            remote_dir: String::from(DEFAULT_REMOTE_PATH),
        };
        Ok(Orchestrator::new(components, settings, self.cancel.clone()))
    }
}
