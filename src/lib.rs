//! Core library for the Bivouac remote development tool.
//!
//! The crate provisions short-lived development environments on Scaleway:
//! an SSH credential, a firewall policy, and an instance, created in that
//! order, connected to with backoff, and torn down in reverse. The
//! [`Orchestrator`] drives the lifecycle and owns the cleanup ledger; the
//! provider sits behind the [`Backend`] trait so the whole flow runs against
//! scripted doubles in tests.

pub mod backend;
pub mod cancel;
pub mod compute;
pub mod config;
pub mod connect;
pub mod identity;
pub mod ledger;
pub mod lifecycle;
pub mod provisioner;
pub mod scaleway;
pub mod session;
pub mod sync;
pub mod test_support;

pub use backend::{Backend, BackendError, BackendErrorKind, InstanceSnapshot, LaunchSpec};
pub use cancel::{CancellationFlag, Interrupt, SignalMonitor};
pub use compute::{ComputeError, ComputeManager, ComputeSettings, InstanceHandle};
pub use config::{ConfigError, LifecycleConfig, ScalewayConfig};
pub use connect::{ConnectError, ConnectionEstablisher, RetryPolicy, SshConnector};
pub use identity::EnvironmentIdentity;
pub use ledger::{CleanupLedger, ReleaseReport, ResourceHandle, ResourceKind};
pub use lifecycle::{
    Components, LifecycleError, LifecycleState, OnExit, Orchestrator, OrchestratorSettings,
    RunPlan, SessionExit, SessionReport,
};
pub use provisioner::{ProvisionSettings, Provisioner, SshKeygen};
pub use scaleway::ScalewayBackend;
pub use session::{ConnectionRecord, SessionCache, SystemProcessProbe};
pub use sync::{
    CommandOutput, DEFAULT_REMOTE_PATH, ProcessCommandRunner, SyncConfig, SyncError, Syncer,
};
