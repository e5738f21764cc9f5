//! Provider abstraction for the resources an environment owns.
//!
//! A [`Backend`] exposes the small set of remote calls the lifecycle needs:
//! SSH key registration, security groups, and instance power management.
//! The concrete implementation is chosen once at process start; tests swap
//! in a scripted double through the same trait.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::cancel::CancellationFlag;

/// Tag carried by every resource this tool creates.
pub const MANAGED_BY_TAG: &str = "managed-by=bivouac";

/// Prefix of the tag linking resources created together.
pub const TOKEN_TAG_PREFIX: &str = "bivouac-token=";

const TRANSIENT_ATTEMPTS: u32 = 3;
const TRANSIENT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Categories of provider failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendErrorKind {
    /// Throttling or eventual-consistency failures worth retrying.
    Transient,
    /// Authorisation or validation failures; never retried.
    Rejected,
    /// A resource with the requested name already exists.
    Conflict,
    /// The target resource does not exist.
    NotFound,
    /// Anything the provider reported that fits no other category.
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::Conflict => "conflict",
            Self::NotFound => "not found",
            Self::Other => "provider",
        };
        f.write_str(label)
    }
}

/// Error returned by every backend call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind} error: {message}")]
pub struct BackendError {
    /// Failure category used by callers to decide on retries.
    pub kind: BackendErrorKind,
    /// Provider supplied description.
    pub message: String,
}

impl BackendError {
    /// Builds an error of the given kind.
    #[must_use]
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a validation failure on `field`.
    #[must_use]
    pub fn validation(field: &str) -> Self {
        Self::new(
            BackendErrorKind::Rejected,
            format!("missing or empty field: {field}"),
        )
    }

    /// Returns `true` when the failure is safe to retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, BackendErrorKind::Transient)
    }

    /// Returns `true` when the target was already absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, BackendErrorKind::NotFound)
    }
}

/// Provider state of an instance, mirrored locally.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Booting or powering on.
    Pending,
    /// Running and able to accept connections once booted.
    Running,
    /// Powering off.
    Stopping,
    /// Powered off, resources preserved.
    Stopped,
    /// Being deleted.
    ShuttingDown,
    /// Deleted; the provider no longer lists it.
    Terminated,
    /// Any state the provider reports that is not modelled above.
    Unknown(String),
}

impl InstanceState {
    /// Returns the lowercase label used in logs and listings.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Unknown(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time view of an instance as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    /// Provider identifier.
    pub id: String,
    /// Instance name; the environment name for instances this tool created.
    pub name: String,
    /// Zone hosting the instance.
    pub zone: String,
    /// Current state.
    pub state: InstanceState,
    /// Public address once assigned.
    pub public_ip: Option<IpAddr>,
    /// Provider tags.
    pub tags: Vec<String>,
}

impl InstanceSnapshot {
    /// Returns the token linking this instance to its credential and policy.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|tag| tag.strip_prefix(TOKEN_TAG_PREFIX))
    }
}

/// Request to register public key material with the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeySpec {
    /// Name of the key, `<environment>-<token>`.
    pub name: String,
    /// OpenSSH encoded public key.
    pub public_key: String,
}

/// Request to create an inbound-only network policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicySpec {
    /// Name of the security group, `<environment>-<token>`.
    pub name: String,
    /// TCP port opened for the control channel.
    pub port: u16,
    /// Source range allowed to reach `port`.
    pub allowed_cidr: String,
    /// Tags applied to the group.
    pub tags: Vec<String>,
}

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Instance name; the environment's derived name.
    pub name: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Human readable label of the boot image.
    pub image_label: String,
    /// CPU architecture requested for the instance.
    pub architecture: String,
    /// Security group attached at creation.
    pub security_group_id: String,
    /// Tags applied to the instance.
    pub tags: Vec<String>,
}

impl LaunchSpec {
    /// Starts a builder for a [`LaunchSpec`].
    #[must_use]
    pub fn builder() -> LaunchSpecBuilder {
        LaunchSpecBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendErrorKind::Rejected`] error naming the first empty
    /// field.
    pub fn validate(&self) -> Result<(), BackendError> {
        let fields = [
            ("name", &self.name),
            ("instance_type", &self.instance_type),
            ("image_label", &self.image_label),
            ("architecture", &self.architecture),
            ("security_group_id", &self.security_group_id),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(BackendError::validation(field));
            }
        }
        Ok(())
    }
}

/// Builder for [`LaunchSpec`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchSpecBuilder {
    name: String,
    instance_type: String,
    image_label: String,
    architecture: String,
    security_group_id: String,
    tags: Vec<String>,
}

impl LaunchSpecBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the instance name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets the security group attached at creation.
    #[must_use]
    pub fn security_group_id(mut self, value: impl Into<String>) -> Self {
        self.security_group_id = value.into();
        self
    }

    /// Replaces the tag list.
    #[must_use]
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Builds and validates the [`LaunchSpec`].
    ///
    /// # Errors
    ///
    /// Returns a [`BackendErrorKind::Rejected`] error when any required field
    /// is empty after trimming.
    pub fn build(self) -> Result<LaunchSpec, BackendError> {
        let spec = LaunchSpec {
            name: self.name.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            image_label: self.image_label.trim().to_owned(),
            architecture: self.architecture.trim().to_owned(),
            security_group_id: self.security_group_id.trim().to_owned(),
            tags: self.tags,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E = BackendError> =
    Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Remote calls needed to acquire and release an environment.
pub trait Backend: Send + Sync {
    /// Registers public key material and returns its identifier.
    fn create_ssh_key<'a>(&'a self, spec: &'a KeySpec) -> BackendFuture<'a, String>;

    /// Returns identifiers of keys carrying exactly `name`.
    fn find_ssh_keys<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<String>>;

    /// Deletes a registered key.
    fn delete_ssh_key<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// Creates a default-deny inbound security group and returns its id.
    fn create_security_group<'a>(&'a self, spec: &'a PolicySpec) -> BackendFuture<'a, String>;

    /// Returns identifiers of security groups carrying exactly `name`.
    fn find_security_groups<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<String>>;

    /// Deletes a security group.
    fn delete_security_group<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// Creates an instance without powering it on; the snapshot reports it
    /// stopped until [`Backend::power_on`] is called.
    fn create_instance<'a>(&'a self, spec: &'a LaunchSpec) -> BackendFuture<'a, InstanceSnapshot>;

    /// Fetches an instance; `None` once the provider no longer lists it.
    fn describe_instance<'a>(&'a self, id: &'a str)
    -> BackendFuture<'a, Option<InstanceSnapshot>>;

    /// Lists every instance carrying [`MANAGED_BY_TAG`].
    fn list_instances(&self) -> BackendFuture<'_, Vec<InstanceSnapshot>>;

    /// Requests a power on.
    fn power_on<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// Requests a power off that preserves disks.
    fn power_off<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// Requests deletion of the instance and its disks.
    fn terminate<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;
}

/// Runs `call` again while it fails with a transient error.
///
/// Rejections and every other category surface on the first failure.
///
/// # Errors
///
/// Returns the last error once the attempt budget is spent, or the first
/// non-transient error.
pub async fn retry_transient<T, F, Fut>(operation: &str, call: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    retry_transient_until(operation, &CancellationFlag::new(), call).await
}

/// [`retry_transient`] whose back-off sleeps end early once `cancel` is set.
///
/// # Errors
///
/// As [`retry_transient`]; a cancelled back-off returns the transient error
/// that preceded it.
pub async fn retry_transient_until<T, F, Fut>(
    operation: &str,
    cancel: &CancellationFlag,
    mut call: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 1;
    let mut delay = TRANSIENT_BASE_DELAY;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < TRANSIENT_ATTEMPTS => {
                warn!(operation, attempt, error = %err, "transient provider error, retrying");
                if cancel.sleep(delay).await.is_err() {
                    return Err(err);
                }
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;

    fn spec_builder() -> LaunchSpecBuilder {
        LaunchSpec::builder()
            .name(" dev ")
            .instance_type("DEV1-S")
            .image_label("Ubuntu 24.04 Noble Numbat")
            .architecture("x86_64")
            .security_group_id("sg-1")
    }

    #[test]
    fn builder_trims_fields() {
        let spec = spec_builder()
            .build()
            .unwrap_or_else(|err| panic!("spec should build: {err}"));
        assert_eq!(spec.name, "dev");
    }

    #[rstest]
    #[case::name(spec_builder().name("  "), "name")]
    #[case::instance_type(spec_builder().instance_type(""), "instance_type")]
    #[case::security_group(spec_builder().security_group_id(""), "security_group_id")]
    fn builder_rejects_empty_fields(#[case] builder: LaunchSpecBuilder, #[case] field: &str) {
        let Err(err) = builder.build() else {
            panic!("empty {field} should be rejected");
        };
        assert_eq!(err.kind, BackendErrorKind::Rejected);
        assert!(err.message.contains(field), "message: {}", err.message);
    }

    #[test]
    fn snapshot_exposes_token_tag() {
        let snapshot = InstanceSnapshot {
            id: String::from("i-1"),
            name: String::from("dev"),
            zone: String::from("fr-par-1"),
            state: InstanceState::Running,
            public_ip: None,
            tags: vec![MANAGED_BY_TAG.to_owned(), format!("{TOKEN_TAG_PREFIX}abcd1234")],
        };
        assert_eq!(snapshot.token(), Some("abcd1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transient_retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_transient("create", move || async move {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            if seen < 2 {
                Err(BackendError::new(BackendErrorKind::Transient, "throttled"))
            } else {
                Ok(seen)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transient_never_retries_rejections() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), BackendError> = retry_transient("create", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::new(BackendErrorKind::Rejected, "denied"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transient_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), BackendError> = retry_transient("create", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::new(BackendErrorKind::Transient, "throttled"))
        })
        .await;

        assert!(result.is_err_and(|err| err.is_transient()));
        assert_eq!(calls.load(Ordering::SeqCst), TRANSIENT_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transient_until_stops_backing_off_once_cancelled() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();

        let result: Result<(), BackendError> =
            retry_transient_until("power_on", &cancel, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::new(BackendErrorKind::Transient, "throttled"))
            })
            .await;

        assert!(result.is_err_and(|err| err.is_transient()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < TRANSIENT_BASE_DELAY);
    }
}
