//! Credential and network-policy provisioning.
//!
//! The provisioner owns the two ancillary resources an instance needs: an
//! SSH key pair (generated locally, public half registered with the
//! provider) and a security group admitting the control-channel port.

use std::ffi::OsString;
use std::io;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs::Permissions, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, BackendErrorKind, KeySpec, PolicySpec, retry_transient,
};
use crate::identity::EnvironmentIdentity;
use crate::ledger::{ReleaseFailure, ReleaseReport, ResourceHandle, ResourceKind};
use crate::sync::CommandRunner;

/// Mode enforced on private key files.
pub const PRIVATE_KEY_MODE: u32 = 0o600;

/// Settings shared by credential and policy creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionSettings {
    /// Directory receiving private keys, `<state_dir>/keys`.
    pub keys_dir: Utf8PathBuf,
    /// Control-channel port opened by the policy.
    pub ssh_port: u16,
    /// Source range admitted by the policy.
    pub allowed_cidr: String,
}

impl ProvisionSettings {
    /// Settings rooted at `state_dir` with the default port and range.
    #[must_use]
    pub fn new(state_dir: &Utf8Path) -> Self {
        Self {
            keys_dir: state_dir.join("keys"),
            ssh_port: 22,
            allowed_cidr: String::from("0.0.0.0/0"),
        }
    }
}

/// Errors raised while provisioning or deleting ancillary resources.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// `ssh-keygen` failed or could not be started.
    #[error("failed to generate SSH key at {path}: {message}")]
    KeyGeneration {
        /// Private key path requested.
        path: Utf8PathBuf,
        /// Generator output or spawn error.
        message: String,
    },
    /// Reading, protecting, or removing key material failed.
    #[error("key file error at {path}: {message}")]
    KeyFile {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Error text.
        message: String,
    },
    /// The provider refused the public key.
    #[error("failed to register SSH key {name}: {source}")]
    Credential {
        /// Key name.
        name: String,
        /// Provider error.
        #[source]
        source: BackendError,
    },
    /// The provider refused the security group.
    #[error("failed to create security group {name}: {source}")]
    Policy {
        /// Group name.
        name: String,
        /// Provider error.
        #[source]
        source: BackendError,
    },
    /// Deleting a resource failed.
    #[error("failed to delete {kind} {id}: {source}")]
    Delete {
        /// Resource kind.
        kind: ResourceKind,
        /// Provider id.
        id: String,
        /// Provider error.
        #[source]
        source: BackendError,
    },
}

fn key_file_error(path: &Utf8Path, err: &io::Error) -> ProvisionError {
    ProvisionError::KeyFile {
        path: path.to_owned(),
        message: err.to_string(),
    }
}

fn remove_if_present(dir: &Dir, name: &str) -> io::Result<()> {
    match dir.remove_file(name) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Writes a new key pair to `path` and `path.pub`.
pub trait KeyGenerator {
    /// Generates the pair, labelling the public key with `comment`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::KeyGeneration`] when the pair cannot be
    /// written.
    fn generate(&self, path: &Utf8Path, comment: &str) -> Result<(), ProvisionError>;
}

/// Generates ed25519 keys with `ssh-keygen`.
#[derive(Clone, Debug)]
pub struct SshKeygen<R> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> SshKeygen<R> {
    /// Creates a generator running `program` through `runner`.
    #[must_use]
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

impl<R: CommandRunner> KeyGenerator for SshKeygen<R> {
    fn generate(&self, path: &Utf8Path, comment: &str) -> Result<(), ProvisionError> {
        let args = [
            OsString::from("-q"),
            OsString::from("-t"),
            OsString::from("ed25519"),
            OsString::from("-N"),
            OsString::new(),
            OsString::from("-C"),
            OsString::from(comment),
            OsString::from("-f"),
            OsString::from(path.as_str()),
        ];
        self.runner
            .run(&self.program, &args)
            .and_then(|output| output.success_or_failure(&self.program))
            .map(drop)
            .map_err(|err| ProvisionError::KeyGeneration {
                path: path.to_owned(),
                message: err.to_string(),
            })
    }
}

/// Creates and deletes credentials and policies through a [`Backend`].
#[derive(Clone, Debug)]
pub struct Provisioner<B, K> {
    backend: B,
    keygen: K,
    settings: ProvisionSettings,
}

impl<B: Backend, K: KeyGenerator> Provisioner<B, K> {
    /// Creates a provisioner.
    #[must_use]
    pub const fn new(backend: B, keygen: K, settings: ProvisionSettings) -> Self {
        Self {
            backend,
            keygen,
            settings,
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Private key path for the environment token `token`.
    #[must_use]
    pub fn key_path(&self, token: &str) -> Utf8PathBuf {
        self.settings.keys_dir.join(token)
    }

    fn keys_dir(&self) -> Result<Dir, ProvisionError> {
        let keys_dir = &self.settings.keys_dir;
        Dir::create_ambient_dir_all(keys_dir, ambient_authority())
            .and_then(|()| Dir::open_ambient_dir(keys_dir, ambient_authority()))
            .map_err(|err| key_file_error(keys_dir, &err))
    }

    /// Generates a fresh key pair and returns the public key.
    fn generate_key(&self, identity: &EnvironmentIdentity) -> Result<String, ProvisionError> {
        let dir = self.keys_dir()?;
        let path = self.key_path(&identity.token);
        let public_name = format!("{}.pub", identity.token);
        remove_if_present(&dir, &identity.token)
            .and_then(|()| remove_if_present(&dir, &public_name))
            .map_err(|err| key_file_error(&path, &err))?;

        self.keygen.generate(&path, &identity.resource_name())?;

        dir.set_permissions(
            &identity.token,
            Permissions::from_std(std::fs::Permissions::from_mode(PRIVATE_KEY_MODE)),
        )
        .map_err(|err| key_file_error(&path, &err))?;
        let public_key = dir
            .read_to_string(&public_name)
            .map_err(|err| key_file_error(&path, &err))?;
        Ok(public_key.trim().to_owned())
    }

    fn remove_key_files(&self, path: &Utf8Path) -> Result<(), ProvisionError> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(());
        };
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(key_file_error(path, &err)),
        };
        remove_if_present(&dir, name)
            .and_then(|()| remove_if_present(&dir, &format!("{name}.pub")))
            .map_err(|err| key_file_error(path, &err))
    }

    async fn delete_stale_keys(&self, name: &str) -> Result<(), BackendError> {
        let stale = retry_transient("find_ssh_keys", || self.backend.find_ssh_keys(name)).await?;
        for id in stale {
            warn!(name, id = %id, "deleting stale SSH key with the same name");
            ignore_not_found(retry_transient("delete_ssh_key", || self.backend.delete_ssh_key(&id)).await)?;
        }
        Ok(())
    }

    async fn delete_stale_groups(&self, name: &str) -> Result<(), BackendError> {
        let stale =
            retry_transient("find_security_groups", || self.backend.find_security_groups(name))
                .await?;
        for id in stale {
            warn!(name, id = %id, "deleting stale security group with the same name");
            ignore_not_found(
                retry_transient("delete_security_group", || {
                    self.backend.delete_security_group(&id)
                })
                .await,
            )?;
        }
        Ok(())
    }

    /// Generates a key pair and registers its public half.
    ///
    /// A name collision deletes the stale remote keys and retries once.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when generation or registration fails; the
    /// local key files are removed in that case.
    pub async fn create_credential(
        &self,
        identity: &EnvironmentIdentity,
    ) -> Result<ResourceHandle, ProvisionError> {
        let path = self.key_path(&identity.token);
        let spec = KeySpec {
            name: identity.resource_name(),
            public_key: self.generate_key(identity)?,
        };

        let mut result =
            retry_transient("create_ssh_key", || self.backend.create_ssh_key(&spec)).await;
        if matches!(&result, Err(err) if err.kind == BackendErrorKind::Conflict) {
            result = match self.delete_stale_keys(&spec.name).await {
                Ok(()) => {
                    retry_transient("create_ssh_key", || self.backend.create_ssh_key(&spec)).await
                }
                Err(err) => Err(err),
            };
        }

        match result {
            Ok(id) => {
                info!(name = %spec.name, id = %id, "SSH key registered");
                Ok(ResourceHandle::confirmed(ResourceKind::Credential, id).with_local_path(path))
            }
            Err(source) => {
                if let Err(err) = self.remove_key_files(&path) {
                    warn!(error = %err, "failed to remove unregistered key files");
                }
                Err(ProvisionError::Credential {
                    name: spec.name,
                    source,
                })
            }
        }
    }

    /// Creates the security group admitting the control-channel port.
    ///
    /// A name collision deletes the stale groups and retries once.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Policy`] when the provider refuses.
    pub async fn create_policy(
        &self,
        identity: &EnvironmentIdentity,
    ) -> Result<ResourceHandle, ProvisionError> {
        let spec = PolicySpec {
            name: identity.resource_name(),
            port: self.settings.ssh_port,
            allowed_cidr: self.settings.allowed_cidr.clone(),
            tags: identity.tags(),
        };

        let mut result = retry_transient("create_security_group", || {
            self.backend.create_security_group(&spec)
        })
        .await;
        if matches!(&result, Err(err) if err.kind == BackendErrorKind::Conflict) {
            result = match self.delete_stale_groups(&spec.name).await {
                Ok(()) => {
                    retry_transient("create_security_group", || {
                        self.backend.create_security_group(&spec)
                    })
                    .await
                }
                Err(err) => Err(err),
            };
        }

        let id = result.map_err(|source| ProvisionError::Policy {
            name: spec.name.clone(),
            source,
        })?;
        info!(name = %spec.name, id = %id, port = spec.port, "security group created");
        Ok(ResourceHandle::confirmed(ResourceKind::Policy, id))
    }

    /// Deletes a registered key and its local files. An absent key counts
    /// as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the provider or filesystem fails.
    pub async fn delete_credential(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let id = handle.id_or_empty();
        if !id.is_empty() {
            ignore_not_found(
                retry_transient("delete_ssh_key", || self.backend.delete_ssh_key(id)).await,
            )
            .map_err(|source| ProvisionError::Delete {
                kind: ResourceKind::Credential,
                id: id.to_owned(),
                source,
            })?;
        }
        if let Some(path) = &handle.local_path {
            self.remove_key_files(path)?;
        }
        debug!(id, "SSH key deleted");
        Ok(())
    }

    /// Deletes a security group. An absent group counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Delete`] when the provider fails.
    pub async fn delete_policy(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let id = handle.id_or_empty();
        ignore_not_found(
            retry_transient("delete_security_group", || {
                self.backend.delete_security_group(id)
            })
            .await,
        )
        .map_err(|source| ProvisionError::Delete {
            kind: ResourceKind::Policy,
            id: id.to_owned(),
            source,
        })?;
        debug!(id, "security group deleted");
        Ok(())
    }

    /// Creates the credential then the policy.
    ///
    /// # Errors
    ///
    /// Returns the first creation failure. When the policy fails the
    /// credential is deleted before returning.
    pub async fn acquire(
        &self,
        identity: &EnvironmentIdentity,
    ) -> Result<(ResourceHandle, ResourceHandle), ProvisionError> {
        let credential = self.create_credential(identity).await?;
        match self.create_policy(identity).await {
            Ok(policy) => Ok((credential, policy)),
            Err(err) => {
                if let Err(rollback) = self.delete_credential(&credential).await {
                    warn!(error = %rollback, "failed to roll back SSH key");
                }
                Err(err)
            }
        }
    }

    /// Deletes `handles` in reverse order, collecting failures instead of
    /// stopping at the first.
    pub async fn release(&self, handles: &[ResourceHandle]) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for handle in handles.iter().rev() {
            let result = match handle.kind {
                ResourceKind::Credential => self.delete_credential(handle).await,
                ResourceKind::Policy => self.delete_policy(handle).await,
                ResourceKind::Instance => {
                    report.skipped.push(handle.kind);
                    continue;
                }
            };
            match result {
                Ok(()) => report.released.push(handle.kind),
                Err(err) => {
                    warn!(kind = %handle.kind, error = %err, "release failed");
                    report.failures.push(ReleaseFailure {
                        kind: handle.kind,
                        message: err.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Finds the credential and policy created together with `identity`'s
    /// token, in creation order.
    ///
    /// # Errors
    ///
    /// Returns the provider error raised by the lookups.
    pub async fn discover(
        &self,
        identity: &EnvironmentIdentity,
    ) -> Result<Vec<ResourceHandle>, BackendError> {
        let name = identity.resource_name();
        let keys = retry_transient("find_ssh_keys", || self.backend.find_ssh_keys(&name)).await?;
        let groups =
            retry_transient("find_security_groups", || self.backend.find_security_groups(&name))
                .await?;
        let key_path = self.key_path(&identity.token);
        let mut handles: Vec<ResourceHandle> = keys
            .into_iter()
            .map(|id| {
                ResourceHandle::confirmed(ResourceKind::Credential, id)
                    .with_local_path(key_path.clone())
            })
            .collect();
        handles.extend(
            groups
                .into_iter()
                .map(|id| ResourceHandle::confirmed(ResourceKind::Policy, id)),
        );
        Ok(handles)
    }
}

fn ignore_not_found(result: Result<(), BackendError>) -> Result<(), BackendError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{FileKeyGenerator, ScriptedBackend, ScriptedRunner};

    struct Harness {
        _tmp: TempDir,
        backend: ScriptedBackend,
        keygen: FileKeyGenerator,
        provisioner: Provisioner<ScriptedBackend, FileKeyGenerator>,
        identity: EnvironmentIdentity,
    }

    #[fixture]
    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
        let backend = ScriptedBackend::new();
        let keygen = FileKeyGenerator::new();
        let provisioner =
            Provisioner::new(backend.clone(), keygen.clone(), ProvisionSettings::new(&root));
        Harness {
            _tmp: tmp,
            backend,
            keygen,
            provisioner,
            identity: EnvironmentIdentity::with_token("bivouac-app-main", "abcd1234"),
        }
    }

    #[test]
    fn ssh_keygen_writes_unencrypted_ed25519_pair() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let keygen = SshKeygen::new(runner.clone(), "ssh-keygen");

        keygen
            .generate(Utf8Path::new("/state/keys/abcd1234"), "bivouac-app-main-abcd1234")
            .unwrap_or_else(|err| panic!("generate: {err}"));

        let invocations = runner.invocations();
        let Some(call) = invocations.first() else {
            panic!("ssh-keygen was not invoked");
        };
        assert_eq!(call.program, "ssh-keygen");
        assert_eq!(
            call.args,
            [
                "-q",
                "-t",
                "ed25519",
                "-N",
                "",
                "-C",
                "bivouac-app-main-abcd1234",
                "-f",
                "/state/keys/abcd1234",
            ]
            .map(OsString::from)
        );
    }

    #[test]
    fn ssh_keygen_failure_reports_stderr() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "Saving key failed: permission denied\n");
        let keygen = SshKeygen::new(runner, "ssh-keygen");

        let Err(err) = keygen.generate(Utf8Path::new("/state/keys/x"), "x") else {
            panic!("keygen failure should surface");
        };
        assert!(err.to_string().contains("permission denied"), "{err}");
    }

    #[rstest]
    #[tokio::test]
    async fn credential_registers_public_key_and_protects_private_key(harness: Harness) {
        let handle = harness
            .provisioner
            .create_credential(&harness.identity)
            .await
            .unwrap_or_else(|err| panic!("create credential: {err}"));

        assert_eq!(handle.kind, ResourceKind::Credential);
        assert_eq!(
            harness.backend.calls(),
            vec!["create_ssh_key bivouac-app-main-abcd1234"]
        );
        let path = harness.provisioner.key_path("abcd1234");
        assert_eq!(handle.local_path.as_ref(), Some(&path));
        let mode = std::fs::metadata(&path)
            .unwrap_or_else(|err| panic!("metadata: {err}"))
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, PRIVATE_KEY_MODE);
        assert_eq!(
            harness.keygen.generated(),
            vec![(path, String::from("bivouac-app-main-abcd1234"))]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn credential_collision_replaces_stale_key_once(harness: Harness) {
        let stale = harness.backend.seed_ssh_key("bivouac-app-main-abcd1234");

        harness
            .provisioner
            .create_credential(&harness.identity)
            .await
            .unwrap_or_else(|err| panic!("create credential: {err}"));

        assert_eq!(
            harness.backend.calls(),
            vec![
                String::from("create_ssh_key bivouac-app-main-abcd1234"),
                String::from("find_ssh_keys bivouac-app-main-abcd1234"),
                format!("delete_ssh_key {stale}"),
                String::from("create_ssh_key bivouac-app-main-abcd1234"),
            ]
        );
        assert_eq!(harness.backend.ssh_keys().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn rejected_credential_removes_local_key(harness: Harness) {
        harness.backend.fail_once(
            "create_ssh_key",
            BackendError::new(BackendErrorKind::Rejected, "quota exceeded"),
        );

        let result = harness.provisioner.create_credential(&harness.identity).await;

        assert!(matches!(result, Err(ProvisionError::Credential { .. })));
        assert!(!harness.provisioner.key_path("abcd1234").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn keygen_failure_makes_no_provider_calls(harness: Harness) {
        harness.keygen.fail_next();

        let result = harness.provisioner.create_credential(&harness.identity).await;

        assert!(matches!(result, Err(ProvisionError::KeyGeneration { .. })));
        assert!(harness.backend.calls().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn policy_opens_configured_port(harness: Harness) {
        let handle = harness
            .provisioner
            .create_policy(&harness.identity)
            .await
            .unwrap_or_else(|err| panic!("create policy: {err}"));

        assert_eq!(handle.kind, ResourceKind::Policy);
        assert_eq!(
            harness.backend.calls(),
            vec!["create_security_group bivouac-app-main-abcd1234"]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn acquire_rolls_back_credential_when_policy_fails(harness: Harness) {
        harness.backend.fail_once(
            "create_security_group",
            BackendError::new(BackendErrorKind::Rejected, "forbidden"),
        );

        let result = harness.provisioner.acquire(&harness.identity).await;

        assert!(matches!(result, Err(ProvisionError::Policy { .. })));
        assert!(harness.backend.ssh_keys().is_empty());
        assert!(harness.backend.security_groups().is_empty());
        assert!(!harness.provisioner.key_path("abcd1234").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn release_deletes_policy_before_credential(harness: Harness) {
        let (credential, policy) = harness
            .provisioner
            .acquire(&harness.identity)
            .await
            .unwrap_or_else(|err| panic!("acquire: {err}"));
        harness.backend.clear_calls();

        let report = harness.provisioner.release(&[credential, policy]).await;

        assert!(report.is_clean(), "report: {report}");
        assert_eq!(
            report.released,
            vec![ResourceKind::Policy, ResourceKind::Credential]
        );
        let calls = harness.backend.mutating_calls();
        assert!(calls.first().is_some_and(|call| call.starts_with("delete_security_group")));
        assert!(calls.last().is_some_and(|call| call.starts_with("delete_ssh_key")));
        assert!(!harness.provisioner.key_path("abcd1234").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn release_treats_absent_resources_as_released(harness: Harness) {
        let handles = [
            ResourceHandle::confirmed(ResourceKind::Credential, "key-gone"),
            ResourceHandle::confirmed(ResourceKind::Policy, "sg-gone"),
        ];

        let report = harness.provisioner.release(&handles).await;

        assert!(report.is_clean(), "report: {report}");
        assert_eq!(report.released.len(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn release_continues_after_failure(harness: Harness) {
        let key = harness.backend.seed_ssh_key("bivouac-app-main-abcd1234");
        let group = harness.backend.seed_security_group("bivouac-app-main-abcd1234");
        harness.backend.fail_once(
            "delete_security_group",
            BackendError::new(BackendErrorKind::Other, "internal error"),
        );

        let report = harness
            .provisioner
            .release(&[
                ResourceHandle::confirmed(ResourceKind::Credential, key),
                ResourceHandle::confirmed(ResourceKind::Policy, group),
            ])
            .await;

        assert_eq!(report.error_count(), 1);
        assert_eq!(report.released, vec![ResourceKind::Credential]);
        assert!(harness.backend.ssh_keys().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn discover_finds_resources_by_token_name(harness: Harness) {
        let key = harness.backend.seed_ssh_key("bivouac-app-main-abcd1234");
        let group = harness.backend.seed_security_group("bivouac-app-main-abcd1234");
        harness.backend.seed_ssh_key("bivouac-app-main-ffff0000");

        let handles = harness
            .provisioner
            .discover(&harness.identity)
            .await
            .unwrap_or_else(|err| panic!("discover: {err}"));

        let ids: Vec<_> = handles.iter().map(ResourceHandle::id_or_empty).collect();
        assert_eq!(ids, vec![key.as_str(), group.as_str()]);
        assert_eq!(
            handles.first().and_then(|handle| handle.local_path.clone()),
            Some(harness.provisioner.key_path("abcd1234"))
        );
    }
}
