//! Append-only record of resources an environment owns.
//!
//! Entries are appended only after the provider confirms creation, and
//! teardown walks them in strict reverse order. Release order therefore
//! follows creation order structurally instead of being re-derived from
//! resource kinds.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Kinds of resource an environment owns.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// SSH key pair registered with the provider plus its local private key.
    Credential,
    /// Security group admitting the control-channel port.
    Policy,
    /// Compute instance.
    Instance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Credential => "credential",
            Self::Policy => "policy",
            Self::Instance => "instance",
        })
    }
}

/// One acquired external resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceHandle {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider identifier; absent until creation succeeds.
    pub id: Option<String>,
    /// Local artefact, only for credential material.
    pub local_path: Option<Utf8PathBuf>,
    /// Set once the provider echoed success.
    pub confirmed: bool,
}

impl ResourceHandle {
    /// Handle for a resource the provider has confirmed.
    #[must_use]
    pub fn confirmed(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
            local_path: None,
            confirmed: true,
        }
    }

    /// Attaches the local artefact path.
    #[must_use]
    pub fn with_local_path(mut self, path: Utf8PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    /// Provider identifier, or an empty string when none was assigned.
    #[must_use]
    pub fn id_or_empty(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Errors raised when appending to the ledger.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LedgerError {
    /// Raised for handles the provider never confirmed.
    #[error("{kind} has not been confirmed by the provider")]
    Unconfirmed {
        /// Kind of the rejected handle.
        kind: ResourceKind,
    },
}

/// Ledger entry with its teardown status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LedgerEntry {
    /// Confirmed resource.
    pub handle: ResourceHandle,
    /// Cleared when teardown is no longer needed for this entry.
    pub needed: bool,
}

/// Ordered teardown actions, appended as creations are confirmed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupLedger {
    entries: Vec<LedgerEntry>,
}

impl CleanupLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a confirmed resource.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unconfirmed`] when the handle lacks an id or
    /// confirmation.
    pub fn record(&mut self, handle: ResourceHandle) -> Result<(), LedgerError> {
        if !handle.confirmed || handle.id.is_none() {
            return Err(LedgerError::Unconfirmed { kind: handle.kind });
        }
        self.entries.push(LedgerEntry {
            handle,
            needed: true,
        });
        Ok(())
    }

    /// Marks every entry of `kind` as not needing teardown.
    pub fn mark_not_needed(&mut self, kind: ResourceKind) {
        for entry in self.entries.iter_mut().filter(|entry| entry.handle.kind == kind) {
            entry.needed = false;
        }
    }

    /// Entries in creation order.
    #[must_use]
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Entries in teardown order.
    pub fn release_order(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().rev()
    }

    /// First handle of `kind`, if recorded.
    #[must_use]
    pub fn handle(&self, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.entries
            .iter()
            .map(|entry| &entry.handle)
            .find(|handle| handle.kind == kind)
    }

    /// Returns `true` when nothing was recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A teardown step that failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseFailure {
    /// Kind of the resource that could not be released.
    pub kind: ResourceKind,
    /// Error description.
    pub message: String,
}

/// Outcome of walking a ledger.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReleaseReport {
    /// Released resources, in the order they were released.
    pub released: Vec<ResourceKind>,
    /// Entries skipped because they were marked not needed.
    pub skipped: Vec<ResourceKind>,
    /// Teardown failures, in the order they occurred.
    pub failures: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    /// Number of failed teardown steps.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    /// Returns `true` when every attempted step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Appends the steps of `other`.
    pub fn merge(&mut self, other: Self) {
        self.released.extend(other.released);
        self.skipped.extend(other.skipped);
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for ReleaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} released, {} skipped, {} failed",
            self.released.len(),
            self.skipped.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.kind, failure.message)?;
        }
        Ok(())
    }
}
