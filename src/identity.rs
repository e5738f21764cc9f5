//! Environment naming.
//!
//! An environment is named after the project and branch it was started from,
//! so repeated runs in the same checkout find the same instance. Each run
//! also draws a short token that links the credential, policy, and instance
//! created together.

use std::ffi::OsString;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use uuid::Uuid;

use crate::backend::{MANAGED_BY_TAG, TOKEN_TAG_PREFIX};
use crate::sync::CommandRunner;

/// Prefix of every derived environment name.
pub const NAME_PREFIX: &str = "bivouac";

/// Longest name accepted by the provider's naming rules.
pub const MAX_NAME_LENGTH: usize = 63;

const TOKEN_LENGTH: usize = 8;

/// Name and token of one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentIdentity {
    /// Stable environment name, shared with the instance.
    pub name: String,
    /// Short random token linking resources created together.
    pub token: String,
}

impl EnvironmentIdentity {
    /// Builds an identity with a fresh token.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: new_token(),
        }
    }

    /// Builds an identity with a known token, for adopting existing resources.
    #[must_use]
    pub fn with_token(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
        }
    }

    /// Derives the identity for the checkout at `workdir`.
    ///
    /// Uses the `origin` remote's repository name, falling back to the
    /// directory name, plus the current branch when one is checked out.
    #[must_use]
    pub fn detect(runner: &impl CommandRunner, workdir: &Utf8Path) -> Self {
        let project = git_output(runner, workdir, &["config", "--get", "remote.origin.url"])
            .and_then(|url| repository_name(&url))
            .or_else(|| workdir.file_name().map(str::to_owned));
        let branch = git_output(runner, workdir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .filter(|branch| branch != "HEAD");
        Self::new(derive_name(project.as_deref(), branch.as_deref()))
    }

    /// Name of the credential and policy, `<name>-<token>`.
    #[must_use]
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.name, self.token)
    }

    /// Tags applied to every resource of this environment.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        vec![
            MANAGED_BY_TAG.to_owned(),
            format!("{TOKEN_TAG_PREFIX}{}", self.token),
        ]
    }
}

/// Draws an eight character lowercase hexadecimal token.
#[must_use]
pub fn new_token() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(TOKEN_LENGTH)
        .collect()
}

fn git_output(runner: &impl CommandRunner, workdir: &Utf8Path, args: &[&str]) -> Option<String> {
    let mut argv = vec![OsString::from("-C"), OsString::from(workdir.as_str())];
    argv.extend(args.iter().map(OsString::from));
    let output = runner.run("git", &argv).ok()?;
    if !output.is_success() {
        return None;
    }
    let value = output.stdout.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

fn repository_name(url: &str) -> Option<String> {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()?
        .trim_end_matches(".git");
    (!last.is_empty()).then(|| last.to_owned())
}

/// Lowercases `raw`, maps every character outside `[a-z0-9-]` to `-`, and
/// collapses runs of dashes.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_lowercase) {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            '-'
        };
        if mapped == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(mapped);
    }
    out.trim_end_matches('-').to_owned()
}

/// Builds `bivouac-<project>-<branch>`, or `bivouac-<unix seconds>` when no
/// project can be determined.
#[must_use]
pub fn derive_name(project: Option<&str>, branch: Option<&str>) -> String {
    let parts: Vec<String> = [project, branch]
        .into_iter()
        .flatten()
        .map(sanitize)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        return format!("{NAME_PREFIX}-{seconds}");
    }
    let joined = format!("{NAME_PREFIX}-{}", parts.join("-"));
    let truncated: String = joined.chars().take(MAX_NAME_LENGTH).collect();
    truncated.trim_end_matches('-').to_owned()
}
