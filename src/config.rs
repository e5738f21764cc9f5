//! Configuration loading via `ortho-config`.
//!
//! Two layers are loaded independently: [`ScalewayConfig`] carries provider
//! credentials and instance defaults under the `SCW_` prefix, and
//! [`LifecycleConfig`] carries orchestration knobs under `BIVOUAC_`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::{BackendError, LaunchSpecBuilder};
use crate::connect::RetryPolicy;
use crate::lifecycle::{EnvForwarder, OnExit};

/// Default directory holding keys and session records.
pub const DEFAULT_STATE_DIR: &str = "~/.bivouac";

/// Scaleway specific configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not used for API
    /// calls; accepted so a shared `scw` profile loads cleanly.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new instances.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Orchestration settings shared by every subcommand.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BIVOUAC",
    discovery(
        app_name = "bivouac",
        env_var = "BIVOUAC_CONFIG_PATH",
        config_file_name = "bivouac.toml",
        dotfile_name = ".bivouac.toml",
        project_file_name = "bivouac.toml"
    )
)]
pub struct LifecycleConfig {
    /// Directory holding private keys and session records.
    #[ortho_config(default = DEFAULT_STATE_DIR.to_owned())]
    pub state_dir: String,
    /// What happens to the instance when a session ends: `stop`,
    /// `terminate`, or `keep-running`.
    #[ortho_config(default = "stop".to_owned())]
    pub on_exit: String,
    /// Ask interactively for the exit behaviour when attached to a terminal.
    #[ortho_config(default = false)]
    pub prompt_on_exit: bool,
    /// Source range allowed to reach the SSH port.
    #[ortho_config(default = "0.0.0.0/0".to_owned())]
    pub ssh_allowed_cidr: String,
    /// Port the control channel listens on.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Maximum connection attempts before giving up.
    #[ortho_config(default = 10)]
    pub connect_max_attempts: u32,
    /// Elapsed-time ceiling for connection attempts, in seconds.
    #[ortho_config(default = 120)]
    pub connect_max_elapsed_secs: u64,
    /// How long to wait for a new instance to run, in seconds.
    #[ortho_config(default = 300)]
    pub launch_timeout_secs: u64,
    /// How long to wait for an instance to disappear, in seconds.
    #[ortho_config(default = 600)]
    pub terminate_timeout_secs: u64,
    /// Script run on the instance once after connecting.
    pub setup_script: Option<String>,
    /// Command run before the main command.
    pub pre_command: Option<String>,
    /// Command run after the main command.
    pub post_command: Option<String>,
    /// Whether to rsync the working tree before running commands.
    #[ortho_config(default = true)]
    pub sync_workspace: bool,
    /// Patterns selecting local environment variables exported to remote
    /// commands. Each is a regular expression matched from the start of the
    /// variable name; `BIVOUAC_ENV_FILTER` takes a comma-separated list.
    #[serde(default)]
    #[ortho_config(default = vec![], merge_strategy = "append")]
    pub env_filter: Vec<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in bivouac.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("bivouac")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns a launch builder seeded with the configured instance defaults.
    ///
    /// Name, security group, and tags are filled in per environment.
    #[must_use]
    pub fn launch_template(&self) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new()
            .instance_type(&self.default_instance_type)
            .image_label(&self.default_image)
            .architecture(&self.default_architecture)
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )
    }
}

impl LifecycleConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("bivouac")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates values that have no safe fallback.
    ///
    /// An unrecognised `on_exit` is not an error; it resolves to `stop` in
    /// [`LifecycleConfig::on_exit_policy`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty required strings and
    /// [`ConfigError::Invalid`] for out-of-range numbers or `env_filter`
    /// patterns that do not compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.state_dir,
            &FieldMetadata::new(
                "state directory",
                "BIVOUAC_STATE_DIR",
                "state_dir",
                "bivouac",
            ),
        )?;
        require_field(
            &self.ssh_allowed_cidr,
            &FieldMetadata::new(
                "SSH source range",
                "BIVOUAC_SSH_ALLOWED_CIDR",
                "ssh_allowed_cidr",
                "bivouac",
            ),
        )?;
        if self.ssh_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "ssh_port must be between 1 and 65535",
            )));
        }
        if self.connect_max_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "connect_max_attempts must be at least 1",
            )));
        }
        EnvForwarder::new(&self.env_filter)
            .map_err(|err| ConfigError::Invalid(format!("env_filter: {err}")))?;
        Ok(())
    }

    /// Resolves the state directory against `$HOME` when it starts with `~`.
    #[must_use]
    pub fn state_dir(&self) -> Utf8PathBuf {
        resolve_home(&self.state_dir, std::env::var("HOME").ok().as_deref())
    }

    /// Parses `on_exit`, falling back to [`OnExit::Stop`].
    #[must_use]
    pub fn on_exit_policy(&self) -> OnExit {
        OnExit::parse_or_stop(&self.on_exit)
    }

    /// Retry policy for the connection establisher.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.connect_max_attempts)
            .with_max_elapsed(Duration::from_secs(self.connect_max_elapsed_secs))
    }

    /// Bounded wait for a launched instance to reach `running`.
    #[must_use]
    pub const fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    /// Bounded wait for a terminated instance to disappear.
    #[must_use]
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.to_owned(),
            on_exit: String::from("stop"),
            prompt_on_exit: false,
            ssh_allowed_cidr: String::from("0.0.0.0/0"),
            ssh_port: 22,
            connect_max_attempts: 10,
            connect_max_elapsed_secs: 120,
            launch_timeout_secs: 300,
            terminate_timeout_secs: 600,
            setup_script: None,
            pre_command: None,
            post_command: None,
            sync_workspace: true,
            env_filter: Vec::new(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<BackendError> for ConfigError {
    fn from(value: BackendError) -> Self {
        Self::Invalid(value.message)
    }
}

/// Replaces a leading `~` with `home`; other paths, and `~user` forms, pass
/// through untouched.
fn resolve_home(raw: &str, home: Option<&str>) -> Utf8PathBuf {
    let Some(home) = home else {
        return Utf8PathBuf::from(raw);
    };
    match raw.strip_prefix('~') {
        Some("") => Utf8PathBuf::from(home),
        Some(rest) => rest.strip_prefix('/').map_or_else(
            || Utf8PathBuf::from(raw),
            |relative| Utf8PathBuf::from(home).join(relative),
        ),
        None => Utf8PathBuf::from(raw),
    }
}
