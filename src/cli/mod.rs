//! Command-line interface definitions for the `bivouac` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. It
//! must only depend on `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `bivouac` binary.
#[derive(Debug, Parser)]
#[command(
    name = "bivouac",
    about = "Ephemeral remote development environments on Scaleway",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Enable debug logging, including error source chains.
    #[arg(long, global = true)]
    pub(crate) debug: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `bivouac`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Acquire an environment, connect, and run a command or hold a session.
    #[command(name = "up")]
    Up(UpCommand),
    /// Run a command in an existing environment.
    #[command(name = "exec")]
    Exec(ExecCommand),
    /// Power off an environment, keeping its disk and resources.
    #[command(name = "stop")]
    Stop(TargetCommand),
    /// Power on a stopped environment.
    #[command(name = "start")]
    Start(TargetCommand),
    /// Delete an environment and everything created with it.
    #[command(name = "destroy")]
    Destroy(TargetCommand),
    /// Show an environment's instance, key file, and live session.
    #[command(name = "info")]
    Info(TargetCommand),
    /// List managed environments.
    #[command(name = "list")]
    List,
}

/// Exit behaviour chosen on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum ExitChoice {
    /// Power off; keep disk, credential, and firewall.
    Stop,
    /// Delete everything.
    Terminate,
    /// Leave the instance running.
    KeepRunning,
}

/// Arguments for `bivouac up`.
#[derive(Debug, Args)]
pub(crate) struct UpCommand {
    /// Environment name; derived from the repository and branch by default.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Override the Scaleway instance type (commercial type).
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the image label.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// What happens to the environment when the session ends.
    #[arg(long, value_enum, value_name = "POLICY")]
    pub(crate) on_exit: Option<ExitChoice>,
    /// Ask for the exit behaviour when the session ends.
    #[arg(long, conflicts_with = "on_exit")]
    pub(crate) prompt: bool,
    /// Forward a local port, as `PORT` or `LOCAL:REMOTE`. Repeatable.
    #[arg(short = 'p', long = "port", value_name = "LOCAL:REMOTE")]
    pub(crate) ports: Vec<String>,
    /// Skip syncing the working tree.
    #[arg(long)]
    pub(crate) no_sync: bool,
    /// Command to execute remotely (use -- to separate flags); omit to hold
    /// the session open until interrupted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `bivouac exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Environment name or instance id; derived from the checkout by default.
    #[arg(long, value_name = "NAME_OR_ID")]
    pub(crate) name: Option<String>,
    /// Command to execute remotely (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments naming one environment.
#[derive(Debug, Args)]
pub(crate) struct TargetCommand {
    /// Environment name or instance id.
    #[arg(value_name = "NAME_OR_ID")]
    pub(crate) target: String,
}
