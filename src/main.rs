//! Binary entry point for the Bivouac CLI.

mod cli;

use std::collections::BTreeMap;
use std::error::Error as _;
use std::io::{self, IsTerminal, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bivouac::cancel::{CancellationFlag, Interrupt, SignalMonitor};
use bivouac::compute::{ComputeManager, ComputeSettings, DEFAULT_POLL_INTERVAL, InstanceHandle};
use bivouac::config::{ConfigError, LifecycleConfig, ScalewayConfig};
use bivouac::connect::{ConnectionEstablisher, ExitOutcome, SshConnector};
use bivouac::identity::{EnvironmentIdentity, sanitize};
use bivouac::lifecycle::{
    Components, DialoguerPrompt, EnvForwarder, EnvironmentInfo, LifecycleError, OnExit,
    Orchestrator, OrchestratorSettings, PortForward, PortForwardParseError, RunPlan, SessionExit,
    with_exports,
};
use bivouac::provisioner::{ProvisionSettings, Provisioner, SshKeygen};
use bivouac::scaleway::ScalewayBackend;
use bivouac::session::{SessionCache, SystemProcessProbe};
use bivouac::sync::{
    ProcessCommandRunner, SyncConfig, SyncError, Syncer, render_command_args,
    validate_command_args,
};

use cli::{Cli, Command, ExecCommand, ExitChoice, TargetCommand, UpCommand};

/// Exit code reported when a session ends by cancellation without a signal.
const CANCELLED_EXIT_CODE: i32 = 130;

type LiveOrchestrator = Orchestrator<
    ScalewayBackend,
    SshKeygen<ProcessCommandRunner>,
    SshConnector,
    ProcessCommandRunner,
>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("sync configuration error: {0}")]
    Sync(#[from] SyncError),
    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("{0}")]
    Port(#[from] PortForwardParseError),
    #[error("invalid env_filter pattern: {0}")]
    EnvFilter(#[from] regex::Error),
    #[error("working directory is not usable: {0}")]
    Workdir(String),
    #[error("teardown incomplete for {target}: {report}")]
    Teardown { target: String, report: String },
}

/// Configuration layers loaded for every subcommand.
struct Settings {
    scaleway: ScalewayConfig,
    lifecycle: LifecycleConfig,
    sync: SyncConfig,
}

impl Settings {
    fn load() -> Result<Self, CliError> {
        let scaleway = ScalewayConfig::load_without_cli_args()?;
        scaleway.validate()?;
        let lifecycle = LifecycleConfig::load_without_cli_args()?;
        lifecycle.validate()?;
        let sync = SyncConfig::load_without_cli_args()?;
        sync.validate()?;
        Ok(Self {
            scaleway,
            lifecycle,
            sync,
        })
    }

    fn orchestrator(
        &self,
        settings: OrchestratorSettings,
        cancel: CancellationFlag,
    ) -> Result<LiveOrchestrator, CliError> {
        let backend = ScalewayBackend::new(self.scaleway.clone())?;
        let state_dir = self.lifecycle.state_dir();
        let mut provision = ProvisionSettings::new(&state_dir);
        provision.ssh_port = self.lifecycle.ssh_port;
        provision.allowed_cidr.clone_from(&self.lifecycle.ssh_allowed_cidr);
        let compute = ComputeSettings {
            poll_interval: DEFAULT_POLL_INTERVAL,
            launch_timeout: self.lifecycle.launch_timeout(),
            terminate_timeout: self.lifecycle.terminate_timeout(),
        };
        let components = Components {
            provisioner: Provisioner::new(
                backend.clone(),
                SshKeygen::new(ProcessCommandRunner, "ssh-keygen"),
                provision,
            ),
            compute: ComputeManager::new(backend, compute),
            establisher: ConnectionEstablisher::new(
                SshConnector::new(self.sync.clone()),
                self.lifecycle.retry_policy(),
            ),
            sessions: SessionCache::new(&state_dir),
            syncer: Syncer::with_process_runner(self.sync.clone())?,
        };
        Ok(Orchestrator::new(components, settings, cancel))
    }

    fn orchestrator_settings(&self, on_exit: OnExit) -> OrchestratorSettings {
        OrchestratorSettings {
            launch: self.scaleway.launch_template(),
            ssh_user: self.sync.ssh_user.clone(),
            ssh_port: self.lifecycle.ssh_port,
            on_exit,
            remote_dir: self.sync.remote_path.clone(),
        }
    }

    /// Local variables selected by `env_filter`.
    fn forwarded_env(&self) -> Result<BTreeMap<String, String>, CliError> {
        let forwarder = EnvForwarder::new(&self.lifecycle.env_filter)?;
        Ok(forwarder.select(std::env::vars()))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cancel = CancellationFlag::new();
    let monitor = SignalMonitor::new(cancel.clone());
    if let Err(err) = monitor.spawn_listener() {
        warn!(error = %err, "failed to install signal handlers");
    }

    let outcome = dispatch(cli.command, cancel).await;
    let exit_code = match outcome {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, cli.debug);
            1
        }
    };
    process::exit(
        monitor
            .first_interrupt()
            .map_or(exit_code, Interrupt::exit_code),
    );
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

async fn dispatch(command: Command, cancel: CancellationFlag) -> Result<i32, CliError> {
    match command {
        Command::Up(args) => up(&args, cancel).await,
        Command::Exec(args) => exec(args, cancel).await,
        Command::Stop(args) => stop(&args.target, cancel).await,
        Command::Start(args) => start(&args.target, cancel).await,
        Command::Destroy(args) => destroy(args, cancel).await,
        Command::Info(args) => info(&args.target, cancel).await,
        Command::List => list(cancel).await,
    }
}

async fn up(args: &UpCommand, cancel: CancellationFlag) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let workdir = current_dir()?;
    let identity = args.name.as_deref().map_or_else(
        || EnvironmentIdentity::detect(&ProcessCommandRunner, &workdir),
        |name| EnvironmentIdentity::new(sanitize(name)),
    );
    let on_exit = args
        .on_exit
        .map_or_else(|| settings.lifecycle.on_exit_policy(), exit_policy);
    let plan = build_plan(args, &settings, workdir)?;

    let mut orchestrator_settings = settings.orchestrator_settings(on_exit);
    if let Some(instance_type) = &args.instance_type {
        orchestrator_settings.launch = orchestrator_settings.launch.instance_type(instance_type);
    }
    if let Some(image) = &args.image {
        orchestrator_settings.launch = orchestrator_settings.launch.image_label(image);
    }
    let mut orchestrator = settings.orchestrator(orchestrator_settings, cancel)?;
    let interactive = args.on_exit.is_none() && settings.lifecycle.prompt_on_exit;
    if args.prompt || (interactive && io::stdin().is_terminal()) {
        orchestrator = orchestrator.with_prompt(Box::new(DialoguerPrompt));
    }

    let report = orchestrator.up(identity, &plan).await?;
    if !report.release.is_clean() {
        writeln!(
            io::stderr(),
            "environment left {} with teardown errors: {}",
            report.on_exit,
            report.release
        )
        .ok();
    }
    Ok(match report.exit {
        SessionExit::Completed(code) => code,
        SessionExit::Cancelled => CANCELLED_EXIT_CODE,
    })
}

fn build_plan(
    args: &UpCommand,
    settings: &Settings,
    workdir: Utf8PathBuf,
) -> Result<RunPlan, CliError> {
    let ports = args
        .ports
        .iter()
        .map(|raw| raw.parse::<PortForward>())
        .collect::<Result<Vec<_>, _>>()?;
    let command = if args.command.is_empty() {
        None
    } else {
        validate_command_args(&args.command)?;
        Some(render_command_args(&args.command))
    };
    let lifecycle = &settings.lifecycle;
    Ok(RunPlan {
        sync_source: (lifecycle.sync_workspace && !args.no_sync).then_some(workdir),
        remote_dir: settings.sync.remote_path.clone(),
        setup_script: lifecycle.setup_script.clone(),
        ports,
        pre_command: lifecycle.pre_command.clone(),
        command,
        post_command: lifecycle.post_command.clone(),
        env: settings.forwarded_env()?,
    })
}

async fn exec(args: ExecCommand, cancel: CancellationFlag) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let settings = Settings::load()?;
    let command = with_exports(&render_command_args(&args.command), &settings.forwarded_env()?);
    let target = match args.name {
        Some(name) => name,
        None => EnvironmentIdentity::detect(&ProcessCommandRunner, &current_dir()?).name,
    };
    let mut orchestrator =
        settings.orchestrator(settings.orchestrator_settings(OnExit::KeepRunning), cancel)?;
    let outcome = orchestrator
        .exec(&target, &command, &SystemProcessProbe)
        .await?;
    Ok(match outcome {
        ExitOutcome::Exited(code) => code,
        ExitOutcome::Cancelled => CANCELLED_EXIT_CODE,
    })
}

async fn stop(target: &str, cancel: CancellationFlag) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let mut orchestrator =
        settings.orchestrator(settings.orchestrator_settings(OnExit::Stop), cancel)?;
    let instance = orchestrator.stop(target).await?;
    writeln!(io::stdout(), "stopped {} ({})", instance.name, instance.id).ok();
    Ok(0)
}

async fn start(target: &str, cancel: CancellationFlag) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let mut orchestrator =
        settings.orchestrator(settings.orchestrator_settings(OnExit::Stop), cancel)?;
    let instance = orchestrator.start(target).await?;
    writeln!(io::stdout(), "started {}", describe(&instance)).ok();
    Ok(0)
}

async fn destroy(args: TargetCommand, cancel: CancellationFlag) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let mut orchestrator =
        settings.orchestrator(settings.orchestrator_settings(OnExit::Terminate), cancel)?;
    let report = orchestrator.destroy(&args.target).await?;
    if !report.is_clean() {
        return Err(CliError::Teardown {
            target: args.target,
            report: report.to_string(),
        });
    }
    writeln!(io::stdout(), "destroyed {}: {report}", args.target).ok();
    Ok(0)
}

async fn info(target: &str, cancel: CancellationFlag) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let orchestrator =
        settings.orchestrator(settings.orchestrator_settings(OnExit::Stop), cancel)?;
    let details = orchestrator.info(target, &SystemProcessProbe).await?;
    let mut stdout = io::stdout().lock();
    for line in info_lines(&details) {
        writeln!(stdout, "{line}").ok();
    }
    Ok(0)
}

fn info_lines(details: &EnvironmentInfo) -> Vec<String> {
    let instance = &details.instance;
    let field = |label: &str, value: &str| format!("{label:<12} {value}");
    let address = instance
        .public_ip
        .map_or_else(|| String::from("-"), |ip| ip.to_string());
    let key_file = details
        .key_file
        .as_ref()
        .map_or_else(|| String::from("missing"), ToString::to_string);
    let session = details.session.as_ref().map_or_else(
        || String::from("none"),
        |record| format!("pid {} at {}@{}:{}", record.pid, record.user, record.host, record.port),
    );
    vec![
        field("Name:", &instance.name),
        field("Instance ID:", &instance.id),
        field("State:", instance.state.label()),
        field("Zone:", &instance.zone),
        field("Address:", &address),
        field("Token:", instance.token().unwrap_or("-")),
        field("Key file:", &key_file),
        field("Session:", &session),
    ]
}

async fn list(cancel: CancellationFlag) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let orchestrator =
        settings.orchestrator(settings.orchestrator_settings(OnExit::Stop), cancel)?;
    let instances = orchestrator.list().await?;
    let mut stdout = io::stdout().lock();
    if instances.is_empty() {
        writeln!(stdout, "no environments").ok();
    }
    for instance in &instances {
        writeln!(stdout, "{}", describe(instance)).ok();
    }
    Ok(0)
}

fn describe(instance: &InstanceHandle) -> String {
    let address = instance
        .public_ip
        .map_or_else(|| String::from("-"), |ip| ip.to_string());
    format!(
        "{:<40} {:<36} {:<10} {address}",
        instance.name,
        instance.id,
        instance.state.label()
    )
}

const fn exit_policy(choice: ExitChoice) -> OnExit {
    match choice {
        ExitChoice::Stop => OnExit::Stop,
        ExitChoice::Terminate => OnExit::Terminate,
        ExitChoice::KeepRunning => OnExit::KeepRunning,
    }
}

fn current_dir() -> Result<Utf8PathBuf, CliError> {
    let cwd = std::env::current_dir().map_err(|err| CliError::Workdir(err.to_string()))?;
    Utf8PathBuf::from_path_buf(cwd).map_err(|path| CliError::Workdir(path.display().to_string()))
}

fn report_error(err: &CliError, debug: bool) {
    write_error(io::stderr(), err, debug);
}

fn write_error(mut target: impl Write, err: &CliError, debug: bool) {
    writeln!(target, "error: {err}").ok();
    if !debug {
        return;
    }
    let mut cause = err.source();
    while let Some(current) = cause {
        writeln!(target, "  caused by: {current}").ok();
        cause = current.source();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ExitChoice::Stop, OnExit::Stop)]
    #[case(ExitChoice::Terminate, OnExit::Terminate)]
    #[case(ExitChoice::KeepRunning, OnExit::KeepRunning)]
    fn exit_choices_map_to_policies(#[case] choice: ExitChoice, #[case] expected: OnExit) {
        assert_eq!(exit_policy(choice), expected);
    }

    #[test]
    fn up_accepts_trailing_command_and_ports() {
        let cli = Cli::try_parse_from([
            "bivouac", "up", "-p", "8080", "--port", "5433:5432", "--", "cargo", "test",
        ])
        .unwrap_or_else(|err| panic!("parse: {err}"));

        let Command::Up(args) = cli.command else {
            panic!("expected the up subcommand");
        };
        assert_eq!(args.ports, vec!["8080", "5433:5432"]);
        assert_eq!(args.command, vec!["cargo", "test"]);
        assert!(!args.no_sync);
    }

    #[test]
    fn prompt_conflicts_with_explicit_policy() {
        let result = Cli::try_parse_from(["bivouac", "up", "--prompt", "--on-exit", "stop"]);

        assert!(result.is_err(), "expected a usage error");
    }

    #[test]
    fn on_exit_accepts_kebab_case() {
        let cli = Cli::try_parse_from(["bivouac", "up", "--on-exit", "keep-running"])
            .unwrap_or_else(|err| panic!("parse: {err}"));

        let Command::Up(args) = cli.command else {
            panic!("expected the up subcommand");
        };
        assert_eq!(args.on_exit, Some(ExitChoice::KeepRunning));
    }

    #[test]
    fn write_error_hides_causes_without_debug() {
        let err = CliError::Sync(SyncError::InvalidCommand(String::from("empty")));
        let mut buf = Vec::new();

        write_error(&mut buf, &err, false);

        let rendered =
            String::from_utf8(buf).unwrap_or_else(|utf8| panic!("utf8: {utf8}"));
        assert_eq!(rendered.lines().count(), 1, "rendered: {rendered}");
        assert!(rendered.starts_with("error: sync configuration error"));
    }

    #[test]
    fn info_reports_missing_key_and_no_session() {
        let details = EnvironmentInfo {
            instance: InstanceHandle {
                id: String::from("i-1"),
                name: String::from("bivouac-app-main"),
                zone: String::from("fr-par-1"),
                state: bivouac::backend::InstanceState::Running,
                public_ip: Some(std::net::IpAddr::from([192, 0, 2, 10])),
                tags: vec![String::from("bivouac-token=abcd1234")],
            },
            key_file: None,
            session: None,
        };

        let lines = info_lines(&details);

        assert!(lines.contains(&String::from("Instance ID: i-1")), "{lines:?}");
        assert!(lines.contains(&String::from("Address:     192.0.2.10")), "{lines:?}");
        assert!(lines.contains(&String::from("Token:       abcd1234")), "{lines:?}");
        assert!(lines.contains(&String::from("Key file:    missing")), "{lines:?}");
        assert!(lines.contains(&String::from("Session:     none")), "{lines:?}");
    }

    #[test]
    fn info_subcommand_takes_a_target() {
        let cli = Cli::try_parse_from(["bivouac", "info", "i-1"])
            .unwrap_or_else(|err| panic!("parse: {err}"));

        let Command::Info(args) = cli.command else {
            panic!("expected the info subcommand");
        };
        assert_eq!(args.target, "i-1");
    }

    #[test]
    fn describe_shows_placeholder_without_address() {
        let instance = InstanceHandle {
            id: String::from("i-1"),
            name: String::from("bivouac-app-main"),
            zone: String::from("fr-par-1"),
            state: bivouac::backend::InstanceState::Stopped,
            public_ip: None,
            tags: Vec::new(),
        };

        let line = describe(&instance);

        assert!(line.starts_with("bivouac-app-main"), "{line}");
        assert!(line.ends_with(" -"), "{line}");
    }
}
