//! End-to-end lifecycle scenarios against scripted provider and transport.

#[path = "common/harness.rs"]
mod common;

use std::time::Duration;

use bivouac::backend::{BackendError, BackendErrorKind, InstanceState};
use bivouac::connect::{ConnectError, ConnectionEstablisher, ConnectTarget, ExitOutcome, RetryPolicy};
use bivouac::identity::EnvironmentIdentity;
use bivouac::ledger::ResourceKind;
use bivouac::lifecycle::{LifecycleError, OnExit, RunPlan, SessionExit};
use bivouac::session::ConnectionRecord;
use bivouac::sync::{DEFAULT_REMOTE_PATH, wrap_in_directory};
use bivouac::test_support::{SCRIPTED_PUBLIC_IP, ScriptedConnector, StaticProcessProbe};
use camino::Utf8PathBuf;
use rstest::rstest;
use tokio::time::Instant;

use common::{Harness, NAME, TOKEN, command, harness, identity, instance};

fn offsets(times: &[Instant]) -> Vec<u64> {
    let Some(first) = times.first().copied() else {
        return Vec::new();
    };
    times
        .iter()
        .map(|at| at.duration_since(first).as_secs())
        .collect()
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stopped_environment_is_resumed_not_recreated(harness: Harness) {
    let mut first = harness.orchestrator(OnExit::Stop);
    first
        .up(identity(), &command("cargo build"))
        .await
        .unwrap_or_else(|err| panic!("first up: {err}"));

    let mut second = harness.orchestrator(OnExit::Stop);
    let report = second
        .up(EnvironmentIdentity::new(NAME), &command("cargo test"))
        .await
        .unwrap_or_else(|err| panic!("second up: {err}"));

    assert_eq!(report.exit, SessionExit::Completed(0));
    assert_eq!(harness.env.backend.calls_to("create_ssh_key").len(), 1);
    assert_eq!(harness.env.backend.calls_to("create_security_group").len(), 1);
    assert_eq!(harness.env.backend.calls_to("create_instance").len(), 1);
    assert_eq!(harness.env.backend.calls_to("power_on").len(), 2);
    let instances = harness.env.backend.instances();
    assert_eq!(instances.len(), 1);
    assert!(
        instances
            .iter()
            .all(|snapshot| snapshot.state == InstanceState::Stopped),
        "both sessions leave the instance stopped"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_runs_instance_then_policy_then_credential(harness: Harness) {
    let mut orchestrator = harness.orchestrator(OnExit::Terminate);

    let report = orchestrator
        .up(identity(), &command("true"))
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));

    assert_eq!(
        report.release.released,
        vec![ResourceKind::Instance, ResourceKind::Policy, ResourceKind::Credential]
    );
    let calls = harness.env.backend.mutating_calls();
    let position = |prefix: &str| {
        calls
            .iter()
            .position(|call| call.starts_with(prefix))
            .unwrap_or_else(|| panic!("no {prefix} call in {calls:?}"))
    };
    assert!(position("terminate") < position("delete_security_group"));
    assert!(position("delete_security_group") < position("delete_ssh_key"));
    assert!(harness.env.backend.ssh_keys().is_empty());
    assert!(harness.env.backend.security_groups().is_empty());
    assert!(!harness.env.key_path(TOKEN).exists());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_launch_rolls_back_everything_created(harness: Harness) {
    harness.env.backend.fail_once(
        "create_instance",
        BackendError::new(BackendErrorKind::Rejected, "quota exceeded"),
    );
    let mut orchestrator = harness.orchestrator(OnExit::Stop);

    let Err(LifecycleError::Acquire { rollback, .. }) =
        orchestrator.up(identity(), &command("true")).await
    else {
        panic!("a rejected launch must fail acquisition");
    };

    assert_eq!(
        rollback.released,
        vec![ResourceKind::Policy, ResourceKind::Credential]
    );
    assert!(rollback.is_clean());
    assert!(harness.env.backend.ssh_keys().is_empty());
    assert!(harness.env.backend.security_groups().is_empty());
    assert!(harness.env.backend.instances().is_empty());
    assert!(!harness.env.key_path(TOKEN).exists());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_continues_past_a_failing_step(harness: Harness) {
    harness.env.backend.fail_always(
        "delete_security_group",
        BackendError::new(BackendErrorKind::Conflict, "group in use"),
    );
    let mut orchestrator = harness.orchestrator(OnExit::Terminate);

    let report = orchestrator
        .up(identity(), &command("true"))
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));

    assert_eq!(report.release.error_count(), 1);
    assert!(
        report
            .release
            .failures
            .iter()
            .all(|failure| failure.kind == ResourceKind::Policy),
        "{:?}",
        report.release.failures
    );
    assert_eq!(
        report.release.released,
        vec![ResourceKind::Instance, ResourceKind::Credential]
    );
    assert!(harness.env.backend.ssh_keys().is_empty());
    assert_eq!(harness.env.backend.security_groups().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_boot_connects_on_fourth_probe_and_records_session(harness: Harness) {
    harness.env.connector.fail_probes(3);
    let mut orchestrator = harness.orchestrator(OnExit::Stop);
    let sessions = harness.env.sessions();
    let cancel = harness.env.cancel.clone();
    let hold = RunPlan::default();

    let (outcome, record) = tokio::join!(orchestrator.up(identity(), &hold), async {
        tokio::time::sleep(Duration::from_secs(90)).await;
        let record = sessions.read(NAME);
        cancel.cancel();
        record
    });

    let report = outcome.unwrap_or_else(|err| panic!("up: {err}"));
    assert_eq!(report.exit, SessionExit::Cancelled);
    assert_eq!(offsets(&harness.env.connector.probe_times()), vec![0, 1, 3, 7]);
    let Some(record) = record else {
        panic!("a connected session must be recorded");
    };
    assert_eq!(record.pid, std::process::id());
    assert_eq!(record.host, SCRIPTED_PUBLIC_IP.to_string());
    assert_eq!(record.key_file, harness.env.key_path(TOKEN));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn second_process_reuses_live_session(harness: Harness) {
    let mut holder = harness.orchestrator(OnExit::Stop);
    let mut client = harness.orchestrator(OnExit::Stop);
    let cancel = harness.env.cancel.clone();
    let probe = StaticProcessProbe::alive(&[std::process::id()]);
    let hold = RunPlan::default();

    let (held, exec) = tokio::join!(holder.up(identity(), &hold), async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let outcome = client.exec(NAME, "git status", &probe).await;
        cancel.cancel();
        outcome
    });

    held.unwrap_or_else(|err| panic!("up: {err}"));
    let outcome = exec.unwrap_or_else(|err| panic!("exec: {err}"));
    assert_eq!(outcome, ExitOutcome::Exited(0));
    assert_eq!(harness.env.connector.probe_times().len(), 1);
    assert_eq!(
        harness.env.connector.executed(),
        vec![wrap_in_directory(DEFAULT_REMOTE_PATH, "git status")]
    );
}

#[rstest]
fn stale_session_record_is_discarded(harness: Harness) {
    let sessions = harness.env.sessions();
    let record = ConnectionRecord {
        name: NAME.to_owned(),
        pid: 4242,
        instance_id: String::from("i-1"),
        zone: String::from("fr-par-1"),
        host: SCRIPTED_PUBLIC_IP.to_string(),
        port: 22,
        user: String::from("root"),
        key_file: Utf8PathBuf::from("/tmp/key"),
    };
    sessions
        .write(&record)
        .unwrap_or_else(|err| panic!("write: {err}"));

    assert!(sessions.is_alive(NAME, &StaticProcessProbe::alive(&[4242])));
    assert!(!sessions.is_alive(NAME, &StaticProcessProbe::alive(&[])));
    assert!(sessions.read(NAME).is_none(), "stale record is removed");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn retry_schedule_is_deterministic() {
    let connector = ScriptedConnector::new();
    connector.fail_probes(20);
    let mut establisher = ConnectionEstablisher::new(connector.clone(), RetryPolicy::default());
    let target = ConnectTarget {
        host: SCRIPTED_PUBLIC_IP.to_string(),
        port: 22,
        user: String::from("root"),
        key_file: Utf8PathBuf::from("/tmp/key"),
    };

    let Err(err) = establisher
        .connect(&target, &bivouac::cancel::CancellationFlag::new())
        .await
    else {
        panic!("every probe fails");
    };

    assert!(matches!(err, ConnectError::Exhausted { attempts: 8, .. }), "{err}");
    assert_eq!(
        offsets(&connector.probe_times()),
        vec![0, 1, 3, 7, 15, 31, 61, 91]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn running_environment_is_not_adopted(harness: Harness) {
    harness
        .env
        .backend
        .seed_instance(instance("i-9", InstanceState::Running));
    let mut orchestrator = harness.orchestrator(OnExit::Terminate);

    let result = orchestrator.up(identity(), &command("true")).await;

    assert!(
        matches!(result, Err(LifecycleError::Acquire { .. })),
        "{result:?}"
    );
    assert_eq!(harness.env.backend.instances().len(), 1);
    assert!(harness.env.backend.mutating_calls().is_empty());
}
