//! Unit tests for the connection establisher.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::*;
use crate::test_support::ScriptedConnector;

#[fixture]
fn target() -> ConnectTarget {
    ConnectTarget {
        host: String::from("192.0.2.10"),
        port: 22,
        user: String::from("root"),
        key_file: Utf8PathBuf::from("/state/keys/abcd1234"),
    }
}

fn offsets(history: &[ConnectAttempt]) -> Vec<u64> {
    history
        .iter()
        .map(|attempt| attempt.started_after.as_secs())
        .collect()
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn succeeds_on_fourth_attempt_after_doubling_delays(target: ConnectTarget) {
    let connector = ScriptedConnector::new();
    connector.fail_probes(3);
    let mut establisher = ConnectionEstablisher::new(connector.clone(), RetryPolicy::default());

    let channel = establisher
        .connect(&target, &CancellationFlag::new())
        .await
        .unwrap_or_else(|err| panic!("connect should succeed: {err}"));

    assert_eq!(channel.target(), &target);
    assert_eq!(offsets(establisher.history()), vec![0, 1, 3, 7]);
    assert_eq!(
        establisher.history().last().map(|attempt| &attempt.outcome),
        Some(&ProbeOutcome::Reachable)
    );
    assert_eq!(connector.probe_times().len(), 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejection_fails_after_single_probe(target: ConnectTarget) {
    let connector = ScriptedConnector::new();
    connector.push_probe(ProbeOutcome::Rejected(String::from("Permission denied (publickey).")));
    let mut establisher = ConnectionEstablisher::new(connector.clone(), RetryPolicy::default());
    let started = Instant::now();

    let Err(err) = establisher.connect(&target, &CancellationFlag::new()).await else {
        panic!("rejection should fail");
    };

    assert!(matches!(err, ConnectError::Rejected { ref reason, .. } if reason.contains("Permission denied")));
    assert_eq!(connector.probe_times().len(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn exhaustion_reports_attempt_count(target: ConnectTarget) {
    let connector = ScriptedConnector::new();
    connector.fail_probes(5);
    let policy = RetryPolicy::default().with_max_attempts(4);
    let mut establisher = ConnectionEstablisher::new(connector.clone(), policy);

    let Err(err) = establisher.connect(&target, &CancellationFlag::new()).await else {
        panic!("four unreachable probes should exhaust the budget");
    };

    assert_eq!(
        err,
        ConnectError::Exhausted {
            target: String::from("root@192.0.2.10:22"),
            attempts: 4,
            last_reason: String::from("connection refused (4)"),
        }
    );
    assert!(err.to_string().contains("after 4 attempts"));
    assert_eq!(connector.probe_times().len(), 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn elapsed_ceiling_stops_before_attempt_budget(target: ConnectTarget) {
    let connector = ScriptedConnector::new();
    connector.fail_probes(10);
    let policy = RetryPolicy::default().with_max_elapsed(Duration::from_secs(10));
    let mut establisher = ConnectionEstablisher::new(connector, policy);
    let started = Instant::now();

    let Err(err) = establisher.connect(&target, &CancellationFlag::new()).await else {
        panic!("elapsed ceiling should stop the loop");
    };

    // Probes at 0, 1, 3 and 7; the next delay (8s) would cross 10s.
    assert!(matches!(err, ConnectError::Exhausted { attempts: 4, .. }));
    assert_eq!(offsets(establisher.history()), vec![0, 1, 3, 7]);
    assert!(started.elapsed() <= Duration::from_secs(10));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_retrying(target: ConnectTarget) {
    let connector = ScriptedConnector::new();
    connector.fail_probes(10);
    let cancel = CancellationFlag::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });
    let mut establisher = ConnectionEstablisher::new(connector.clone(), RetryPolicy::default());

    let result = establisher.connect(&target, &cancel).await;

    assert!(matches!(result, Err(ConnectError::Cancelled)));
    assert_eq!(connector.probe_times().len(), 2);
}

#[rstest]
#[tokio::test]
async fn cancelled_flag_prevents_first_probe(target: ConnectTarget) {
    let connector = ScriptedConnector::new();
    let cancel = CancellationFlag::new();
    cancel.cancel();
    let mut establisher = ConnectionEstablisher::new(connector.clone(), RetryPolicy::default());

    let result = establisher.connect(&target, &cancel).await;

    assert!(matches!(result, Err(ConnectError::Cancelled)));
    assert!(connector.probe_times().is_empty());
}

#[rstest]
#[case::local_zero(0, 8080)]
#[case::remote_zero(8080, 0)]
fn tunnel_ports_must_be_non_zero(#[case] local: u16, #[case] remote: u16) {
    assert!(matches!(
        validate_tunnel_ports(local, remote),
        Err(ConnectError::InvalidTunnel { .. })
    ));
}
