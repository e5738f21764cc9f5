//! Tests for remote command rendering and validation.

use super::super::*;
use rstest::rstest;

#[test]
fn wrap_in_directory_creates_and_enters_workspace() {
    let wrapped = wrap_in_directory("/root/my workspace", "cargo test && echo done");
    assert_eq!(
        wrapped,
        "mkdir -p '/root/my workspace' && cd '/root/my workspace' && bash -c 'cargo test && echo done'"
    );
}

#[test]
fn render_command_args_escapes_arguments() {
    let args = vec![
        String::from("echo"),
        String::from("a b"),
        String::from("c'd"),
    ];
    assert_eq!(render_command_args(&args), "echo 'a b' 'c'\\''d'");
}

#[rstest]
#[case::empty("")]
#[case::blank("   ")]
fn validate_remote_command_rejects_empty(#[case] command: &str) {
    assert!(matches!(
        validate_remote_command(command),
        Err(SyncError::InvalidCommand(_))
    ));
}

#[test]
fn validate_remote_command_rejects_oversized_commands() {
    let command = "x".repeat(MAX_COMMAND_LENGTH + 1);
    let err = validate_remote_command(&command).expect_err("oversized command should fail");
    assert!(err.to_string().contains("100000"), "unexpected message: {err}");
}

#[test]
fn validate_remote_command_accepts_limit() {
    let command = "x".repeat(MAX_COMMAND_LENGTH);
    assert!(validate_remote_command(&command).is_ok());
}

#[test]
fn validate_command_args_rejects_control_characters() {
    let err = validate_command_args(&[String::from("echo\tbad")])
        .expect_err("tab should be rejected");
    assert!(
        matches!(err, SyncError::InvalidCommand(ref message) if message.contains("control characters")),
        "unexpected error: {err}"
    );
}

#[test]
fn validate_command_args_accepts_safe_arguments() {
    assert!(validate_command_args(&[String::from("echo"), String::from("ok")]).is_ok());
}
