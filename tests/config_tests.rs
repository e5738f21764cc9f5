//! Layered configuration loading through the environment.

use bivouac::config::{DEFAULT_STATE_DIR, LifecycleConfig};
use bivouac::lifecycle::OnExit;
use bivouac::test_support::EnvGuard;
use camino::Utf8PathBuf;
use tempfile::TempDir;

fn temp_home() -> (TempDir, String) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp home dir should be utf8: {}", path.display()));
    (tmp, home.into_string())
}

#[tokio::test]
async fn environment_overrides_lifecycle_defaults() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("BIVOUAC_ON_EXIT", "terminate"),
        ("BIVOUAC_SSH_PORT", "2222"),
        ("BIVOUAC_CONNECT_MAX_ATTEMPTS", "4"),
        ("BIVOUAC_ENV_FILTER", "AWS_.*,HF_TOKEN"),
    ])
    .await;

    let cfg = LifecycleConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(cfg.on_exit_policy(), OnExit::Terminate);
    assert_eq!(cfg.ssh_port, 2222);
    assert_eq!(cfg.retry_policy().max_attempts(), 4);
    assert_eq!(cfg.state_dir, DEFAULT_STATE_DIR);
    assert_eq!(cfg.env_filter, vec!["AWS_.*", "HF_TOKEN"]);
    assert!(cfg.validate().is_ok());
}

#[tokio::test]
async fn unknown_exit_policy_falls_back_to_stop() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("BIVOUAC_ON_EXIT", "explode"),
    ])
    .await;

    let cfg = LifecycleConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.on_exit_policy(), OnExit::Stop);
}

#[tokio::test]
async fn state_dir_expands_home() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&[("HOME", home.as_str())]).await;

    let cfg = LifecycleConfig::default();

    assert_eq!(cfg.state_dir(), Utf8PathBuf::from(home).join(".bivouac"));
}
