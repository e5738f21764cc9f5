//! Sync configuration validation and SSH option construction tests.

use super::super::*;
use rstest::rstest;

use super::fixtures::{base_config, target};

/// Helper to assert validation rejects empty or whitespace values for a given field.
fn assert_validation_rejects_field<F>(mut cfg: SyncConfig, field_name: &str, set_field: F)
where
    F: Fn(&mut SyncConfig, String),
{
    for invalid in ["", "  "] {
        set_field(&mut cfg, invalid.to_owned());
        let Err(err) = cfg.validate() else {
            panic!("{field_name} '{invalid}' should fail");
        };
        let SyncError::InvalidConfig { ref field } = err else {
            panic!("expected InvalidConfig for {field_name}, got {err:?}");
        };
        assert_eq!(field, field_name, "expected invalid field {field_name}");
    }
}

#[rstest]
fn sync_config_validate_accepts_defaults(base_config: SyncConfig) {
    assert!(base_config.validate().is_ok());
}

#[rstest]
fn sync_config_validation_rejects_rsync_bin(base_config: SyncConfig) {
    assert_validation_rejects_field(base_config, "rsync_bin", |cfg, val| cfg.rsync_bin = val);
}

#[rstest]
fn sync_config_validation_rejects_ssh_user(base_config: SyncConfig) {
    assert_validation_rejects_field(base_config, "ssh_user", |cfg, val| cfg.ssh_user = val);
}

#[rstest]
fn sync_config_validation_rejects_remote_path(base_config: SyncConfig) {
    assert_validation_rejects_field(base_config, "remote_path", |cfg, val| cfg.remote_path = val);
}

#[rstest]
fn invalid_config_error_names_env_var(base_config: SyncConfig) {
    let cfg = SyncConfig {
        ssh_bin: String::new(),
        ..base_config
    };
    let err = cfg.validate().expect_err("empty ssh_bin should fail");
    assert!(
        err.to_string().contains("BIVOUAC_SYNC_SSH_BIN"),
        "unexpected message: {err}"
    );
}

#[rstest]
fn ssh_options_use_environment_key_and_batch_mode(base_config: SyncConfig) {
    let rendered = base_config
        .ssh_options(2222, Utf8Path::new("/state/keys/abcd1234"))
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    for fragment in [
        "-p 2222",
        "-i /state/keys/abcd1234",
        "BatchMode=yes",
        "ConnectTimeout=10",
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
    ] {
        assert!(rendered.contains(fragment), "missing {fragment}: {rendered}");
    }
}

#[rstest]
fn ssh_options_respect_strict_host_checking(base_config: SyncConfig) {
    let cfg = SyncConfig {
        ssh_strict_host_key_checking: true,
        ssh_known_hosts_file: String::new(),
        ..base_config
    };
    let rendered = cfg
        .ssh_options(22, Utf8Path::new("/k"))
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert!(!rendered.iter().any(|arg| arg.starts_with("StrictHostKeyChecking")));
    assert!(!rendered.iter().any(|arg| arg.starts_with("UserKnownHostsFile")));
}

#[rstest]
fn remote_destination_uses_target_coordinates(base_config: SyncConfig, target: ConnectTarget) {
    let destination = base_config.remote_destination(&target);
    assert_eq!(
        destination,
        SyncDestination::Remote {
            user: String::from("root"),
            host: String::from("127.0.0.1"),
            port: 2222,
            identity: Utf8PathBuf::from("/state/keys/abcd1234"),
            path: Utf8PathBuf::from("/remote/path"),
        }
    );
}

#[rstest]
fn blank_exclude_entry_is_rejected(base_config: SyncConfig) {
    let cfg = SyncConfig {
        exclude: vec![String::from("target/"), String::from(" ")],
        ..base_config
    };
    assert_eq!(
        cfg.validate(),
        Err(SyncError::InvalidConfig {
            field: String::from("exclude")
        })
    );
}
