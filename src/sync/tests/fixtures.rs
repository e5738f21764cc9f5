//! Shared fixtures for sync module tests.

use super::super::*;
use rstest::fixture;

#[fixture]
pub fn base_config() -> SyncConfig {
    SyncConfig {
        rsync_bin: String::from("rsync"),
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("root"),
        remote_path: String::from("/remote/path"),
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_connect_timeout_secs: 10,
        exclude: vec![String::from("target/")],
    }
}

#[fixture]
pub fn target() -> ConnectTarget {
    ConnectTarget {
        host: String::from("127.0.0.1"),
        port: 2222,
        user: String::from("root"),
        key_file: Utf8PathBuf::from("/state/keys/abcd1234"),
    }
}
