//! Wire shapes for the Scaleway Instances and IAM APIs.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::backend::{InstanceSnapshot, InstanceState};

#[derive(Debug, Serialize)]
pub(super) struct CreateSshKeyRequest<'a> {
    pub(super) name: &'a str,
    pub(super) public_key: &'a str,
    pub(super) project_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKey {
    pub(super) id: String,
    #[serde(default)]
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKeyList {
    #[serde(default)]
    pub(super) ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateSecurityGroupRequest<'a> {
    pub(super) name: &'a str,
    pub(super) project: &'a str,
    pub(super) description: &'static str,
    pub(super) stateful: bool,
    pub(super) inbound_default_policy: &'static str,
    pub(super) outbound_default_policy: &'static str,
    pub(super) tags: &'a [String],
}

#[derive(Debug, Serialize)]
pub(super) struct CreateRuleRequest<'a> {
    pub(super) protocol: &'static str,
    pub(super) direction: &'static str,
    pub(super) action: &'static str,
    pub(super) ip_range: &'a str,
    pub(super) dest_port_from: u16,
}

#[derive(Debug, Deserialize)]
pub(super) struct SecurityGroup {
    pub(super) id: String,
    #[serde(default)]
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct SecurityGroupEnvelope {
    pub(super) security_group: SecurityGroup,
}

#[derive(Debug, Deserialize)]
pub(super) struct SecurityGroupList {
    #[serde(default)]
    pub(super) security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateServerRequest<'a> {
    pub(super) name: &'a str,
    pub(super) commercial_type: &'a str,
    pub(super) image: &'a str,
    pub(super) project: &'a str,
    pub(super) security_group: &'a str,
    pub(super) routed_ip_enabled: bool,
    pub(super) dynamic_ip_required: bool,
    pub(super) stopped: bool,
    pub(super) tags: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(super) struct PublicIp {
    pub(super) address: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Volume {
    pub(super) id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Server {
    pub(super) id: String,
    #[serde(default)]
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) zone: String,
    #[serde(default)]
    pub(super) public_ip: Option<PublicIp>,
    #[serde(default)]
    pub(super) public_ips: Vec<PublicIp>,
    #[serde(default)]
    pub(super) tags: Vec<String>,
    /// Attached volumes keyed by slot index.
    #[serde(default)]
    pub(super) volumes: BTreeMap<String, Volume>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: Server,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerList {
    #[serde(default)]
    pub(super) servers: Vec<Server>,
}

/// Maps a Scaleway server state onto the mirrored lifecycle state.
pub(super) fn server_state(raw: &str) -> InstanceState {
    match raw {
        "starting" => InstanceState::Pending,
        "running" => InstanceState::Running,
        "stopping" => InstanceState::Stopping,
        "stopped" | "stopped in place" => InstanceState::Stopped,
        other => InstanceState::Unknown(other.to_owned()),
    }
}

impl Server {
    /// Whether the server is powered off and can be deleted outright.
    pub(super) fn is_stopped(&self) -> bool {
        server_state(&self.state) == InstanceState::Stopped
    }

    /// Volume ids in slot order.
    pub(super) fn volume_ids(&self) -> Vec<String> {
        self.volumes.values().map(|volume| volume.id.clone()).collect()
    }

    /// Converts the wire shape, preferring routed IPv4 addresses.
    pub(super) fn into_snapshot(self, fallback_zone: &str) -> InstanceSnapshot {
        let addresses: Vec<IpAddr> = self
            .public_ip
            .into_iter()
            .chain(self.public_ips)
            .filter_map(|ip| ip.address.parse().ok())
            .collect();
        let public_ip = addresses
            .iter()
            .find(|address| address.is_ipv4())
            .or_else(|| addresses.first())
            .copied();
        InstanceSnapshot {
            id: self.id,
            name: self.name,
            zone: if self.zone.is_empty() {
                fallback_zone.to_owned()
            } else {
                self.zone
            },
            state: server_state(&self.state),
            public_ip,
            tags: self.tags,
        }
    }
}
