//! Scaleway implementation of [`Backend`].
//!
//! SSH keys live in the IAM API; security groups and servers in the
//! Instances API for the configured zone. Image lookup and server actions go
//! through `scaleway-rs`; the remaining calls use the JSON endpoints
//! directly because the SDK does not cover them.
//!
//! Servers are created powered off so a failed boot leaves nothing billed
//! behind; `terminate` deletes a stopped server and its volumes directly
//! since the terminate action only applies to running ones.

mod error;
mod image;
mod types;

use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use scaleway_rs::ScalewayApi;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backend::{
    Backend, BackendError, BackendFuture, InstanceSnapshot, KeySpec, LaunchSpec,
    MANAGED_BY_TAG, PolicySpec,
};
use crate::config::{ConfigError, ScalewayConfig};

use error::{decode_error, response_error, sdk_error, transport_error};
use types::{
    CreateRuleRequest, CreateSecurityGroupRequest, CreateServerRequest, CreateSshKeyRequest,
    SecurityGroupEnvelope, SecurityGroupList, ServerEnvelope, ServerList, SshKey, SshKeyList,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const API_BASE: &str = "https://api.scaleway.com";
const PAGE_SIZE: &str = "100";

/// Backend driving the Scaleway IAM and Instances APIs.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    http: reqwest::Client,
    config: ScalewayConfig,
    base_url: String,
}

impl ScalewayBackend {
    /// Constructs a backend from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when required configuration is missing or the
    /// HTTP client cannot be built.
    pub fn new(config: ScalewayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| ConfigError::Parse(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            http,
            config,
            base_url: API_BASE.to_owned(),
        })
    }

    /// Zone every call targets.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.config.default_zone
    }

    fn instance_url(&self, path: &str) -> String {
        format!(
            "{}/instance/v1/zones/{}/{path}",
            self.base_url, self.config.default_zone
        )
    }

    fn iam_url(&self, path: &str) -> String {
        format!("{}/iam/v1alpha1/{path}", self.base_url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("X-Auth-Token", &self.config.secret_key)
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Vec<u8>, BackendError> {
        debug!(operation, "scaleway request");
        let response = request
            .send()
            .await
            .map_err(|err| transport_error(operation, &err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| transport_error(operation, &err))?;
        if status.is_success() {
            Ok(body.to_vec())
        } else {
            Err(response_error(operation, status, &body))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let body = self.send(operation, request).await?;
        serde_json::from_slice(&body).map_err(|err| decode_error(operation, &err))
    }

    async fn action(&self, operation: &str, id: &str, action: &str) -> Result<(), BackendError> {
        debug!(operation, id, action, "scaleway server action");
        self.api
            .perform_instance_action_async(&self.config.default_zone, id, action)
            .await
            .map(|_| ())
            .map_err(|err| sdk_error(operation, err))
    }

    async fn create_ssh_key_now(&self, spec: &KeySpec) -> Result<String, BackendError> {
        let payload = CreateSshKeyRequest {
            name: &spec.name,
            public_key: &spec.public_key,
            project_id: &self.config.default_project_id,
        };
        let request = self
            .request(Method::POST, &self.iam_url("ssh-keys"))
            .json(&payload);
        let key: SshKey = self.send_json("create ssh key", request).await?;
        Ok(key.id)
    }

    async fn find_ssh_keys_now(&self, name: &str) -> Result<Vec<String>, BackendError> {
        let request = self.request(Method::GET, &self.iam_url("ssh-keys")).query(&[
            ("name", name),
            ("project_id", self.config.default_project_id.as_str()),
            ("page_size", PAGE_SIZE),
        ]);
        let list: SshKeyList = self.send_json("list ssh keys", request).await?;
        Ok(list
            .ssh_keys
            .into_iter()
            .filter(|key| key.name == name)
            .map(|key| key.id)
            .collect())
    }

    async fn create_security_group_now(&self, spec: &PolicySpec) -> Result<String, BackendError> {
        let payload = CreateSecurityGroupRequest {
            name: &spec.name,
            project: &self.config.default_project_id,
            description: "bivouac control channel",
            stateful: true,
            inbound_default_policy: "drop",
            outbound_default_policy: "accept",
            tags: &spec.tags,
        };
        let request = self
            .request(Method::POST, &self.instance_url("security_groups"))
            .json(&payload);
        let created: SecurityGroupEnvelope =
            self.send_json("create security group", request).await?;
        let id = created.security_group.id;

        let rule = CreateRuleRequest {
            protocol: "TCP",
            direction: "inbound",
            action: "accept",
            ip_range: &spec.allowed_cidr,
            dest_port_from: spec.port,
        };
        let request = self
            .request(
                Method::POST,
                &self.instance_url(&format!("security_groups/{id}/rules")),
            )
            .json(&rule);
        if let Err(err) = self.send("create security group rule", request).await {
            // The group is unusable without its rule; remove it before failing.
            let delete = self.request(
                Method::DELETE,
                &self.instance_url(&format!("security_groups/{id}")),
            );
            if let Err(cleanup) = self.send("delete security group", delete).await {
                warn!(id = %id, error = %cleanup, "failed to remove security group without rule");
            }
            return Err(err);
        }
        Ok(id)
    }

    async fn find_security_groups_now(&self, name: &str) -> Result<Vec<String>, BackendError> {
        let request = self
            .request(Method::GET, &self.instance_url("security_groups"))
            .query(&[
                ("name", name),
                ("project", self.config.default_project_id.as_str()),
                ("per_page", PAGE_SIZE),
            ]);
        let list: SecurityGroupList = self.send_json("list security groups", request).await?;
        Ok(list
            .security_groups
            .into_iter()
            .filter(|group| group.name == name)
            .map(|group| group.id)
            .collect())
    }

    async fn create_instance_now(&self, spec: &LaunchSpec) -> Result<InstanceSnapshot, BackendError> {
        spec.validate()?;
        let image = self.resolve_image_id(spec).await?;
        let payload = CreateServerRequest {
            name: &spec.name,
            commercial_type: &spec.instance_type,
            image: &image,
            project: &self.config.default_project_id,
            security_group: &spec.security_group_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            stopped: true,
            tags: &spec.tags,
        };
        let request = self
            .request(Method::POST, &self.instance_url("servers"))
            .json(&payload);
        let created: ServerEnvelope = self.send_json("create server", request).await?;
        Ok(created.server.into_snapshot(&self.config.default_zone))
    }

    async fn terminate_now(&self, id: &str) -> Result<(), BackendError> {
        let request = self.request(Method::GET, &self.instance_url(&format!("servers/{id}")));
        let envelope: ServerEnvelope = self.send_json("get server", request).await?;
        if !envelope.server.is_stopped() {
            return self.action("terminate", id, "terminate").await;
        }
        let volumes = envelope.server.volume_ids();
        let request = self.request(Method::DELETE, &self.instance_url(&format!("servers/{id}")));
        self.send("delete server", request).await?;
        for volume in volumes {
            let request = self.request(
                Method::DELETE,
                &self.instance_url(&format!("volumes/{volume}")),
            );
            if let Err(err) = self.send("delete volume", request).await {
                warn!(
                    server = %id,
                    volume = %volume,
                    error = %err,
                    "failed to delete volume of removed server"
                );
            }
        }
        Ok(())
    }

    async fn describe_instance_now(&self, id: &str) -> Result<Option<InstanceSnapshot>, BackendError> {
        let request = self.request(Method::GET, &self.instance_url(&format!("servers/{id}")));
        match self.send_json::<ServerEnvelope>("get server", request).await {
            Ok(envelope) => Ok(Some(
                envelope.server.into_snapshot(&self.config.default_zone),
            )),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_instances_now(&self) -> Result<Vec<InstanceSnapshot>, BackendError> {
        let request = self
            .request(Method::GET, &self.instance_url("servers"))
            .query(&[
                ("tags", MANAGED_BY_TAG),
                ("project", self.config.default_project_id.as_str()),
                ("per_page", PAGE_SIZE),
            ]);
        let list: ServerList = self.send_json("list servers", request).await?;
        Ok(list
            .servers
            .into_iter()
            .map(|server| server.into_snapshot(&self.config.default_zone))
            .filter(|snapshot| snapshot.tags.iter().any(|tag| tag == MANAGED_BY_TAG))
            .collect())
    }
}

impl Backend for ScalewayBackend {
    fn create_ssh_key<'a>(&'a self, spec: &'a KeySpec) -> BackendFuture<'a, String> {
        Box::pin(self.create_ssh_key_now(spec))
    }

    fn find_ssh_keys<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(self.find_ssh_keys_now(name))
    }

    fn delete_ssh_key<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = self.request(Method::DELETE, &self.iam_url(&format!("ssh-keys/{id}")));
            self.send("delete ssh key", request).await.map(|_| ())
        })
    }

    fn create_security_group<'a>(&'a self, spec: &'a PolicySpec) -> BackendFuture<'a, String> {
        Box::pin(self.create_security_group_now(spec))
    }

    fn find_security_groups<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(self.find_security_groups_now(name))
    }

    fn delete_security_group<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = self.request(
                Method::DELETE,
                &self.instance_url(&format!("security_groups/{id}")),
            );
            self.send("delete security group", request).await.map(|_| ())
        })
    }

    fn create_instance<'a>(&'a self, spec: &'a LaunchSpec) -> BackendFuture<'a, InstanceSnapshot> {
        Box::pin(self.create_instance_now(spec))
    }

    fn describe_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>> {
        Box::pin(self.describe_instance_now(id))
    }

    fn list_instances(&self) -> BackendFuture<'_, Vec<InstanceSnapshot>> {
        Box::pin(self.list_instances_now())
    }

    fn power_on<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.action("power on", id, "poweron"))
    }

    fn power_off<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.action("power off", id, "poweroff"))
    }

    fn terminate<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.terminate_now(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScalewayConfig {
        ScalewayConfig {
            access_key: None,
            secret_key: String::from("secret"),
            default_organization_id: None,
            default_project_id: String::from("proj"),
            default_zone: String::from("nl-ams-1"),
            default_instance_type: String::from("DEV1-S"),
            default_image: String::from("Ubuntu 24.04 Noble Numbat"),
            default_architecture: String::from("x86_64"),
        }
    }

    fn backend() -> ScalewayBackend {
        ScalewayBackend::new(config()).unwrap_or_else(|err| panic!("backend: {err}"))
    }

    #[test]
    fn urls_target_configured_zone() {
        let backend = backend();
        assert_eq!(
            backend.instance_url("servers/i-1"),
            "https://api.scaleway.com/instance/v1/zones/nl-ams-1/servers/i-1"
        );
        assert_eq!(
            backend.iam_url("ssh-keys"),
            "https://api.scaleway.com/iam/v1alpha1/ssh-keys"
        );
    }

    #[test]
    fn missing_secret_key_is_rejected() {
        let mut incomplete = config();
        incomplete.secret_key = String::from("  ");

        let Err(err) = ScalewayBackend::new(incomplete) else {
            panic!("a blank secret key must be rejected");
        };
        assert!(err.to_string().contains("SCW_SECRET_KEY"), "{err}");
    }
}
