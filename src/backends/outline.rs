//! Outline control-plane adapter. The management API listens on a
//! self-signed HTTPS endpoint written into the server row at provisioning
//! time; usage comes from a separate metrics query that reports cumulative
//! transferred bytes per key id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::backends::http::{send_checked, send_checked_json};
use crate::backends::{VpnBackend, server_address};
use crate::names;
use crate::notify::{Notification, Notifier};
use crate::shell::RemoteShell;
use crate::store::LedgerStore;
use crate::types::{KeyRecord, Protocol, Server};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_ATTEMPTS: u32 = 5;
const SETUP_RETRY_DELAY: Duration = Duration::from_secs(10);

const UPDATE_COMMAND: &str = "apt-get update -y";
const INSTALL_COMMAND: &str = "bash -c \"$(wget -qO- \
    https://raw.githubusercontent.com/Jigsaw-Code/outline-server/master/\
    src/server_manager/install_scripts/install_server.sh)\"";

pub struct OutlineBackend {
    client: reqwest::Client,
    store: LedgerStore,
    shell: Arc<dyn RemoteShell>,
    notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKey {
    id: String,
    #[serde(default)]
    name: String,
    access_url: String,
    #[serde(default)]
    data_limit: Option<DataLimit>,
}

#[derive(Debug, Deserialize)]
struct DataLimit {
    bytes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferMetrics {
    #[serde(default)]
    bytes_transferred_by_user_id: HashMap<String, u64>,
}

/// Connection blob the installer prints on success.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallConfig {
    api_url: String,
    cert_sha256: String,
}

impl OutlineBackend {
    pub fn new(
        store: LedgerStore,
        shell: Arc<dyn RemoteShell>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        // The management endpoint presents a self-signed certificate. Its
        // fingerprint is recorded on the server row; verification is skipped
        // here, which confines the permissive client to this adapter.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            store,
            shell,
            notifier,
        })
    }

    fn api_url<'a>(&self, server: &'a Server) -> Result<&'a str> {
        server.api_url.as_deref().ok_or_else(|| {
            Error::ProvisioningFailed(format!("server {} has no management endpoint", server.id))
        })
    }

    async fn usage_for(&self, api_url: &str, key_id: &str) -> Result<u64> {
        let metrics: TransferMetrics = send_checked_json(
            self.client.get(format!("{api_url}/metrics/transfer")),
        )
        .await?;
        Ok(metrics
            .bytes_transferred_by_user_id
            .get(key_id)
            .copied()
            .unwrap_or(0))
    }

    async fn set_data_limit(&self, api_url: &str, key_id: &str, bytes: u64) -> Result<()> {
        let body = serde_json::json!({ "limit": { "bytes": bytes } });
        send_checked(
            self.client
                .put(format!("{api_url}/access-keys/{key_id}/data-limit"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn set_name(&self, api_url: &str, key_id: &str, name: &str) -> Result<()> {
        send_checked(
            self.client
                .put(format!("{api_url}/access-keys/{key_id}/name"))
                .form(&[("name", name)]),
        )
        .await?;
        Ok(())
    }

    async fn setup_attempt(&self, server: &Server) -> Result<InstallConfig> {
        let host = server_address(server)?;
        let password = server.password.as_deref().ok_or_else(|| {
            Error::ProvisioningFailed(format!("server {} has no root password", server.id))
        })?;

        let update = self.shell.run(host, password, UPDATE_COMMAND, None).await?;
        if !update.success() {
            return Err(Error::ProvisioningFailed(format!(
                "package update failed on {host}: {}",
                update.stderr.trim()
            )));
        }

        let install = self
            .shell
            .run(host, password, INSTALL_COMMAND, Some("y\n"))
            .await?;
        if !install.success() {
            return Err(Error::ProvisioningFailed(format!(
                "installer failed on {host}: {}",
                install.stderr.trim()
            )));
        }

        extract_install_config(&install.stdout).ok_or_else(|| {
            Error::ProvisioningFailed(format!(
                "installer output on {host} carried no connection blob"
            ))
        })
    }
}

#[async_trait]
impl VpnBackend for OutlineBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Outline
    }

    async fn create_key(&self, server: &Server, quota_bytes: u64) -> Result<KeyRecord> {
        let api_url = self.api_url(server)?;
        let created: AccessKey =
            send_checked_json(self.client.post(format!("{api_url}/access-keys/"))).await?;

        let name = names::generate();
        self.set_name(api_url, &created.id, &name).await?;
        self.set_data_limit(api_url, &created.id, quota_bytes).await?;

        Ok(KeyRecord {
            key_id: created.id,
            name,
            access_url: created.access_url,
            quota_bytes,
            used_bytes: 0,
        })
    }

    async fn get_key_info(&self, server: &Server, key_id: &str) -> Result<KeyRecord> {
        let api_url = self.api_url(server)?;
        let key: AccessKey = send_checked_json(
            self.client.get(format!("{api_url}/access-keys/{key_id}")),
        )
        .await
        .map_err(|error| match error {
            Error::Api { status, .. } if status == reqwest::StatusCode::NOT_FOUND => {
                Error::KeyNotFound(key_id.to_string())
            }
            other => other,
        })?;
        let used_bytes = self.usage_for(api_url, key_id).await?;

        Ok(KeyRecord {
            key_id: key.id,
            name: key.name,
            access_url: key.access_url,
            quota_bytes: key.data_limit.map(|limit| limit.bytes).unwrap_or(0),
            used_bytes,
        })
    }

    async fn delete_key(&self, server: &Server, key_id: &str) -> Result<bool> {
        let api_url = self.api_url(server)?;
        match send_checked(
            self.client.delete(format!("{api_url}/access-keys/{key_id}")),
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(Error::Api { status, .. }) if status == reqwest::StatusCode::NOT_FOUND => {
                tracing::debug!(key_id, "key already absent");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    async fn rename_key(&self, server: &Server, key_id: &str, new_name: &str) -> Result<()> {
        let api_url = self.api_url(server)?;
        self.set_name(api_url, key_id, new_name).await
    }

    async fn update_quota(
        &self,
        server: &Server,
        key_id: &str,
        quota_bytes: u64,
        _name: Option<&str>,
    ) -> Result<u64> {
        let api_url = self.api_url(server)?;
        self.set_data_limit(api_url, key_id, quota_bytes).await?;
        Ok(quota_bytes)
    }

    async fn provision_server(&self, server: &Server) -> Result<bool> {
        for attempt in 1..=SETUP_ATTEMPTS {
            match self.setup_attempt(server).await {
                Ok(config) => {
                    self.store
                        .update_server_endpoint(server.id, &config.api_url, &config.cert_sha256)
                        .await?;
                    self.notifier
                        .notify(Notification::ServerProvisioned {
                            server_id: server.id,
                            ip: server.ip.clone().unwrap_or_default(),
                            protocol: Protocol::Outline,
                            detail: format!("management api at {}", config.api_url),
                        })
                        .await;
                    return Ok(true);
                }
                Err(error) => {
                    tracing::error!(
                        server_id = server.id,
                        attempt,
                        %error,
                        "outline setup attempt failed"
                    );
                    if attempt > 1 {
                        self.notifier
                            .notify(Notification::OperationalError {
                                context: format!(
                                    "outline setup on server {} attempt {attempt}/{SETUP_ATTEMPTS}: {error}",
                                    server.id
                                ),
                            })
                            .await;
                    }
                    if attempt < SETUP_ATTEMPTS {
                        tokio::time::sleep(SETUP_RETRY_DELAY).await;
                    }
                }
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for OutlineBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlineBackend").finish_non_exhaustive()
    }
}

/// Pulls the installer's `{"apiUrl": ..., "certSha256": ...}` blob out of
/// its mixed progress output.
fn extract_install_config(output: &str) -> Option<InstallConfig> {
    let mut rest = output;
    while let Some(start) = rest.find('{') {
        let candidate = &rest[start..];
        let Some(end) = candidate.find('}') else {
            return None;
        };
        if let Ok(config) = serde_json::from_str::<InstallConfig>(&candidate[..=end]) {
            return Some(config);
        }
        rest = &candidate[1..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_config_is_found_in_noisy_output() {
        let output = "\
            Verifying curl is installed...\n\
            CONGRATULATIONS! Your Outline server is up and running.\n\
            {\"apiUrl\":\"https://1.2.3.4:5678/abc\",\"certSha256\":\"AA11\"}\n\
            Make sure to open the firewall.\n";
        let config = extract_install_config(output).expect("config present");
        assert_eq!(config.api_url, "https://1.2.3.4:5678/abc");
        assert_eq!(config.cert_sha256, "AA11");
    }

    #[test]
    fn unrelated_braces_are_skipped() {
        let output = "progress {stage: 1} then {\"apiUrl\":\"https://h:1/x\",\"certSha256\":\"FF\"}";
        let config = extract_install_config(output).expect("config present");
        assert_eq!(config.cert_sha256, "FF");
    }

    #[test]
    fn missing_config_yields_none() {
        assert!(extract_install_config("no json here").is_none());
        assert!(extract_install_config("{\"other\": true}").is_none());
    }
}
