//! Saturation-triggered server growth: order a machine from the cloud
//! provider, wait for it to boot, register it, then hand it to the matching
//! backend for software install. A server row created here stays in the
//! ledger even when the install fails; an operator gets alerted instead of
//! an automatic rollback deleting a machine that may be half-configured.

use std::sync::Arc;
use std::time::Duration;

use crate::backends::BackendSet;
use crate::cloud::CloudClient;
use crate::notify::{Notification, Notifier};
use crate::store::LedgerStore;
use crate::types::{Protocol, Server};
use crate::{Error, Result};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Provisioner {
    cloud: Arc<CloudClient>,
    store: LedgerStore,
    backends: Arc<BackendSet>,
    notifier: Arc<dyn Notifier>,
    poll_timeout: Duration,
    poll_interval: Duration,
}

impl Provisioner {
    pub fn new(
        cloud: Arc<CloudClient>,
        store: LedgerStore,
        backends: Arc<BackendSet>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cloud,
            store,
            backends,
            notifier,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_timing(mut self, timeout: Duration, interval: Duration) -> Self {
        self.poll_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    /// Builds, boots, and configures one new server for the protocol.
    /// Every failure path has already alerted the operator by the time the
    /// error reaches the caller.
    pub async fn provision_new_server(&self, protocol: Protocol) -> Result<Server> {
        let census = self.store.count_servers(protocol).await?;
        let name = format!("vpn-{}-{}", protocol.as_str(), census + 1);
        tracing::info!(%protocol, name, "ordering a new server");

        let cloud_id = self.cloud.create_server(&name).await.map_err(|error| {
            self.alert_later(format!("cloud server order failed: {error}"));
            error
        })?;

        self.wait_for_active(cloud_id).await?;

        let ip = self.cloud.server_ip(cloud_id).await?;
        let password = self.cloud.server_password(cloud_id).await?;
        let server = self
            .store
            .insert_server(protocol, Some(ip), Some(password))
            .await?;
        tracing::info!(server_id = server.id, cloud_id, "server registered, installing");

        let configured = self
            .backends
            .get(protocol)
            .provision_server(&server)
            .await?;
        if !configured {
            self.notifier
                .notify(Notification::OperationalError {
                    context: format!(
                        "install failed on server {} ({} attempts exhausted); row kept for operator",
                        server.id,
                        protocol.as_str()
                    ),
                })
                .await;
            return Err(Error::ProvisioningFailed(format!(
                "server {} never finished software install",
                server.id
            )));
        }

        // Re-read the row: install may have recorded a management endpoint.
        self.store.server(server.id).await
    }

    async fn wait_for_active(&self, cloud_id: i64) -> Result<()> {
        let attempts = (self.poll_timeout.as_millis() / self.poll_interval.as_millis()).max(1);
        for _ in 0..attempts {
            match self.cloud.server_status(cloud_id).await {
                Ok(status) if status == "active" => return Ok(()),
                Ok(status) => {
                    tracing::debug!(cloud_id, status, "machine not ready yet");
                }
                Err(error) => {
                    tracing::warn!(cloud_id, %error, "status poll failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.notifier
            .notify(Notification::OperationalError {
                context: format!("cloud machine {cloud_id} never became active"),
            })
            .await;
        Err(Error::ProvisioningFailed(format!(
            "cloud machine {cloud_id} not active after {:?}",
            self.poll_timeout
        )))
    }

    /// Alert without holding up the error path; delivery is best effort.
    fn alert_later(&self, context: String) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            notifier
                .notify(Notification::OperationalError { context })
                .await;
        });
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("poll_timeout", &self.poll_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
