//! Access-key backends. Each VPN technology exposes the same key lifecycle
//! behind [`VpnBackend`]; callers dispatch through a [`BackendSet`] keyed by
//! protocol and never see wire formats or panel sessions.

pub(crate) mod http;
pub mod outline;
pub mod vless;

use async_trait::async_trait;

use crate::types::{KeyRecord, Protocol, Server};
use crate::{Error, Result};

pub use outline::OutlineBackend;
pub use vless::VlessBackend;

/// A key-management control plane for one VPN technology.
///
/// Implementations are stateless between calls except for cached panel
/// sessions; every method takes the target server row so one backend value
/// serves the whole fleet.
#[async_trait]
pub trait VpnBackend: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Mints a new access key on the server and returns its record. The key
    /// id comes from the control plane and the display name is generated
    /// here; usage starts at zero.
    async fn create_key(&self, server: &Server, quota_bytes: u64) -> Result<KeyRecord>;

    /// Fetches the key's current name, quota, and measured usage.
    async fn get_key_info(&self, server: &Server, key_id: &str) -> Result<KeyRecord>;

    /// Removes the key from the server. Returns false when the server has no
    /// such key; deleting an already-absent key is not an error.
    async fn delete_key(&self, server: &Server, key_id: &str) -> Result<bool>;

    async fn rename_key(&self, server: &Server, key_id: &str, new_name: &str) -> Result<()>;

    /// Overwrites the key's quota limit on the server. `name` is required by
    /// control planes that only accept whole-client updates.
    async fn update_quota(
        &self,
        server: &Server,
        key_id: &str,
        quota_bytes: u64,
        name: Option<&str>,
    ) -> Result<u64>;

    /// Resets the quota to current usage plus the standard headroom, so a key
    /// that ran dry starts moving again without unbounded growth. Returns the
    /// new quota.
    async fn extend_quota_headroom(&self, server: &Server, key_id: &str) -> Result<u64> {
        let info = self.get_key_info(server, key_id).await?;
        let new_quota = info
            .used_bytes
            .saturating_add(crate::types::QUOTA_HEADROOM_BYTES);
        self.update_quota(server, key_id, new_quota, Some(&info.name))
            .await?;
        Ok(new_quota)
    }

    /// Installs the VPN software on a freshly created machine and records the
    /// resulting management endpoint. Returns false when the machine never
    /// became reachable.
    async fn provision_server(&self, server: &Server) -> Result<bool>;
}

/// Protocol-indexed set of backends. Built once at startup and shared.
pub struct BackendSet {
    outline: Box<dyn VpnBackend>,
    vless: Box<dyn VpnBackend>,
}

impl BackendSet {
    pub fn new(outline: Box<dyn VpnBackend>, vless: Box<dyn VpnBackend>) -> Self {
        Self { outline, vless }
    }

    pub fn get(&self, protocol: Protocol) -> &dyn VpnBackend {
        match protocol {
            Protocol::Outline => self.outline.as_ref(),
            Protocol::Vless => self.vless.as_ref(),
        }
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet").finish_non_exhaustive()
    }
}

fn server_address(server: &Server) -> Result<&str> {
    server
        .ip
        .as_deref()
        .ok_or_else(|| Error::ProvisioningFailed(format!("server {} has no address", server.id)))
}
