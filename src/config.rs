use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level service configuration, loaded from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// SQLite ledger path.
    pub store_path: PathBuf,
    /// Where the backup job copies the ledger file.
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    pub cloud: CloudConfig,
    pub panel: PanelConfig,
    pub notify: NotifyConfig,
    /// Data allowance for trial keys. Defaults to 10 GiB.
    #[serde(default = "default_trial_quota_bytes")]
    pub trial_quota_bytes: u64,
    /// Data allowance for paid keys. Defaults to 200 GiB.
    #[serde(default = "default_paid_quota_bytes")]
    pub paid_quota_bytes: u64,
}

fn default_trial_quota_bytes() -> u64 {
    10 * crate::types::GIB
}

fn default_paid_quota_bytes() -> u64 {
    200 * crate::types::GIB
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Config> {
        toml::from_str(raw).map_err(|err| Error::InvalidResponse(format!("config: {err}")))
    }

    pub async fn from_toml_path(path: impl AsRef<Path>) -> Result<Config> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&raw)
    }
}

/// Credentials and fixed plan identifiers for the VM provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub email: String,
    pub password: String,
    #[serde(default = "default_datacenter_id")]
    pub datacenter_id: u32,
    #[serde(default = "default_server_plan_id")]
    pub server_plan_id: u32,
    #[serde(default = "default_template_id")]
    pub template_id: u32,
}

fn default_datacenter_id() -> u32 {
    1
}

fn default_server_plan_id() -> u32 {
    17
}

fn default_template_id() -> u32 {
    31
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("datacenter_id", &self.datacenter_id)
            .field("server_plan_id", &self.server_plan_id)
            .field("template_id", &self.template_id)
            .finish()
    }
}

/// VLESS panel administration settings shared by all panel servers.
#[derive(Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub admin_user: String,
    #[serde(default = "default_panel_port")]
    pub panel_port: u16,
}

fn default_panel_port() -> u16 {
    2053
}

impl std::fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelConfig")
            .field("admin_user", &self.admin_user)
            .field("panel_port", &self.panel_port)
            .finish()
    }
}

/// Outbound notification channel (bot-API style HTTP endpoint).
#[derive(Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub api_base: String,
    pub token: String,
    /// Operator chats that receive alerts and new-server reports.
    #[serde(default)]
    pub admin_chat_ids: Vec<i64>,
}

impl std::fmt::Debug for NotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyConfig")
            .field("api_base", &self.api_base)
            .field("token", &"<redacted>")
            .field("admin_chat_ids", &self.admin_chat_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            store_path = "/var/lib/keyfleet/ledger.sqlite"

            [cloud]
            base_url = "https://provider.example/v1"
            email = "ops@example.com"
            password = "secret"

            [panel]
            admin_user = "panel_admin"

            [notify]
            api_base = "https://bot.example"
            token = "bot-token"
            admin_chat_ids = [11, 42]
        "#;
        let config = Config::from_toml_str(raw).expect("parse");
        assert_eq!(config.trial_quota_bytes, 10 * crate::types::GIB);
        assert_eq!(config.paid_quota_bytes, 200 * crate::types::GIB);
        assert_eq!(config.cloud.datacenter_id, 1);
        assert_eq!(config.panel.panel_port, 2053);
        assert_eq!(config.notify.admin_chat_ids, vec![11, 42]);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let raw = r#"
            store_path = "ledger.sqlite"

            [cloud]
            base_url = "https://provider.example/v1"
            email = "ops@example.com"
            password = "hunter2"

            [panel]
            admin_user = "panel_admin"

            [notify]
            api_base = "https://bot.example"
            token = "bot-token"
        "#;
        let config = Config::from_toml_str(raw).expect("parse");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("bot-token"));
    }
}
