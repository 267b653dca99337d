//! VLESS adapter speaking to a 3x-ui management panel. The panel is
//! session-based: every call needs a login cookie, and any failed request
//! invalidates the session and triggers one transparent re-login before the
//! error surfaces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backends::{VpnBackend, server_address};
use crate::config::PanelConfig;
use crate::names;
use crate::notify::{Notification, Notifier};
use crate::shell::RemoteShell;
use crate::types::{KeyRecord, Protocol, Server};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_ATTEMPTS: u32 = 5;
const SETUP_RETRY_DELAY: Duration = Duration::from_secs(10);
/// One fresh login per call on top of the initial try.
const MAX_SESSION_ATTEMPTS: u32 = 2;

const INBOUND_REMARK: &str = "MainInbound";
const DEFAULT_SNI: &str = "dl.google.com";
const DEFAULT_FLOW: &str = "xtls-rprx-vision";
const DEFAULT_SHORT_ID: &str = "deced1f3";

const SETUP_SCRIPT_COMMAND: &str = "curl -sSL \
    https://raw.githubusercontent.com/torikki-tou/team418/main/setup.sh \
    -o setup.sh && chmod +x setup.sh";

pub struct VlessBackend {
    client: reqwest::Client,
    admin_user: String,
    panel_port: u16,
    shell: Arc<dyn RemoteShell>,
    notifier: Arc<dyn Notifier>,
    // Login cookie per server id. A failed request drops the entry.
    sessions: tokio::sync::Mutex<HashMap<i64, String>>,
}

#[derive(Debug, Deserialize)]
struct PanelResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Inbound {
    id: i64,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    settings: String,
    #[serde(default, rename = "streamSettings")]
    stream_settings: String,
    #[serde(default, rename = "clientStats")]
    client_stats: Vec<ClientStat>,
}

#[derive(Debug, Deserialize)]
struct ClientStat {
    #[serde(default)]
    email: String,
    #[serde(default)]
    up: u64,
    #[serde(default)]
    down: u64,
}

/// One client entry inside an inbound's JSON-encoded `settings` field.
/// Unknown panel fields round-trip through `extra` so updates do not strip
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Client {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    comment: String,
    #[serde(default, rename = "totalGB")]
    total_bytes: u64,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<Client>,
}

impl VlessBackend {
    pub fn new(
        config: &PanelConfig,
        shell: Arc<dyn RemoteShell>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        // Panels serve self-signed certificates on a bare IP.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            admin_user: config.admin_user.clone(),
            panel_port: config.panel_port,
            shell,
            notifier,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn panel_host(&self, server: &Server) -> Result<String> {
        if let Some(api_url) = server.api_url.as_deref() {
            return Ok(api_url.trim_end_matches('/').to_string());
        }
        let ip = server_address(server)?;
        Ok(format!("https://{ip}:{}", self.panel_port))
    }

    fn panel_password<'a>(&self, server: &'a Server) -> Result<&'a str> {
        server.password.as_deref().ok_or_else(|| {
            Error::ProvisioningFailed(format!("server {} has no panel password", server.id))
        })
    }

    async fn login(&self, server: &Server) -> Result<String> {
        let host = self.panel_host(server)?;
        let password = self.panel_password(server)?;
        let response = self
            .client
            .post(format!("{host}/login"))
            .form(&[("username", self.admin_user.as_str()), ("password", password)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status,
                body: "panel login failed".to_string(),
            });
        }
        let cookie = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");
        let body: PanelResponse = response.json().await?;
        if !body.success {
            return Err(Error::InvalidResponse(format!(
                "panel rejected login: {}",
                body.msg
            )));
        }
        if cookie.is_empty() {
            return Err(Error::InvalidResponse(
                "panel login returned no session cookie".to_string(),
            ));
        }
        Ok(cookie)
    }

    async fn session_cookie(&self, server: &Server) -> Result<String> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(cookie) = sessions.get(&server.id) {
                return Ok(cookie.clone());
            }
        }
        let cookie = self.login(server).await?;
        self.sessions
            .lock()
            .await
            .insert(server.id, cookie.clone());
        Ok(cookie)
    }

    async fn drop_session(&self, server_id: i64) {
        self.sessions.lock().await.remove(&server_id);
    }

    /// Posts a form to the panel and parses the `{success, msg, obj}`
    /// envelope. On any failure the session is dropped and the call retried
    /// with a fresh login, at most once.
    async fn panel_request(
        &self,
        server: &Server,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<PanelResponse> {
        let host = self.panel_host(server)?;
        let url = format!("{host}{endpoint}");
        let mut last_error = None;
        for attempt in 1..=MAX_SESSION_ATTEMPTS {
            let cookie = self.session_cookie(server).await?;
            let result = async {
                let response = self
                    .client
                    .post(&url)
                    .header(reqwest::header::COOKIE, cookie)
                    .form(form)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::Api {
                        status,
                        body: format!("panel request {endpoint} failed"),
                    });
                }
                Ok(response.json::<PanelResponse>().await?)
            }
            .await;
            match result {
                Ok(parsed) => return Ok(parsed),
                Err(error) => {
                    tracing::warn!(
                        server_id = server.id,
                        endpoint,
                        attempt,
                        %error,
                        "panel request failed, re-authenticating"
                    );
                    self.drop_session(server.id).await;
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::InvalidResponse(format!("panel request {endpoint} never ran"))
        }))
    }

    async fn list_inbounds(&self, server: &Server) -> Result<Vec<Inbound>> {
        let response = self
            .panel_request(server, "/panel/inbound/list/", &[])
            .await?;
        if !response.success {
            return Err(Error::InvalidResponse(format!(
                "inbound list failed: {}",
                response.msg
            )));
        }
        Ok(serde_json::from_value(response.obj)?)
    }

    /// Finds the inbound and client carrying the given client id.
    fn find_client(
        inbounds: &[Inbound],
        key_id: &str,
    ) -> Option<(i64, Client)> {
        for inbound in inbounds {
            let Ok(settings) = serde_json::from_str::<InboundSettings>(&inbound.settings) else {
                continue;
            };
            if let Some(client) = settings.clients.into_iter().find(|c| c.id == key_id) {
                return Some((inbound.id, client));
            }
        }
        None
    }

    fn usage_of(inbounds: &[Inbound], key_id: &str) -> u64 {
        inbounds
            .iter()
            .flat_map(|inbound| inbound.client_stats.iter())
            .find(|stat| stat.email == key_id)
            .map(|stat| stat.up + stat.down)
            .unwrap_or(0)
    }

    fn access_url(
        &self,
        server: &Server,
        inbound: &Inbound,
        key_id: &str,
        name: &str,
    ) -> Result<String> {
        let ip = server_address(server)?;
        let stream: serde_json::Value =
            serde_json::from_str(&inbound.stream_settings).unwrap_or_default();
        let reality = &stream["realitySettings"];
        let public_key = reality["settings"]["publicKey"].as_str().unwrap_or("");
        let flow = stream["flow"].as_str().unwrap_or(DEFAULT_FLOW);
        let short_id = reality["shortIds"][0].as_str().unwrap_or(DEFAULT_SHORT_ID);
        let port = if inbound.port == 0 { 443 } else { inbound.port };
        Ok(format!(
            "vless://{key_id}@{ip}:{port}/?type=tcp&security=reality&pbk={public_key}\
             &fp=chrome&sni={DEFAULT_SNI}&sid={short_id}&spx=%2F&flow={flow}#{name}"
        ))
    }

    async fn update_client(
        &self,
        server: &Server,
        inbound_id: i64,
        client: &Client,
    ) -> Result<PanelResponse> {
        let settings = serde_json::to_string(&serde_json::json!({ "clients": [client] }))?;
        self.panel_request(
            server,
            &format!("/panel/inbound/updateClient/{}", client.id),
            &[("id", inbound_id.to_string()), ("settings", settings)],
        )
        .await
    }

    /// Creates the shared reality inbound on a panel that has none yet.
    async fn add_inbound(&self, server: &Server) -> Result<()> {
        let cert = self
            .panel_request(server, "/server/getNewX25519Cert", &[])
            .await?;
        if !cert.success {
            return Err(Error::InvalidResponse(format!(
                "x25519 keypair request failed: {}",
                cert.msg
            )));
        }
        let private_key = cert.obj["privateKey"].as_str().unwrap_or("").to_string();
        let public_key = cert.obj["publicKey"].as_str().unwrap_or("").to_string();

        let settings = serde_json::to_string(&serde_json::json!({
            "clients": [],
            "decryption": "none",
            "fallbacks": [],
        }))?;
        let stream_settings = serde_json::to_string(&serde_json::json!({
            "network": "tcp",
            "security": "reality",
            "realitySettings": {
                "show": false,
                "xver": 0,
                "dest": "google.com:443",
                "serverNames": ["google.com", "www.google.com"],
                "privateKey": private_key,
                "maxTimediff": 0,
                "shortIds": [DEFAULT_SHORT_ID],
                "settings": {
                    "publicKey": public_key,
                    "fingerprint": "chrome",
                    "serverName": "",
                    "spiderX": "/",
                },
            },
            "tcpSettings": {
                "acceptProxyProtocol": false,
                "header": {"type": "none"},
            },
        }))?;
        let sniffing =
            serde_json::to_string(&serde_json::json!({"enabled": false, "destOverride": []}))?;

        let response = self
            .panel_request(
                server,
                "/panel/inbound/add",
                &[
                    ("up", "0".to_string()),
                    ("down", "0".to_string()),
                    ("total", "0".to_string()),
                    ("remark", INBOUND_REMARK.to_string()),
                    ("enable", "true".to_string()),
                    ("expiryTime", "0".to_string()),
                    ("listen", String::new()),
                    ("port", "443".to_string()),
                    ("protocol", "vless".to_string()),
                    ("settings", settings),
                    ("streamSettings", stream_settings),
                    ("sniffing", sniffing),
                ],
            )
            .await?;
        if !response.success {
            return Err(Error::InvalidResponse(format!(
                "inbound add failed: {}",
                response.msg
            )));
        }
        Ok(())
    }

    async fn setup_attempt(&self, server: &Server) -> Result<()> {
        let host = server_address(server)?;
        let password = self.panel_password(server)?;

        let fetch = self
            .shell
            .run(host, password, SETUP_SCRIPT_COMMAND, None)
            .await?;
        if !fetch.success() {
            return Err(Error::ProvisioningFailed(format!(
                "setup script download failed on {host}: {}",
                fetch.stderr.trim()
            )));
        }

        // Scripted answers to the installer prompts: admin login, panel
        // password, panel port, bind address, config overwrite confirmation.
        let answers = format!(
            "{}\n{}\n{}\n{}\ny\n",
            self.admin_user, password, self.panel_port, host
        );
        let install = self
            .shell
            .run(host, password, "bash -c \"./setup.sh\"", Some(&answers))
            .await?;
        if !install.success() {
            return Err(Error::ProvisioningFailed(format!(
                "panel install failed on {host}: {}",
                install.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VpnBackend for VlessBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Vless
    }

    async fn create_key(&self, server: &Server, quota_bytes: u64) -> Result<KeyRecord> {
        let mut inbounds = self.list_inbounds(server).await?;
        if inbounds.is_empty() {
            self.add_inbound(server).await?;
            inbounds = self.list_inbounds(server).await?;
        }
        let inbound = inbounds
            .first()
            .ok_or_else(|| Error::InvalidResponse("panel has no inbound".to_string()))?;

        let key_id = Uuid::new_v4().to_string();
        let name = names::generate();
        let access_url = self.access_url(server, inbound, &key_id, &name)?;

        let settings = serde_json::to_string(&serde_json::json!({
            "clients": [{
                "id": key_id,
                "alterId": 0,
                "email": key_id,
                "limitIp": 5,
                "totalGB": quota_bytes,
                "expiryTime": 0,
                "enable": true,
                "flow": DEFAULT_FLOW,
                "subId": key_id,
                "comment": name,
            }]
        }))?;
        let response = self
            .panel_request(
                server,
                "/panel/inbound/addClient",
                &[("id", inbound.id.to_string()), ("settings", settings)],
            )
            .await?;
        if !response.success {
            return Err(Error::InvalidResponse(format!(
                "client add failed: {}",
                response.msg
            )));
        }

        Ok(KeyRecord {
            key_id,
            name,
            access_url,
            quota_bytes,
            used_bytes: 0,
        })
    }

    async fn get_key_info(&self, server: &Server, key_id: &str) -> Result<KeyRecord> {
        let inbounds = self.list_inbounds(server).await?;
        let used_bytes = Self::usage_of(&inbounds, key_id);
        for inbound in &inbounds {
            let Ok(settings) = serde_json::from_str::<InboundSettings>(&inbound.settings) else {
                continue;
            };
            if let Some(client) = settings.clients.iter().find(|c| c.id == key_id) {
                let access_url = self.access_url(server, inbound, key_id, &client.comment)?;
                return Ok(KeyRecord {
                    key_id: key_id.to_string(),
                    name: client.comment.clone(),
                    access_url,
                    quota_bytes: client.total_bytes,
                    used_bytes,
                });
            }
        }
        Err(Error::KeyNotFound(key_id.to_string()))
    }

    async fn delete_key(&self, server: &Server, key_id: &str) -> Result<bool> {
        let inbounds = self.list_inbounds(server).await?;
        let Some((inbound_id, _)) = Self::find_client(&inbounds, key_id) else {
            return Ok(false);
        };
        let response = self
            .panel_request(
                server,
                &format!("/panel/inbound/{inbound_id}/delClient/{key_id}"),
                &[],
            )
            .await?;
        if !response.success {
            return Err(Error::InvalidResponse(format!(
                "client delete failed: {}",
                response.msg
            )));
        }
        Ok(true)
    }

    async fn rename_key(&self, server: &Server, key_id: &str, new_name: &str) -> Result<()> {
        let inbounds = self.list_inbounds(server).await?;
        let Some((inbound_id, mut client)) = Self::find_client(&inbounds, key_id) else {
            return Err(Error::KeyNotFound(key_id.to_string()));
        };
        client.comment = new_name.to_string();
        let response = self.update_client(server, inbound_id, &client).await?;
        if !response.success {
            return Err(Error::InvalidResponse(format!(
                "client rename failed: {}",
                response.msg
            )));
        }
        Ok(())
    }

    async fn update_quota(
        &self,
        server: &Server,
        key_id: &str,
        quota_bytes: u64,
        name: Option<&str>,
    ) -> Result<u64> {
        let inbounds = self.list_inbounds(server).await?;
        let Some((inbound_id, mut client)) = Self::find_client(&inbounds, key_id) else {
            return Err(Error::KeyNotFound(key_id.to_string()));
        };
        client.total_bytes = quota_bytes;
        if let Some(name) = name {
            client.comment = name.to_string();
        }
        let response = self.update_client(server, inbound_id, &client).await?;
        if !response.success {
            return Err(Error::QuotaOperationFailed(key_id.to_string()));
        }
        Ok(quota_bytes)
    }

    async fn provision_server(&self, server: &Server) -> Result<bool> {
        for attempt in 1..=SETUP_ATTEMPTS {
            match self.setup_attempt(server).await {
                Ok(()) => {
                    let ip = server.ip.clone().unwrap_or_default();
                    self.notifier
                        .notify(Notification::ServerProvisioned {
                            server_id: server.id,
                            ip: ip.clone(),
                            protocol: Protocol::Vless,
                            detail: format!(
                                "management panel at https://{ip}:{}",
                                self.panel_port
                            ),
                        })
                        .await;
                    return Ok(true);
                }
                Err(error) => {
                    tracing::error!(
                        server_id = server.id,
                        attempt,
                        %error,
                        "panel setup attempt failed"
                    );
                    if attempt > 1 {
                        self.notifier
                            .notify(Notification::OperationalError {
                                context: format!(
                                    "panel setup on server {} attempt {attempt}/{SETUP_ATTEMPTS}: {error}",
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

impl std::fmt::Debug for VlessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlessBackend")
            .field("admin_user", &self.admin_user)
            .field("panel_port", &self.panel_port)
            .finish_non_exhaustive()
    }
}
