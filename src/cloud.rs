//! Cloud provider client used to create the virtual machines that become
//! VPN hosts. The API wraps every response in a `{status, status_msg, data}`
//! envelope and hands out a bearer token from an email/password login.

use serde::Serialize;
use tokio::sync::Mutex;

use crate::backends::http::send_checked_json;
use crate::config::CloudConfig;
use crate::{Error, Result};

pub struct CloudClient {
    client: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    datacenter_id: i64,
    server_plan_id: i64,
    template_id: i64,
    token: Mutex<Option<String>>,
}

#[derive(Debug, serde::Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    status_msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    fn into_data(self) -> Result<serde_json::Value> {
        if self.status == "ok" {
            Ok(self.data)
        } else {
            Err(Error::InvalidResponse(format!(
                "cloud api returned status {:?}: {}",
                self.status, self.status_msg
            )))
        }
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct DeployRequest<'a> {
    name: &'a str,
    datacenter: i64,
    #[serde(rename = "server-plan")]
    server_plan: i64,
    template: i64,
    backup: i64,
    ip4: i64,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
            datacenter_id: i64::from(config.datacenter_id),
            server_plan_id: i64::from(config.server_plan_id),
            template_id: i64::from(config.template_id),
            token: Mutex::new(config.token.clone()),
        }
    }

    async fn authenticate(&self) -> Result<String> {
        let envelope: Envelope = send_checked_json(
            self.client
                .post(format!("{}/auth", self.base_url))
                .json(&AuthRequest {
                    email: &self.email,
                    password: &self.password,
                }),
        )
        .await?;
        let data = envelope.into_data()?;
        data["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidResponse("auth response carried no token".to_string()))
    }

    async fn bearer(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if token.is_none() {
            *token = Some(self.authenticate().await?);
        }
        Ok(format!("Bearer {}", token.as_deref().unwrap_or_default()))
    }

    async fn get(&self, endpoint: &str) -> Result<serde_json::Value> {
        let bearer = self.bearer().await?;
        let envelope: Envelope = send_checked_json(
            self.client
                .get(format!("{}{endpoint}", self.base_url))
                .header(reqwest::header::AUTHORIZATION, bearer),
        )
        .await?;
        envelope.into_data()
    }

    /// Orders a new machine with the configured plan and template; returns
    /// the provider's server id. The machine is not usable until its status
    /// becomes `active`.
    pub async fn create_server(&self, name: &str) -> Result<i64> {
        let bearer = self.bearer().await?;
        let envelope: Envelope = send_checked_json(
            self.client
                .post(format!("{}/server", self.base_url))
                .header(reqwest::header::AUTHORIZATION, bearer)
                .json(&DeployRequest {
                    name,
                    datacenter: self.datacenter_id,
                    server_plan: self.server_plan_id,
                    template: self.template_id,
                    backup: 0,
                    ip4: 1,
                }),
        )
        .await?;
        let data = envelope.into_data()?;
        data["id"]
            .as_i64()
            .ok_or_else(|| Error::InvalidResponse("deploy response carried no id".to_string()))
    }

    pub async fn server_status(&self, server_id: i64) -> Result<String> {
        let data = self.get(&format!("/server/{server_id}")).await?;
        Ok(data["status"].as_str().unwrap_or_default().to_string())
    }

    /// First IPv4 address assigned to the machine.
    pub async fn server_ip(&self, server_id: i64) -> Result<String> {
        let data = self.get(&format!("/server/{server_id}")).await?;
        data["ip"][0]["ip"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidResponse(format!("server {server_id} has no ip assigned"))
            })
    }

    pub async fn server_password(&self, server_id: i64) -> Result<String> {
        let data = self.get(&format!("/server.password/{server_id}")).await?;
        data["password"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidResponse(format!("server {server_id} has no root password"))
            })
    }
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient")
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish_non_exhaustive()
    }
}
