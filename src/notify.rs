//! One-way notification sink. Operational alerts go to the admin channel,
//! owner-facing notices go to the owner's chat. Delivery is best effort;
//! failures are logged and never propagate into the calling flow.

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::backends::http::send_checked;
use crate::config::NotifyConfig;
use crate::types::Protocol;

#[derive(Clone, Debug)]
pub enum Notification {
    /// A new VPN host joined the pool.
    ServerProvisioned {
        server_id: i64,
        ip: String,
        protocol: Protocol,
        detail: String,
    },
    /// Something went wrong that an operator should look at.
    OperationalError { context: String },
    /// A renewal payment was applied to a key.
    PaymentReceived { owner_id: String, key_name: String },
    /// Aggregated per owner: these keys stop working within two days.
    SubscriptionExpiring {
        owner_id: String,
        key_names: Vec<String>,
    },
    /// Allocation is queued behind an in-flight provisioning run.
    HighLoad { owner_id: String },
}

impl Notification {
    fn render(&self) -> String {
        match self {
            Notification::ServerProvisioned {
                server_id,
                ip,
                protocol,
                detail,
            } => format!("new {protocol} server #{server_id} provisioned at {ip}: {detail}"),
            Notification::OperationalError { context } => {
                format!("operational error: {context}")
            }
            Notification::PaymentReceived { owner_id, key_name } => {
                format!("payment received from {owner_id} for key \"{key_name}\"")
            }
            Notification::SubscriptionExpiring { key_names, .. } => format!(
                "your keys expire within 2 days: {}. Renew to keep access.",
                key_names.join(", ")
            ),
            Notification::HighLoad { .. } => {
                "High load right now. Your request is queued and should complete \
                 within ~7 minutes."
                    .to_string()
            }
        }
    }

    /// Owner-facing notifications carry the chat to address; everything else
    /// goes to the admin channel.
    fn owner_chat(&self) -> Option<&str> {
        match self {
            Notification::SubscriptionExpiring { owner_id, .. }
            | Notification::HighLoad { owner_id } => Some(owner_id),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fire and forget. Implementations swallow delivery errors.
    async fn notify(&self, notification: Notification);
}

/// Sends notifications as chat messages through a bot HTTP gateway.
pub struct ChatNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    admin_chat_ids: Vec<i64>,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

impl ChatNotifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            admin_chat_ids: config.admin_chat_ids.clone(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        send_checked(
            self.client
                .post(url)
                .json(&SendMessageRequest { chat_id, text }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn notify(&self, notification: Notification) {
        let text = notification.render();
        let targets: Vec<i64> = match notification.owner_chat() {
            Some(owner_id) => match owner_id.parse::<i64>() {
                Ok(chat_id) => vec![chat_id],
                Err(_) => {
                    tracing::warn!(owner_id, "owner id is not a chat id, dropping notice");
                    return;
                }
            },
            None => self.admin_chat_ids.clone(),
        };
        for chat_id in targets {
            if let Err(error) = self.send_message(chat_id, &text).await {
                tracing::warn!(chat_id, %error, "failed to deliver notification");
            }
        }
    }
}

impl std::fmt::Debug for ChatNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatNotifier")
            .field("api_base", &self.api_base)
            .field("token", &"<redacted>")
            .field("admin_chat_ids", &self.admin_chat_ids)
            .finish()
    }
}

/// Discards everything. Used where no chat gateway is configured.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _notification: Notification) {}
}
