use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("store worker error: {0}")]
    StoreJoin(#[from] tokio::task::JoinError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("server not found: {0}")]
    ServerNotFound(i64),
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),
    #[error("quota operation failed for key {0}")]
    QuotaOperationFailed(String),
    #[error("trial period already used by owner {0}")]
    TrialAlreadyUsed(String),
}

impl Error {
    /// True for failures talking to a remote control plane (network or
    /// non-2xx), as opposed to local/ledger failures.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::Api { .. } | Error::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
