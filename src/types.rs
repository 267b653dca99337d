use serde::{Deserialize, Serialize};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Extra headroom granted on top of a key's current usage by
/// [`extend_quota_headroom`](crate::backends::VpnBackend::extend_quota_headroom).
pub const QUOTA_HEADROOM_BYTES: u64 = 200 * GIB;

/// Supported key backends. Each protocol has its own control-plane wire API
/// and its own server daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Outline,
    Vless,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Outline, Protocol::Vless];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Outline => "outline",
            Protocol::Vless => "vless",
        }
    }

    pub fn parse(value: &str) -> Option<Protocol> {
        match value.to_ascii_lowercase().as_str() {
            "outline" => Some(Protocol::Outline),
            "vless" => Some(Protocol::Vless),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assigned once when a server row is created and never re-derived: the first
/// two servers of a protocol are the smaller class, later ones the larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityClass {
    Standard,
    Large,
}

impl CapacityClass {
    pub fn limit(&self) -> i64 {
        match self {
            CapacityClass::Standard => 100,
            CapacityClass::Large => 200,
        }
    }

    pub fn for_census(existing_servers: i64) -> CapacityClass {
        if existing_servers < 2 {
            CapacityClass::Standard
        } else {
            CapacityClass::Large
        }
    }

    pub(crate) fn from_i64(value: i64) -> CapacityClass {
        if value <= 100 {
            CapacityClass::Standard
        } else {
            CapacityClass::Large
        }
    }
}

/// A provisioned VPN host. Endpoint credentials are per protocol: VLESS
/// servers carry `ip` + `password` (panel login), Outline servers carry
/// `api_url` + `cert_sha256` (management API). Rows are owned by the ledger
/// store; values passed around are transient views.
#[derive(Clone)]
pub struct Server {
    pub id: i64,
    pub protocol: Protocol,
    pub ip: Option<String>,
    pub password: Option<String>,
    pub api_url: Option<String>,
    pub cert_sha256: Option<String>,
    pub active_key_count: i64,
    pub capacity_class: CapacityClass,
}

impl Server {
    pub fn at_capacity(&self) -> bool {
        self.active_key_count >= self.capacity_class.limit()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("ip", &self.ip)
            .field("password", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("active_key_count", &self.active_key_count)
            .field("capacity_class", &self.capacity_class)
            .finish()
    }
}

/// An issued key as persisted in the ledger. Timestamps are unix seconds UTC.
#[derive(Debug, Clone)]
pub struct Key {
    pub key_id: String,
    pub owner_id: String,
    pub protocol: Protocol,
    pub server_id: i64,
    pub name: String,
    pub start_ts: i64,
    /// None for keys issued without an expiry (admin-granted); such keys are
    /// skipped by the expiry sweep and cannot be extended.
    pub expiration_ts: Option<i64>,
    pub quota_bytes: u64,
    pub used_bytes_checkpoint: u64,
}

#[derive(Debug, Clone)]
pub struct Owner {
    pub owner_id: String,
    pub trial_period_used: bool,
}

/// Live view of a key as reported by a backend: ledger fields merged with the
/// control plane's current usage counter (cumulative, never reset remotely).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub key_id: String,
    pub name: String,
    pub access_url: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
}

/// How long a newly issued key lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    /// Fixed 2-day window; one per owner, ever.
    Trial,
    /// Paid period, 30 days per month.
    Months(u32),
}

impl Term {
    pub fn days(&self) -> i64 {
        match self {
            Term::Trial => 2,
            Term::Months(months) => 30 * i64::from(*months),
        }
    }
}

pub(crate) const SECS_PER_HOUR: i64 = 3600;
pub(crate) const SECS_PER_DAY: i64 = 86_400;

pub(crate) fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Truncates to the top of the hour (issue/expiry normalization).
pub(crate) fn truncate_to_hour(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECS_PER_HOUR)
}

/// Truncates to midnight UTC (expiry and age comparisons are day-granular).
pub(crate) fn truncate_to_day(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECS_PER_DAY)
}

pub(crate) fn days_between(earlier_ts: i64, later_ts: i64) -> i64 {
    (truncate_to_day(later_ts) - truncate_to_day(earlier_ts)) / SECS_PER_DAY
}
