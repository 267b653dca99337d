pub mod backends;
pub mod cloud;
pub mod config;
mod error;
pub mod jobs;
pub mod ledger;
mod names;
pub mod notify;
pub mod pool;
pub mod provision;
pub mod shell;
pub mod store;
pub mod types;

pub use error::{Error, Result};

pub use backends::{BackendSet, OutlineBackend, VlessBackend, VpnBackend};
pub use cloud::CloudClient;
pub use config::{CloudConfig, Config, NotifyConfig, PanelConfig};
pub use jobs::JobScheduler;
pub use ledger::{IssuedKey, KeyLedger};
pub use notify::{ChatNotifier, Notification, Notifier, NullNotifier};
pub use pool::PoolRegistry;
pub use provision::Provisioner;
pub use shell::{RemoteShell, ShellOutput, SshShell};
pub use store::LedgerStore;
pub use types::{
    CapacityClass, GIB, Key, KeyRecord, Owner, Protocol, QUOTA_HEADROOM_BYTES, Server, Term,
};
