//! Server pool allocation. One process-wide mutex serializes every
//! "pick or provision" decision: capacity bookkeeping is only correct when
//! the read that decided to provision and the count increment cannot
//! interleave with another allocation, and a provisioning run that takes
//! minutes must not be started twice for the same demand spike.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::notify::{Notification, Notifier};
use crate::provision::Provisioner;
use crate::store::LedgerStore;
use crate::types::{Protocol, Server};
use crate::Result;

/// How long a caller waits before being told the pool is busy. The request
/// still completes; it queues behind the mutex.
const CONTENTION_WAIT: Duration = Duration::from_secs(1);

pub struct PoolRegistry {
    store: LedgerStore,
    provisioner: Arc<Provisioner>,
    notifier: Arc<dyn Notifier>,
    allocation_lock: Mutex<()>,
}

impl PoolRegistry {
    pub fn new(
        store: LedgerStore,
        provisioner: Arc<Provisioner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            provisioner,
            notifier,
            allocation_lock: Mutex::new(()),
        }
    }

    /// Picks the least-loaded server with free capacity, or grows the pool
    /// when none qualifies. The returned server's count already includes the
    /// reservation for the key about to be minted.
    pub async fn select_server_for_new_key(
        &self,
        protocol: Protocol,
        requester: Option<&str>,
    ) -> Result<Server> {
        let _guard = self.acquire_allocation_lock(requester).await;

        if let Some(server) = self.store.select_and_reserve(protocol).await? {
            tracing::debug!(
                %protocol,
                server_id = server.id,
                active_key_count = server.active_key_count,
                "reserved slot on existing server"
            );
            return Ok(server);
        }

        tracing::info!(%protocol, "pool saturated, provisioning a new server");
        let server = self.provisioner.provision_new_server(protocol).await?;
        self.store.reserve_server(server.id).await
    }

    /// Compensates a reservation whose key creation failed downstream.
    pub async fn release_server(&self, server_id: i64) -> Result<()> {
        self.store.release_server(server_id).await
    }

    /// Periodic headroom check: a protocol whose every server sits at its
    /// limit gets one server built ahead of demand. An empty pool counts as
    /// saturated, so this also bootstraps the first server of each protocol.
    pub async fn top_up_capacity(&self) -> Result<()> {
        for protocol in Protocol::ALL {
            if !self.store.all_at_capacity(protocol).await? {
                continue;
            }
            let _guard = self.allocation_lock.lock().await;
            // Re-check: an allocation that ran while we waited may have
            // already grown the pool.
            if !self.store.all_at_capacity(protocol).await? {
                continue;
            }
            tracing::info!(%protocol, "topping up saturated pool");
            if let Err(error) = self.provisioner.provision_new_server(protocol).await {
                tracing::error!(%protocol, %error, "capacity top-up failed");
            }
        }
        Ok(())
    }

    /// Takes the global allocation mutex. A caller that still finds it held
    /// after a short wait gets a queued-under-load notice, then blocks until
    /// its turn comes.
    async fn acquire_allocation_lock(
        &self,
        requester: Option<&str>,
    ) -> tokio::sync::MutexGuard<'_, ()> {
        if let Ok(guard) = self.allocation_lock.try_lock() {
            return guard;
        }
        tokio::time::sleep(CONTENTION_WAIT).await;
        if let Ok(guard) = self.allocation_lock.try_lock() {
            return guard;
        }
        if let Some(owner_id) = requester {
            self.notifier
                .notify(Notification::HighLoad {
                    owner_id: owner_id.to_string(),
                })
                .await;
        }
        self.allocation_lock.lock().await
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}
