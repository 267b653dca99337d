//! Key lifecycle on top of the pool and the backends: issuance, lookup,
//! renewal, deletion, and the periodic reconciliation sweeps. The persisted
//! ledger is authoritative; remote state is reconciled best effort.

use std::sync::Arc;

use crate::backends::BackendSet;
use crate::notify::{Notification, Notifier};
use crate::pool::PoolRegistry;
use crate::store::LedgerStore;
use crate::types::{
    Key, KeyRecord, Protocol, Server, Term, days_between, now_ts, truncate_to_day,
    truncate_to_hour, SECS_PER_DAY,
};
use crate::{Error, Result};

/// A freshly issued key: the persisted row plus the backend record carrying
/// the shareable access URL.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: Key,
    pub record: KeyRecord,
}

pub struct KeyLedger {
    store: LedgerStore,
    pool: Arc<PoolRegistry>,
    backends: Arc<BackendSet>,
    notifier: Arc<dyn Notifier>,
}

impl KeyLedger {
    pub fn new(
        store: LedgerStore,
        pool: Arc<PoolRegistry>,
        backends: Arc<BackendSet>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            pool,
            backends,
            notifier,
        }
    }

    /// Issues a new key for the owner. Trial terms claim the owner's single
    /// trial slot before anything is minted, so a concurrent duplicate
    /// request loses the claim instead of minting a second trial key.
    pub async fn issue_key(
        &self,
        owner_id: &str,
        protocol: Protocol,
        quota_bytes: u64,
        term: Term,
    ) -> Result<IssuedKey> {
        if matches!(term, Term::Trial) && !self.store.claim_trial(owner_id).await? {
            return Err(Error::TrialAlreadyUsed(owner_id.to_string()));
        }

        let server = self
            .pool
            .select_server_for_new_key(protocol, Some(owner_id))
            .await?;

        let record = match self
            .backends
            .get(protocol)
            .create_key(&server, quota_bytes)
            .await
        {
            Ok(record) => record,
            Err(error) => {
                // The reservation was taken before the mint; give it back.
                if let Err(release_error) = self.pool.release_server(server.id).await {
                    tracing::error!(
                        server_id = server.id,
                        %release_error,
                        "failed to release reservation after mint failure"
                    );
                }
                return Err(error);
            }
        };

        let start_ts = truncate_to_hour(now_ts());
        let key = Key {
            key_id: record.key_id.clone(),
            owner_id: owner_id.to_string(),
            protocol,
            server_id: server.id,
            name: record.name.clone(),
            start_ts,
            expiration_ts: Some(start_ts + term.days() * SECS_PER_DAY),
            quota_bytes,
            used_bytes_checkpoint: 0,
        };
        self.store.insert_key(&key).await?;
        tracing::info!(
            key_id = key.key_id,
            owner_id,
            %protocol,
            server_id = server.id,
            "issued key"
        );
        Ok(IssuedKey { key, record })
    }

    async fn key_and_server(&self, key_id: &str) -> Result<(Key, Server)> {
        let key = self
            .store
            .key(key_id)
            .await?
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))?;
        let server = self.store.server(key.server_id).await?;
        Ok((key, server))
    }

    /// Live name, quota, and usage as the backend reports them.
    pub async fn get_key_info(&self, key_id: &str) -> Result<KeyRecord> {
        let (key, server) = self.key_and_server(key_id).await?;
        self.backends
            .get(key.protocol)
            .get_key_info(&server, key_id)
            .await
    }

    pub async fn rename_key(&self, key_id: &str, new_name: &str) -> Result<()> {
        let (key, server) = self.key_and_server(key_id).await?;
        self.backends
            .get(key.protocol)
            .rename_key(&server, key_id, new_name)
            .await?;
        self.store.rename_key(key_id, new_name).await?;
        Ok(())
    }

    /// Removes the key everywhere. The remote delete is best effort: when
    /// the backend call fails, the local row is removed anyway and the
    /// remote key is left orphaned rather than blocking cleanup.
    pub async fn delete_key(&self, key_id: &str) -> Result<bool> {
        let Some(key) = self.store.key(key_id).await? else {
            return Ok(false);
        };
        let server = self.store.server(key.server_id).await?;
        match self
            .backends
            .get(key.protocol)
            .delete_key(&server, key_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key_id, server_id = server.id, "key already absent remotely");
            }
            Err(error) => {
                tracing::warn!(key_id, server_id = server.id, %error, "remote delete failed");
            }
        }
        self.store.remove_key(key_id).await
    }

    /// Applies a renewal: pushes the expiry forward and alerts the operator
    /// channel about the payment. Fails when the key is absent or carries no
    /// expiration.
    pub async fn extend_expiration(&self, key_id: &str, add_days: i64) -> Result<i64> {
        let (key, _) = self.key_and_server(key_id).await?;
        let new_expiration = self.store.extend_expiration(key_id, add_days).await?;
        self.notifier
            .notify(Notification::PaymentReceived {
                owner_id: key.owner_id,
                key_name: key.name,
            })
            .await;
        Ok(new_expiration)
    }

    pub async fn update_quota(&self, key_id: &str, quota_bytes: u64) -> Result<u64> {
        let (key, server) = self.key_and_server(key_id).await?;
        let applied = self
            .backends
            .get(key.protocol)
            .update_quota(&server, key_id, quota_bytes, Some(&key.name))
            .await?;
        self.store.update_quota(key_id, applied).await?;
        Ok(applied)
    }

    /// Grants 200 GiB of headroom above whatever the key has consumed.
    pub async fn extend_quota_headroom(&self, key_id: &str) -> Result<u64> {
        let (key, server) = self.key_and_server(key_id).await?;
        let new_quota = self
            .backends
            .get(key.protocol)
            .extend_quota_headroom(&server, key_id)
            .await?;
        self.store.update_quota(key_id, new_quota).await?;
        Ok(new_quota)
    }

    pub async fn keys_for_owner(&self, owner_id: &str) -> Result<Vec<Key>> {
        self.store.keys_for_owner(owner_id).await
    }

    // ---- reconciliation sweeps ----

    /// Daily: removes every key whose expiry day has passed. Remote deletes
    /// that fail are alerted but never block the local removal and the
    /// server-count decrement.
    pub async fn expire_keys(&self) -> Result<usize> {
        let today = truncate_to_day(now_ts());
        let mut expired = 0;
        for key in self.store.list_keys().await? {
            let Some(expiration_ts) = key.expiration_ts else {
                continue;
            };
            if truncate_to_day(expiration_ts) > today {
                continue;
            }
            let remote = match self.store.server(key.server_id).await {
                Ok(server) => {
                    self.backends
                        .get(key.protocol)
                        .delete_key(&server, &key.key_id)
                        .await
                }
                Err(error) => Err(error),
            };
            match remote {
                Ok(true) => {}
                // The backend already lost the key; nothing to clean up there.
                Ok(false) => {
                    tracing::debug!(key_id = key.key_id, "expired key already absent remotely");
                }
                Err(error) => {
                    tracing::warn!(key_id = key.key_id, %error, "remote expiry delete failed");
                    self.notifier
                        .notify(Notification::OperationalError {
                            context: format!(
                                "expired key {} could not be removed remotely; local row dropped",
                                key.key_id
                            ),
                        })
                        .await;
                }
            }
            self.store.remove_key(&key.key_id).await?;
            expired += 1;
        }
        if expired > 0 {
            tracing::info!(expired, "expiry sweep removed keys");
        }
        Ok(expired)
    }

    /// Twice daily: one aggregated notice per owner for keys that stop
    /// working within the next two days. Already-expired keys are the expiry
    /// sweep's business, not this one's.
    pub async fn notify_expiring(&self) -> Result<usize> {
        let now = now_ts();
        let mut notified = 0;
        for owner_id in self.store.list_owner_ids().await? {
            let mut expiring: Vec<String> = Vec::new();
            for key in self.store.keys_for_owner(&owner_id).await? {
                let Some(expiration_ts) = key.expiration_ts else {
                    continue;
                };
                let days_left = days_between(now, expiration_ts);
                if days_left > 0 && days_left <= 2 {
                    expiring.push(key.name);
                }
            }
            if expiring.is_empty() {
                continue;
            }
            self.notifier
                .notify(Notification::SubscriptionExpiring {
                    owner_id,
                    key_names: expiring,
                })
                .await;
            notified += 1;
        }
        Ok(notified)
    }

    /// Daily: for every key whose age is a positive multiple of 30 days and
    /// that has not expired, rebase the quota forward by the traffic consumed
    /// since the last checkpoint. The remote counter is cumulative and never
    /// resets, so a fresh monthly allowance is granted by raising the limit,
    /// not by zeroing usage.
    pub async fn rollover_quota(&self) -> Result<usize> {
        let now = now_ts();
        let today = truncate_to_day(now);
        let mut rolled = 0;
        for key in self.store.list_keys().await? {
            let age_days = days_between(key.start_ts, now);
            if age_days <= 0 || age_days % 30 != 0 {
                continue;
            }
            if key
                .expiration_ts
                .is_some_and(|expiration_ts| truncate_to_day(expiration_ts) <= today)
            {
                continue;
            }
            if let Err(error) = self.rollover_one(&key).await {
                tracing::error!(key_id = key.key_id, %error, "quota rollover failed for key");
                continue;
            }
            rolled += 1;
        }
        if rolled > 0 {
            tracing::info!(rolled, "quota rollover advanced keys");
        }
        Ok(rolled)
    }

    async fn rollover_one(&self, key: &Key) -> Result<()> {
        let server = self.store.server(key.server_id).await?;
        let backend = self.backends.get(key.protocol);
        let live = backend.get_key_info(&server, &key.key_id).await?;
        let consumed = live.used_bytes.saturating_sub(key.used_bytes_checkpoint);
        let new_quota = key.quota_bytes.saturating_add(consumed);

        backend
            .update_quota(&server, &key.key_id, new_quota, Some(&key.name))
            .await?;
        self.store.update_quota(&key.key_id, new_quota).await?;
        self.store
            .set_usage_checkpoint(&key.key_id, live.used_bytes)
            .await?;
        tracing::debug!(
            key_id = key.key_id,
            consumed,
            new_quota,
            checkpoint = live.used_bytes,
            "rolled quota forward"
        );
        Ok(())
    }
}

impl std::fmt::Debug for KeyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLedger").finish_non_exhaustive()
    }
}
