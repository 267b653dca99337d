//! Persisted ledger: owners, servers, and issued keys in one SQLite file.
//!
//! All access goes through `spawn_blocking` workers; every mutation runs in a
//! transaction so a mid-mutation failure never leaves partial writes visible.
//! The store is the single source of truth; `Server`/`Key` values returned
//! from here are transient views.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::types::{CapacityClass, Key, Owner, Protocol, Server};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<()> {
        self.with_conn(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }

    // ---- owners ----

    pub async fn owner(&self, owner_id: &str) -> Result<Option<Owner>> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT owner_id, trial_period_used FROM owners WHERE owner_id = ?1",
                    rusqlite::params![owner_id],
                    |row| {
                        Ok(Owner {
                            owner_id: row.get(0)?,
                            trial_period_used: row.get::<_, i64>(1)? != 0,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn trial_period_used(&self, owner_id: &str) -> Result<bool> {
        Ok(self
            .owner(owner_id)
            .await?
            .map(|owner| owner.trial_period_used)
            .unwrap_or(false))
    }

    /// Marks the owner's trial as used, creating the owner row if needed.
    /// Returns true when this call performed the false→true transition;
    /// a second claim (concurrent or later) observes false. The claim happens
    /// before the trial key is minted, which closes the duplicate-trial race.
    pub async fn claim_trial(&self, owner_id: &str) -> Result<bool> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO owners (owner_id, trial_period_used) VALUES (?1, 0)",
                rusqlite::params![owner_id],
            )?;
            let claimed = tx.execute(
                "UPDATE owners SET trial_period_used = 1
                 WHERE owner_id = ?1 AND trial_period_used = 0",
                rusqlite::params![owner_id],
            )?;
            tx.commit()?;
            Ok(claimed == 1)
        })
        .await
    }

    pub async fn list_owner_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT owner_id FROM owners ORDER BY owner_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    // ---- servers ----

    /// Persists a new server row with `active_key_count = 0`. The capacity
    /// class is assigned from the per-protocol census at insert time and
    /// never re-derived.
    pub async fn insert_server(
        &self,
        protocol: Protocol,
        ip: Option<String>,
        password: Option<String>,
    ) -> Result<Server> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let census: i64 = tx.query_row(
                "SELECT COUNT(*) FROM servers WHERE protocol = ?1",
                rusqlite::params![protocol.as_str()],
                |row| row.get(0),
            )?;
            let class = CapacityClass::for_census(census);
            tx.execute(
                "INSERT INTO servers (protocol, ip, password, api_url, cert_sha256,
                                      active_key_count, capacity_class)
                 VALUES (?1, ?2, ?3, NULL, NULL, 0, ?4)",
                rusqlite::params![protocol.as_str(), ip, password, class.limit()],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(Server {
                id,
                protocol,
                ip,
                password,
                api_url: None,
                cert_sha256: None,
                active_key_count: 0,
                capacity_class: class,
            })
        })
        .await
    }

    /// Records the management endpoint produced by the installer (Outline).
    pub async fn update_server_endpoint(
        &self,
        server_id: i64,
        api_url: &str,
        cert_sha256: &str,
    ) -> Result<()> {
        let api_url = api_url.to_string();
        let cert_sha256 = cert_sha256.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE servers SET api_url = ?2, cert_sha256 = ?3 WHERE id = ?1",
                rusqlite::params![server_id, api_url, cert_sha256],
            )?;
            if updated == 0 {
                return Err(Error::ServerNotFound(server_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn server(&self, server_id: i64) -> Result<Server> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, protocol, ip, password, api_url, cert_sha256,
                        active_key_count, capacity_class
                 FROM servers WHERE id = ?1",
                rusqlite::params![server_id],
                server_from_row,
            )
            .optional()?
            .ok_or(Error::ServerNotFound(server_id))
        })
        .await
    }

    pub async fn list_servers(&self, protocol: Protocol) -> Result<Vec<Server>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, protocol, ip, password, api_url, cert_sha256,
                        active_key_count, capacity_class
                 FROM servers WHERE protocol = ?1 ORDER BY active_key_count ASC, id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![protocol.as_str()], server_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn count_servers(&self, protocol: Protocol) -> Result<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM servers WHERE protocol = ?1",
                rusqlite::params![protocol.as_str()],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// One transaction: scan the protocol's servers in ascending key-count
    /// order, pick the first under its stored capacity limit, and increment
    /// its count. Returns None when every server is saturated. The immediate
    /// write transaction is the storage-level row lock that keeps the
    /// capacity read and the reservation atomic against other writers.
    pub async fn select_and_reserve(&self, protocol: Protocol) -> Result<Option<Server>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let picked = {
                let mut stmt = tx.prepare(
                    "SELECT id, protocol, ip, password, api_url, cert_sha256,
                            active_key_count, capacity_class
                     FROM servers WHERE protocol = ?1
                     ORDER BY active_key_count ASC, id ASC",
                )?;
                let rows =
                    stmt.query_map(rusqlite::params![protocol.as_str()], server_from_row)?;
                let mut picked = None;
                for row in rows {
                    let server = row?;
                    if !server.at_capacity() {
                        picked = Some(server);
                        break;
                    }
                }
                picked
            };
            let Some(mut server) = picked else {
                tx.commit()?;
                return Ok(None);
            };
            tx.execute(
                "UPDATE servers SET active_key_count = active_key_count + 1 WHERE id = ?1",
                rusqlite::params![server.id],
            )?;
            tx.commit()?;
            server.active_key_count += 1;
            Ok(Some(server))
        })
        .await
    }

    /// Increments the count of a specific server (used right after
    /// provisioning a fresh one) and returns the updated row.
    pub async fn reserve_server(&self, server_id: i64) -> Result<Server> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE servers SET active_key_count = active_key_count + 1 WHERE id = ?1",
                rusqlite::params![server_id],
            )?;
            if updated == 0 {
                return Err(Error::ServerNotFound(server_id));
            }
            let server = tx.query_row(
                "SELECT id, protocol, ip, password, api_url, cert_sha256,
                        active_key_count, capacity_class
                 FROM servers WHERE id = ?1",
                rusqlite::params![server_id],
                server_from_row,
            )?;
            tx.commit()?;
            Ok(server)
        })
        .await
    }

    /// Compensating decrement for a reservation whose key never materialized.
    pub async fn release_server(&self, server_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE servers SET active_key_count = MAX(0, active_key_count - 1)
                 WHERE id = ?1",
                rusqlite::params![server_id],
            )?;
            Ok(())
        })
        .await
    }

    /// True when the protocol has no server below its capacity limit.
    /// Vacuously true for an empty pool, so the capacity top-up also
    /// bootstraps the first server of a protocol.
    pub async fn all_at_capacity(&self, protocol: Protocol) -> Result<bool> {
        Ok(self
            .list_servers(protocol)
            .await?
            .iter()
            .all(Server::at_capacity))
    }

    // ---- keys ----

    /// Persists an issued key, creating the owner row when absent.
    pub async fn insert_key(&self, key: &Key) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO owners (owner_id, trial_period_used) VALUES (?1, 0)",
                rusqlite::params![key.owner_id],
            )?;
            tx.execute(
                "INSERT INTO keys (key_id, owner_id, protocol, server_id, name,
                                   start_ts, expiration_ts, quota_bytes, used_bytes_checkpoint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    key.key_id,
                    key.owner_id,
                    key.protocol.as_str(),
                    key.server_id,
                    key.name,
                    key.start_ts,
                    key.expiration_ts,
                    bytes_to_i64(key.quota_bytes),
                    bytes_to_i64(key.used_bytes_checkpoint),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn key(&self, key_id: &str) -> Result<Option<Key>> {
        let key_id = key_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT key_id, owner_id, protocol, server_id, name,
                            start_ts, expiration_ts, quota_bytes, used_bytes_checkpoint
                     FROM keys WHERE key_id = ?1",
                    rusqlite::params![key_id],
                    key_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn list_keys(&self) -> Result<Vec<Key>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key_id, owner_id, protocol, server_id, name,
                        start_ts, expiration_ts, quota_bytes, used_bytes_checkpoint
                 FROM keys ORDER BY key_id",
            )?;
            let rows = stmt.query_map([], key_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn keys_for_owner(&self, owner_id: &str) -> Result<Vec<Key>> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key_id, owner_id, protocol, server_id, name,
                        start_ts, expiration_ts, quota_bytes, used_bytes_checkpoint
                 FROM keys WHERE owner_id = ?1 ORDER BY key_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![owner_id], key_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn rename_key(&self, key_id: &str, new_name: &str) -> Result<bool> {
        let key_id = key_id.to_string();
        let new_name = new_name.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE keys SET name = ?2 WHERE key_id = ?1",
                rusqlite::params![key_id, new_name],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Pushes the expiration forward by whole days and returns the new
    /// timestamp. Fails with `KeyNotFound` when the key is absent or carries
    /// no expiration.
    pub async fn extend_expiration(&self, key_id: &str, add_days: i64) -> Result<i64> {
        let key_id = key_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let expiration: Option<Option<i64>> = tx
                .query_row(
                    "SELECT expiration_ts FROM keys WHERE key_id = ?1",
                    rusqlite::params![key_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(Some(expiration)) = expiration else {
                return Err(Error::KeyNotFound(key_id));
            };
            let new_expiration = expiration + add_days * crate::types::SECS_PER_DAY;
            tx.execute(
                "UPDATE keys SET expiration_ts = ?2 WHERE key_id = ?1",
                rusqlite::params![key_id, new_expiration],
            )?;
            tx.commit()?;
            Ok(new_expiration)
        })
        .await
    }

    pub async fn update_quota(&self, key_id: &str, quota_bytes: u64) -> Result<()> {
        let key_id = key_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE keys SET quota_bytes = ?2 WHERE key_id = ?1",
                rusqlite::params![key_id, bytes_to_i64(quota_bytes)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_usage_checkpoint(&self, key_id: &str, used_bytes: u64) -> Result<()> {
        let key_id = key_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE keys SET used_bytes_checkpoint = ?2 WHERE key_id = ?1",
                rusqlite::params![key_id, bytes_to_i64(used_bytes)],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes the key row and decrements its server's count in the same
    /// transaction; the two always move together.
    pub async fn remove_key(&self, key_id: &str) -> Result<bool> {
        let key_id = key_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let server_id: Option<i64> = tx
                .query_row(
                    "SELECT server_id FROM keys WHERE key_id = ?1",
                    rusqlite::params![key_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(server_id) = server_id else {
                tx.commit()?;
                return Ok(false);
            };
            tx.execute("DELETE FROM keys WHERE key_id = ?1", rusqlite::params![key_id])?;
            tx.execute(
                "UPDATE servers SET active_key_count = MAX(0, active_key_count - 1)
                 WHERE id = ?1",
                rusqlite::params![server_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Copies the ledger file to the configured backup location.
    pub async fn backup_to(&self, destination: impl AsRef<Path>) -> Result<()> {
        tokio::fs::copy(&self.path, destination.as_ref()).await?;
        Ok(())
    }
}

fn server_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Server> {
    let protocol: String = row.get(1)?;
    Ok(Server {
        id: row.get(0)?,
        protocol: Protocol::parse(&protocol).unwrap_or(Protocol::Outline),
        ip: row.get(2)?,
        password: row.get(3)?,
        api_url: row.get(4)?,
        cert_sha256: row.get(5)?,
        active_key_count: row.get(6)?,
        capacity_class: CapacityClass::from_i64(row.get(7)?),
    })
}

fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Key> {
    let protocol: String = row.get(2)?;
    Ok(Key {
        key_id: row.get(0)?,
        owner_id: row.get(1)?,
        protocol: Protocol::parse(&protocol).unwrap_or(Protocol::Outline),
        server_id: row.get(3)?,
        name: row.get(4)?,
        start_ts: row.get(5)?,
        expiration_ts: row.get(6)?,
        quota_bytes: i64_to_bytes(row.get(7)?),
        used_bytes_checkpoint: i64_to_bytes(row.get(8)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS owners (
            owner_id TEXT PRIMARY KEY NOT NULL,
            trial_period_used INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            protocol TEXT NOT NULL,
            ip TEXT,
            password TEXT,
            api_url TEXT,
            cert_sha256 TEXT,
            active_key_count INTEGER NOT NULL DEFAULT 0,
            capacity_class INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_servers_protocol_count
            ON servers(protocol, active_key_count);

        CREATE TABLE IF NOT EXISTS keys (
            key_id TEXT PRIMARY KEY NOT NULL,
            owner_id TEXT NOT NULL REFERENCES owners(owner_id),
            protocol TEXT NOT NULL,
            server_id INTEGER NOT NULL REFERENCES servers(id),
            name TEXT NOT NULL,
            start_ts INTEGER NOT NULL,
            expiration_ts INTEGER,
            quota_bytes INTEGER NOT NULL DEFAULT 0,
            used_bytes_checkpoint INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_keys_owner ON keys(owner_id);
        CREATE INDEX IF NOT EXISTS idx_keys_server ON keys(server_id);",
    )
}

fn open_connection(path: PathBuf) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn bytes_to_i64(bytes: u64) -> i64 {
    if bytes > i64::MAX as u64 {
        i64::MAX
    } else {
        bytes as i64
    }
}

fn i64_to_bytes(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ts;

    async fn fresh_store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    fn sample_key(key_id: &str, owner: &str, server_id: i64, expiration_ts: Option<i64>) -> Key {
        Key {
            key_id: key_id.to_string(),
            owner_id: owner.to_string(),
            protocol: Protocol::Outline,
            server_id,
            name: "quiet falcon".to_string(),
            start_ts: now_ts(),
            expiration_ts,
            quota_bytes: 200 * crate::types::GIB,
            used_bytes_checkpoint: 0,
        }
    }

    #[tokio::test]
    async fn capacity_class_assigned_from_census() {
        let (_dir, store) = fresh_store().await;
        let first = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("first");
        let second = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("second");
        let third = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("third");
        // Other protocols have their own census.
        let vless_first = store
            .insert_server(Protocol::Vless, Some("10.0.0.1".into()), Some("pw".into()))
            .await
            .expect("vless first");

        assert_eq!(first.capacity_class, CapacityClass::Standard);
        assert_eq!(second.capacity_class, CapacityClass::Standard);
        assert_eq!(third.capacity_class, CapacityClass::Large);
        assert_eq!(vless_first.capacity_class, CapacityClass::Standard);
    }

    #[tokio::test]
    async fn select_and_reserve_picks_least_loaded_and_increments() {
        let (_dir, store) = fresh_store().await;
        let a = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("a");
        let b = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("b");
        // Load server a ahead of b.
        store.reserve_server(a.id).await.expect("load a");

        let picked = store
            .select_and_reserve(Protocol::Outline)
            .await
            .expect("reserve")
            .expect("a server qualifies");
        assert_eq!(picked.id, b.id);
        assert_eq!(picked.active_key_count, 1);
    }

    #[tokio::test]
    async fn select_and_reserve_returns_none_when_saturated() {
        let (_dir, store) = fresh_store().await;
        let server = store
            .insert_server(Protocol::Vless, Some("10.0.0.1".into()), Some("pw".into()))
            .await
            .expect("server");
        for _ in 0..server.capacity_class.limit() {
            store.reserve_server(server.id).await.expect("fill");
        }
        assert!(store.all_at_capacity(Protocol::Vless).await.expect("all full"));
        let picked = store
            .select_and_reserve(Protocol::Vless)
            .await
            .expect("reserve");
        assert!(picked.is_none());
        // Count never exceeds the limit.
        let row = store.server(server.id).await.expect("row");
        assert_eq!(row.active_key_count, row.capacity_class.limit());
    }

    #[tokio::test]
    async fn all_at_capacity_is_vacuously_true_for_empty_pool() {
        let (_dir, store) = fresh_store().await;
        assert!(store.all_at_capacity(Protocol::Outline).await.expect("empty"));
    }

    #[tokio::test]
    async fn trial_claim_happens_exactly_once_under_concurrency() {
        let (_dir, store) = fresh_store().await;
        let first = store.claim_trial("owner-1");
        let second = store.claim_trial("owner-1");
        let (first, second) = tokio::join!(first, second);
        let wins = [first.expect("first"), second.expect("second")]
            .iter()
            .filter(|won| **won)
            .count();
        assert_eq!(wins, 1);
        assert!(store.trial_period_used("owner-1").await.expect("used"));
    }

    #[tokio::test]
    async fn remove_key_deletes_row_and_decrements_server_count() {
        let (_dir, store) = fresh_store().await;
        let server = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("server");
        let server = store.reserve_server(server.id).await.expect("reserve");
        assert_eq!(server.active_key_count, 1);

        store
            .insert_key(&sample_key("k-1", "owner-1", server.id, Some(now_ts())))
            .await
            .expect("insert");
        assert!(store.remove_key("k-1").await.expect("remove"));
        let row = store.server(server.id).await.expect("row");
        assert_eq!(row.active_key_count, 0);
        assert!(store.key("k-1").await.expect("lookup").is_none());

        // Removing again is a no-op, and the count stays at zero.
        assert!(!store.remove_key("k-1").await.expect("second remove"));
        let row = store.server(server.id).await.expect("row");
        assert_eq!(row.active_key_count, 0);
    }

    #[tokio::test]
    async fn extend_expiration_requires_an_expiring_key() {
        let (_dir, store) = fresh_store().await;
        let server = store
            .insert_server(Protocol::Outline, None, None)
            .await
            .expect("server");
        let base = crate::types::truncate_to_hour(now_ts());
        store
            .insert_key(&sample_key("k-exp", "owner-1", server.id, Some(base)))
            .await
            .expect("insert");
        store
            .insert_key(&sample_key("k-none", "owner-1", server.id, None))
            .await
            .expect("insert");

        let extended = store.extend_expiration("k-exp", 30).await.expect("extend");
        assert_eq!(extended, base + 30 * crate::types::SECS_PER_DAY);

        assert!(matches!(
            store.extend_expiration("k-none", 30).await,
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            store.extend_expiration("k-missing", 30).await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn quota_and_checkpoint_round_trip() {
        let (_dir, store) = fresh_store().await;
        let server = store
            .insert_server(Protocol::Vless, Some("10.0.0.1".into()), Some("pw".into()))
            .await
            .expect("server");
        store
            .insert_key(&sample_key("k-1", "owner-1", server.id, Some(now_ts())))
            .await
            .expect("insert");
        store
            .update_quota("k-1", 230 * crate::types::GIB)
            .await
            .expect("quota");
        store
            .set_usage_checkpoint("k-1", 50 * crate::types::GIB)
            .await
            .expect("checkpoint");
        let key = store.key("k-1").await.expect("lookup").expect("present");
        assert_eq!(key.quota_bytes, 230 * crate::types::GIB);
        assert_eq!(key.used_bytes_checkpoint, 50 * crate::types::GIB);
    }
}
