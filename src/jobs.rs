//! Background reconciliation loops. Each job runs on its own interval timer
//! inside a spawned task; a failed tick is logged and the loop keeps going.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ledger::KeyLedger;
use crate::pool::PoolRegistry;
use crate::store::LedgerStore;
use crate::Result;

const EXPIRY_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const NOTIFY_INTERVAL: Duration = Duration::from_secs(12 * 3600);
const ROLLOVER_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const TOP_UP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const BACKUP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct JobScheduler {
    ledger: Arc<KeyLedger>,
    pool: Arc<PoolRegistry>,
    store: LedgerStore,
    backup_path: Option<PathBuf>,
}

impl JobScheduler {
    pub fn new(
        ledger: Arc<KeyLedger>,
        pool: Arc<PoolRegistry>,
        store: LedgerStore,
        backup_path: Option<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            pool,
            store,
            backup_path,
        }
    }

    /// Spawns the five periodic jobs and returns their handles. Jobs run
    /// until the handles are dropped or aborted.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let ledger = Arc::clone(&self.ledger);
        handles.push(spawn_loop("expiry-sweep", EXPIRY_INTERVAL, move || {
            let ledger = Arc::clone(&ledger);
            async move { ledger.expire_keys().await.map(|_| ()) }
        }));

        let ledger = Arc::clone(&self.ledger);
        handles.push(spawn_loop(
            "expiry-notification",
            NOTIFY_INTERVAL,
            move || {
                let ledger = Arc::clone(&ledger);
                async move { ledger.notify_expiring().await.map(|_| ()) }
            },
        ));

        let ledger = Arc::clone(&self.ledger);
        handles.push(spawn_loop("quota-rollover", ROLLOVER_INTERVAL, move || {
            let ledger = Arc::clone(&ledger);
            async move { ledger.rollover_quota().await.map(|_| ()) }
        }));

        let pool = Arc::clone(&self.pool);
        handles.push(spawn_loop("capacity-top-up", TOP_UP_INTERVAL, move || {
            let pool = Arc::clone(&pool);
            async move { pool.top_up_capacity().await }
        }));

        if let Some(backup_path) = self.backup_path {
            let store = self.store.clone();
            handles.push(spawn_loop("ledger-backup", BACKUP_INTERVAL, move || {
                let store = store.clone();
                let backup_path = backup_path.clone();
                async move { store.backup_to(&backup_path).await }
            }));
        }

        handles
    }
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tracing::debug!(job = name, "job tick");
            if let Err(error) = tick().await {
                tracing::error!(job = name, %error, "job tick failed");
            }
        }
    })
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("backup_path", &self.backup_path)
            .finish_non_exhaustive()
    }
}
