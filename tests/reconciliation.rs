use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use httpmock::Method::{DELETE, GET, PUT};
use httpmock::MockServer;
use keyfleet::{
    BackendSet, CloudClient, CloudConfig, Key, KeyLedger, LedgerStore, Notification, Notifier,
    NullNotifier, OutlineBackend, PanelConfig, PoolRegistry, Protocol, Provisioner, RemoteShell,
    ShellOutput, VlessBackend, GIB,
};
use serde_json::json;

const DAY: i64 = 86_400;

struct FakeShell;

#[async_trait::async_trait]
impl RemoteShell for FakeShell {
    async fn run(
        &self,
        _host: &str,
        _password: &str,
        _command: &str,
        _stdin: Option<&str>,
    ) -> keyfleet::Result<ShellOutput> {
        Ok(ShellOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Captures notifications so tests can assert on what was sent.
#[derive(Default)]
struct RecordingNotifier {
    events: tokio::sync::Mutex<Vec<Notification>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.events.lock().await.push(notification);
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as i64
}

fn build_ledger(
    dir: &tempfile::TempDir,
    notifier: Arc<dyn Notifier>,
) -> (LedgerStore, KeyLedger) {
    let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
    let shell: Arc<dyn RemoteShell> = Arc::new(FakeShell);

    let outline = OutlineBackend::new(store.clone(), Arc::clone(&shell), Arc::clone(&notifier))
        .expect("outline backend");
    let panel = PanelConfig {
        admin_user: "admin".to_string(),
        panel_port: 2053,
    };
    let vless = VlessBackend::new(&panel, shell, Arc::clone(&notifier)).expect("vless backend");
    let backends = Arc::new(BackendSet::new(Box::new(outline), Box::new(vless)));

    let cloud = Arc::new(CloudClient::new(&CloudConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        token: Some("unused".to_string()),
        email: "ops@example.com".to_string(),
        password: "pw".to_string(),
        datacenter_id: 1,
        server_plan_id: 17,
        template_id: 31,
    }));
    let provisioner = Arc::new(Provisioner::new(
        cloud,
        store.clone(),
        Arc::clone(&backends),
        Arc::clone(&notifier),
    ));
    let pool = Arc::new(PoolRegistry::new(
        store.clone(),
        provisioner,
        Arc::clone(&notifier),
    ));
    let ledger = KeyLedger::new(store.clone(), pool, backends, notifier);
    (store, ledger)
}

fn outline_key(key_id: &str, server_id: i64, start_ts: i64, expiration_ts: Option<i64>) -> Key {
    Key {
        key_id: key_id.to_string(),
        owner_id: "1001".to_string(),
        protocol: Protocol::Outline,
        server_id,
        name: format!("key {key_id}"),
        start_ts,
        expiration_ts,
        quota_bytes: 200 * GIB,
        used_bytes_checkpoint: 0,
    }
}

async fn outline_server(store: &LedgerStore, api_url: &str) -> i64 {
    let server = store
        .insert_server(Protocol::Outline, Some("192.0.2.10".into()), None)
        .await
        .expect("server");
    store
        .update_server_endpoint(server.id, api_url, "AA11")
        .await
        .expect("endpoint");
    server.id
}

#[tokio::test]
async fn expiry_sweep_removes_key_and_alerts_when_remote_delete_fails() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(RecordingNotifier::default());
    let (store, ledger) = build_ledger(&dir, Arc::clone(&recorder) as Arc<dyn Notifier>);
    store.init().await.expect("init");

    let server_id = outline_server(&store, &panel.base_url()).await;
    store.reserve_server(server_id).await.expect("reserve");
    store
        .insert_key(&outline_key(
            "k-1",
            server_id,
            now() - 3 * DAY,
            Some(now() - DAY),
        ))
        .await
        .expect("insert");

    // The VPN server refuses the delete; cleanup is authoritative locally.
    let remote_delete = panel.mock(|when, then| {
        when.method(DELETE).path("/access-keys/k-1");
        then.status(500).body("internal error");
    });

    let expired = ledger.expire_keys().await.expect("sweep");
    assert_eq!(expired, 1);
    remote_delete.assert();

    assert!(store.key("k-1").await.expect("lookup").is_none());
    let server = store.server(server_id).await.expect("row");
    assert_eq!(server.active_key_count, 0);

    let events = recorder.events.lock().await;
    assert!(
        matches!(&events[..], [Notification::OperationalError { .. }]),
        "expected one alert, got {events:?}"
    );
}

#[tokio::test]
async fn expiry_sweep_stays_quiet_when_remote_key_is_already_gone() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(RecordingNotifier::default());
    let (store, ledger) = build_ledger(&dir, Arc::clone(&recorder) as Arc<dyn Notifier>);
    store.init().await.expect("init");

    let server_id = outline_server(&store, &panel.base_url()).await;
    store.reserve_server(server_id).await.expect("reserve");
    store
        .insert_key(&outline_key(
            "k-gone",
            server_id,
            now() - 3 * DAY,
            Some(now() - DAY),
        ))
        .await
        .expect("insert");

    let remote_delete = panel.mock(|when, then| {
        when.method(DELETE).path("/access-keys/k-gone");
        then.status(404).json_body(json!({"code": "NotFound"}));
    });

    let expired = ledger.expire_keys().await.expect("sweep");
    assert_eq!(expired, 1);
    remote_delete.assert();

    assert!(store.key("k-gone").await.expect("lookup").is_none());
    assert!(recorder.events.lock().await.is_empty());
}

#[tokio::test]
async fn expiry_sweep_leaves_unexpired_keys_alone() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, ledger) = build_ledger(&dir, Arc::new(NullNotifier));
    store.init().await.expect("init");

    let server_id = outline_server(&store, &panel.base_url()).await;
    store.reserve_server(server_id).await.expect("reserve");
    store
        .insert_key(&outline_key(
            "k-alive",
            server_id,
            now(),
            Some(now() + 10 * DAY),
        ))
        .await
        .expect("insert");

    let expired = ledger.expire_keys().await.expect("sweep");
    assert_eq!(expired, 0);
    assert!(store.key("k-alive").await.expect("lookup").is_some());
}

#[tokio::test]
async fn quota_rollover_rebases_quota_and_checkpoint_on_30_day_multiples() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, ledger) = build_ledger(&dir, Arc::new(NullNotifier));
    store.init().await.expect("init");

    let server_id = outline_server(&store, &panel.base_url()).await;

    // 60 days old, 50 GiB consumed against a 20 GiB checkpoint.
    let mut due = outline_key("k-2", server_id, now() - 60 * DAY, Some(now() + 30 * DAY));
    due.used_bytes_checkpoint = 20 * GIB;
    store.insert_key(&due).await.expect("insert due");

    // 45 days old: not on a 30-day boundary, must not be touched.
    store
        .insert_key(&outline_key(
            "k-3",
            server_id,
            now() - 45 * DAY,
            Some(now() + 30 * DAY),
        ))
        .await
        .expect("insert off-cycle");

    let info = panel.mock(|when, then| {
        when.method(GET).path("/access-keys/k-2");
        then.status(200).json_body(json!({
            "id": "k-2",
            "name": "key k-2",
            "accessUrl": "ss://secret@192.0.2.10:9999/",
            "dataLimit": {"bytes": 200 * GIB}
        }));
    });
    let metrics = panel.mock(|when, then| {
        when.method(GET).path("/metrics/transfer");
        then.status(200)
            .json_body(json!({"bytesTransferredByUserId": {"k-2": 50 * GIB}}));
    });
    let new_limit = panel.mock(|when, then| {
        when.method(PUT)
            .path("/access-keys/k-2/data-limit")
            .json_body(json!({"limit": {"bytes": 230 * GIB}}));
        then.status(204);
    });

    let rolled = ledger.rollover_quota().await.expect("rollover");
    assert_eq!(rolled, 1);
    info.assert();
    metrics.assert();
    new_limit.assert();

    let key = store.key("k-2").await.expect("lookup").expect("present");
    assert_eq!(key.quota_bytes, 230 * GIB);
    assert_eq!(key.used_bytes_checkpoint, 50 * GIB);

    let untouched = store.key("k-3").await.expect("lookup").expect("present");
    assert_eq!(untouched.quota_bytes, 200 * GIB);
    assert_eq!(untouched.used_bytes_checkpoint, 0);
}

#[tokio::test]
async fn expiring_keys_are_reported_once_per_owner() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(RecordingNotifier::default());
    let (store, ledger) = build_ledger(&dir, Arc::clone(&recorder) as Arc<dyn Notifier>);
    store.init().await.expect("init");

    let server_id = outline_server(&store, &panel.base_url()).await;
    store
        .insert_key(&outline_key("k-soon", server_id, now(), Some(now() + DAY)))
        .await
        .expect("insert expiring");
    store
        .insert_key(&outline_key("k-gone", server_id, now() - 5 * DAY, Some(now() - DAY)))
        .await
        .expect("insert expired");
    store
        .insert_key(&outline_key("k-far", server_id, now(), Some(now() + 5 * DAY)))
        .await
        .expect("insert distant");

    let notified = ledger.notify_expiring().await.expect("sweep");
    assert_eq!(notified, 1);

    let events = recorder.events.lock().await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        Notification::SubscriptionExpiring {
            owner_id,
            key_names,
        } => {
            assert_eq!(owner_id, "1001");
            assert_eq!(key_names, &vec!["key k-soon".to_string()]);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
}
