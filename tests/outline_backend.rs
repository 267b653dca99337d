use std::sync::Arc;

use httpmock::Method::{DELETE, GET, POST, PUT};
use httpmock::MockServer;
use keyfleet::{
    CapacityClass, GIB, LedgerStore, NullNotifier, OutlineBackend, Protocol, Server, SshShell,
    VpnBackend,
};
use serde_json::json;

fn test_server(api_url: String) -> Server {
    Server {
        id: 1,
        protocol: Protocol::Outline,
        ip: Some("192.0.2.10".to_string()),
        password: None,
        api_url: Some(api_url),
        cert_sha256: Some("AA11".to_string()),
        active_key_count: 0,
        capacity_class: CapacityClass::Standard,
    }
}

fn backend(dir: &tempfile::TempDir) -> OutlineBackend {
    let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
    OutlineBackend::new(store, Arc::new(SshShell), Arc::new(NullNotifier)).expect("backend")
}

#[tokio::test]
async fn create_then_get_round_trips_quota_with_zero_usage() {
    let panel = MockServer::start();
    let quota = 200 * GIB;

    let create = panel.mock(|when, then| {
        when.method(POST).path("/access-keys/");
        then.status(201).json_body(json!({
            "id": "7",
            "name": "",
            "accessUrl": "ss://secret@192.0.2.10:9999/?outline=1"
        }));
    });
    let rename = panel.mock(|when, then| {
        when.method(PUT).path("/access-keys/7/name");
        then.status(204);
    });
    let set_limit = panel.mock(|when, then| {
        when.method(PUT)
            .path("/access-keys/7/data-limit")
            .json_body(json!({"limit": {"bytes": quota}}));
        then.status(204);
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend(&dir);
    let server = test_server(panel.base_url());

    let created = backend.create_key(&server, quota).await.expect("create");
    assert_eq!(created.key_id, "7");
    assert_eq!(created.quota_bytes, quota);
    assert_eq!(created.used_bytes, 0);
    assert!(!created.name.is_empty());
    create.assert();
    rename.assert();
    set_limit.assert();

    let get = panel.mock(|when, then| {
        when.method(GET).path("/access-keys/7");
        then.status(200).json_body(json!({
            "id": "7",
            "name": created.name,
            "accessUrl": "ss://secret@192.0.2.10:9999/?outline=1",
            "dataLimit": {"bytes": quota}
        }));
    });
    let metrics = panel.mock(|when, then| {
        when.method(GET).path("/metrics/transfer");
        then.status(200)
            .json_body(json!({"bytesTransferredByUserId": {}}));
    });

    let info = backend.get_key_info(&server, "7").await.expect("get");
    assert_eq!(info.quota_bytes, quota);
    assert_eq!(info.used_bytes, 0);
    assert_eq!(info.name, created.name);
    get.assert();
    metrics.assert();
}

#[tokio::test]
async fn delete_is_idempotent_on_missing_key() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend(&dir);
    let server = test_server(panel.base_url());

    let mut first = panel.mock(|when, then| {
        when.method(DELETE).path("/access-keys/9");
        then.status(204);
    });
    assert!(backend.delete_key(&server, "9").await.expect("first delete"));
    first.assert();
    first.delete();

    let second = panel.mock(|when, then| {
        when.method(DELETE).path("/access-keys/9");
        then.status(404).json_body(json!({"code": "NotFound"}));
    });
    // Second delete reports false, never an error.
    assert!(!backend.delete_key(&server, "9").await.expect("second delete"));
    second.assert();
}

#[tokio::test]
async fn quota_headroom_builds_on_usage_even_when_over_quota() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend(&dir);
    let server = test_server(panel.base_url());

    // 250 GiB consumed against a 200 GiB quota.
    let used = 250 * GIB;
    let expected = used + 200 * GIB;

    let get = panel.mock(|when, then| {
        when.method(GET).path("/access-keys/7");
        then.status(200).json_body(json!({
            "id": "7",
            "name": "quiet falcon",
            "accessUrl": "ss://secret@192.0.2.10:9999/?outline=1",
            "dataLimit": {"bytes": 200 * GIB}
        }));
    });
    let metrics = panel.mock(|when, then| {
        when.method(GET).path("/metrics/transfer");
        then.status(200)
            .json_body(json!({"bytesTransferredByUserId": {"7": used}}));
    });
    let set_limit = panel.mock(|when, then| {
        when.method(PUT)
            .path("/access-keys/7/data-limit")
            .json_body(json!({"limit": {"bytes": expected}}));
        then.status(204);
    });

    let new_quota = backend
        .extend_quota_headroom(&server, "7")
        .await
        .expect("extend");
    assert_eq!(new_quota, expected);
    get.assert();
    metrics.assert();
    set_limit.assert();
}

#[tokio::test]
async fn missing_key_surfaces_as_key_not_found() {
    let panel = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend(&dir);
    let server = test_server(panel.base_url());

    panel.mock(|when, then| {
        when.method(GET).path("/access-keys/nope");
        then.status(404).json_body(json!({"code": "NotFound"}));
    });

    let error = backend
        .get_key_info(&server, "nope")
        .await
        .expect_err("absent key");
    assert!(matches!(error, keyfleet::Error::KeyNotFound(_)));
}
