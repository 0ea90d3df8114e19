use std::sync::Arc;
use std::time::Duration;

use lifter_addr::{BackendSet, ServiceKey};
use lifter_ctl::{HttpEventSource, HttpSourceConfig, SqliteTable};
use lifter_reconcile::{
    Engine, EngineConfig, EventSource, MemoryTable, NotificationKind, ServiceTable, SourceError,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn key(s: &str) -> ServiceKey {
    s.parse().unwrap()
}

fn set(addrs: &[&str]) -> BackendSet {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

fn source_config(server: &MockServer) -> HttpSourceConfig {
    HttpSourceConfig {
        poll_interval: Duration::from_millis(20),
        redeliver_interval: Duration::from_secs(60),
        ..HttpSourceConfig::new(server.uri())
    }
}

async fn mount_snapshot(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/v1/endpoints"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn snapshot_is_decoded() {
    let server = MockServer::start().await;
    mount_snapshot(
        &server,
        json!({
            "items": [
                {"kind": "add", "service_key": "10.96.0.10", "backends": ["10.1.0.1"],
                 "service_name": "web"},
                {"kind": "delete", "service_key": "10.96.0.11"}
            ],
            "last_event_id": 12
        }),
    )
    .await;

    let source = HttpEventSource::new(source_config(&server)).unwrap();
    let items = source.snapshot().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].service_name.as_deref(), Some("web"));
    assert_eq!(items[1].kind, NotificationKind::Delete);
}

#[tokio::test]
async fn unreachable_feed_fails_startup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/endpoints"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .mount(&server)
        .await;

    let source: Arc<dyn EventSource> =
        Arc::new(HttpEventSource::new(source_config(&server)).unwrap());
    let table: Arc<dyn ServiceTable> = Arc::new(MemoryTable::new(16));

    let err = Engine::start(table, source, EngineConfig::default())
        .await
        .err()
        .expect("startup must fail");
    assert!(err.to_string().contains("503"), "unexpected error: {err}");
}

#[tokio::test]
async fn malformed_feed_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/endpoints"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let source = HttpEventSource::new(source_config(&server)).unwrap();
    assert!(matches!(
        source.snapshot().await,
        Err(SourceError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn feed_events_converge_sqlite_table() {
    let server = MockServer::start().await;
    mount_snapshot(
        &server,
        json!({
            "items": [
                {"kind": "add", "service_key": "10.96.0.10", "backends": ["10.1.0.1", "10.1.0.2"],
                 "epoch": 1}
            ],
            "last_event_id": 1
        }),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/v1/endpoints/events"))
        .and(query_param("after_event_id", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"event_id": 2, "kind": "update", "service_key": "10.96.0.10",
                 "backends": ["10.1.0.2", "10.1.0.3"], "epoch": 2},
                {"event_id": 3, "kind": "add", "service_key": "10.96.0.20",
                 "backends": ["10.2.0.1"], "epoch": 3}
            ],
            "next_after_event_id": 3
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/endpoints/events"))
        .and(query_param("after_event_id", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "next_after_event_id": 3
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(SqliteTable::open(dir.path().join("svc_table.db"), 64).unwrap());
    let source: Arc<dyn EventSource> =
        Arc::new(HttpEventSource::new(source_config(&server)).unwrap());

    let engine = Engine::start(
        Arc::clone(&table) as Arc<dyn ServiceTable>,
        source,
        EngineConfig {
            workers: 2,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let expected = vec![
        (key("10.96.0.10"), set(&["10.1.0.2", "10.1.0.3"])),
        (key("10.96.0.20"), set(&["10.2.0.1"])),
    ];

    let grouped = || {
        let table = Arc::clone(&table);
        async move { lifter_reconcile::group_by_key(table.list().await.unwrap()) }
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current: Vec<_> = grouped().await.into_iter().collect();
            if current == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("table did not converge");

    let metrics = engine.metrics().snapshot();
    assert_eq!(metrics.failures_total(), 0);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn malformed_feed_items_do_not_block_later_events() {
    let server = MockServer::start().await;
    mount_snapshot(
        &server,
        json!({
            "items": [
                {"service_key": "10.96.0.30", "backends": ["10.3.0.1"]},
                {"kind": "add", "service_key": "10.96.0.10", "backends": ["10.1.0.1"], "epoch": 1}
            ],
            "last_event_id": 1
        }),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/v1/endpoints/events"))
        .and(query_param("after_event_id", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"event_id": 2, "kind": "resync", "service_key": "10.96.0.10"},
                {"event_id": 3, "kind": "update", "service_key": "10.96.0.20",
                 "backends": ["10.2.0.1"], "epoch": 3}
            ],
            "next_after_event_id": 3
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/endpoints/events"))
        .and(query_param("after_event_id", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "next_after_event_id": 3
        })))
        .mount(&server)
        .await;

    let table = Arc::new(SqliteTable::open_in_memory(64).unwrap());
    let source: Arc<dyn EventSource> =
        Arc::new(HttpEventSource::new(source_config(&server)).unwrap());
    let engine = Engine::start(
        Arc::clone(&table) as Arc<dyn ServiceTable>,
        source,
        EngineConfig::default(),
    )
    .await
    .expect("a bad snapshot item must not fail startup");

    let table_for_check = Arc::clone(&table);
    wait_until(move || table_for_check.len().unwrap() == 2).await;

    let grouped = lifter_reconcile::group_by_key(table.list().await.unwrap());
    assert_eq!(grouped.get(&key("10.96.0.10")), Some(&set(&["10.1.0.1"])));
    assert_eq!(grouped.get(&key("10.96.0.20")), Some(&set(&["10.2.0.1"])));
    assert!(grouped.get(&key("10.96.0.30")).is_none());
    assert!(engine.metrics().snapshot().events_malformed >= 2);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn restart_reuses_persisted_table() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("svc_table.db");

    {
        let table = SqliteTable::open(&db, 64).unwrap();
        table.upsert(key("10.96.0.10"), "10.1.0.1".parse().unwrap()).await.unwrap();
        table.upsert(key("10.96.0.99"), "10.9.0.1".parse().unwrap()).await.unwrap();
    }

    let server = MockServer::start().await;
    mount_snapshot(
        &server,
        json!({
            "items": [{"kind": "add", "service_key": "10.96.0.10", "backends": ["10.1.0.1"]}],
            "last_event_id": 0
        }),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/v1/endpoints/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "next_after_event_id": 0
        })))
        .mount(&server)
        .await;

    let table = Arc::new(SqliteTable::open(&db, 64).unwrap());
    let source: Arc<dyn EventSource> =
        Arc::new(HttpEventSource::new(source_config(&server)).unwrap());
    let engine = Engine::start(
        Arc::clone(&table) as Arc<dyn ServiceTable>,
        source,
        EngineConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(engine.resync_report().orphans, 1);
    let table_for_check = Arc::clone(&table);
    wait_until(move || table_for_check.len().unwrap() == 1).await;

    engine.shutdown(Duration::from_secs(1)).await;
}
