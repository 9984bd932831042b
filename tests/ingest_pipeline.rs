//! Producer submission through the HTTP inbox, the scanner and into a
//! target table on disk.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use rusqlite::Connection;
use serde_json::{json, Value};
use tower::ServiceExt;

use fleet_control::api::{http_router, AppState};
use fleet_control::artifacts::ArtifactLibrary;
use fleet_control::inbox::InboxProcessor;
use fleet_control::registry::AgentRegistry;
use fleet_control::store::SqliteStore;

const DEVICE_TABLE: &str = "CREATE TABLE device (
    id VARCHAR(36) PRIMARY KEY,
    hostname VARCHAR(5),
    site NVARCHAR(10),
    cores INTEGER,
    managed INTEGER,
    tags TEXT
)";

async fn call(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    (status, serde_json::from_slice(&body).expect("json body"))
}

fn post_inbox(body: &Value) -> Request<Body> {
    Request::builder()
        .uri("/inbox")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

#[tokio::test]
async fn submission_lands_in_target_table() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = tmp.path().join("fleet.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    store.apply_schema(DEVICE_TABLE).unwrap();

    let state = AppState::new(
        store.clone(),
        Arc::new(AgentRegistry::new()),
        ArtifactLibrary::new(tmp.path()),
        4000,
        1 << 20,
    );
    let router = http_router(state);

    let submission = json!({
        "MetaData": {"Name": "inventory", "Vendor": "acme", "ContentType": "device"},
        "Content": {
            "TableName": "device",
            "Consts": {"site": "HQ"},
            "FieldMappings": [
                {"TargetField": "id", "Expression": "NewGUID()", "IsIdentifier": true},
                {"TargetField": "hostname", "Expression": "{name}"},
                {"TargetField": "site", "Expression": "{site}"},
                {"TargetField": "cores", "Expression": "{cores}"},
                {"TargetField": "managed", "Expression": "{managed}"},
                {"TargetField": "tags", "Expression": "{tags}"},
            ],
            "Data": [
                {"name": "workstation-01", "cores": 8, "managed": true, "tags": ["a", "b"]},
                {"name": "db", "cores": 32, "managed": false, "site": "DC1"},
            ],
        },
    });
    let (status, created) = call(&router, post_inbox(&submission)).await;
    assert_eq!(status, StatusCode::CREATED);
    let inbox_id = created["InboxID"].as_i64().unwrap();

    let (_, pending) = call(&router, get(&format!("/inbox/{inbox_id}"))).await;
    assert_eq!(pending["state"], "pending");
    assert_eq!(pending["content_type"], "device");

    let processor = InboxProcessor::new(store.clone(), store.clone());
    let summary = processor.scan_once().unwrap();
    assert_eq!(summary.succeeded, 1);

    let (_, done) = call(&router, get(&format!("/inbox/{inbox_id}"))).await;
    assert_eq!(done["state"], "success");
    assert!(done["ended_at"].is_string());
    assert!(done["processing_log"]
        .as_str()
        .unwrap()
        .starts_with("inserted 2 rows into `device`"));

    let conn = Connection::open(&db_path).unwrap();
    let mut stmt = conn
        .prepare("SELECT id, hostname, site, cores, managed, tags FROM device ORDER BY cores")
        .unwrap();
    let rows: Vec<(String, String, String, i64, i64, Option<String>)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(rows.len(), 2);
    let (first_id, hostname, site, cores, managed, tags) = &rows[0];
    assert_eq!(first_id.len(), 36);
    assert_eq!(hostname, "works");
    assert_eq!(site, "HQ");
    assert_eq!((*cores, *managed), (8, 1));
    assert_eq!(tags.as_deref(), Some(r#"["a","b"]"#));

    let (second_id, hostname, site, _, managed, tags) = &rows[1];
    assert_ne!(first_id, second_id);
    assert_eq!(hostname, "db");
    assert_eq!(site, "DC1");
    assert_eq!(*managed, 0);
    assert!(tags.is_none());

    let (_, tables) = call(&router, get("/get_tables")).await;
    assert!(tables.as_array().unwrap().contains(&json!("device")));
}

#[tokio::test]
async fn broken_submission_is_marked_error_and_writes_nothing() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = tmp.path().join("fleet.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    store.apply_schema(DEVICE_TABLE).unwrap();
    let router = http_router(AppState::new(
        store.clone(),
        Arc::new(AgentRegistry::new()),
        ArtifactLibrary::new(tmp.path()),
        4000,
        1 << 20,
    ));

    let submission = json!({
        "Content": {
            "TableName": "device",
            "FieldMappings": [{"TargetField": "hostname", "Expression": "{}"}],
            "Data": [{"name": "ws-01"}],
        },
    });
    let (_, created) = call(&router, post_inbox(&submission)).await;
    let inbox_id = created["InboxID"].as_i64().unwrap();

    let summary = InboxProcessor::new(store.clone(), store.clone())
        .scan_once()
        .unwrap();
    assert_eq!(summary.failed, 1);

    let (_, entry) = call(&router, get(&format!("/inbox/{inbox_id}"))).await;
    assert_eq!(entry["state"], "error");
    assert!(!entry["processing_log"].as_str().unwrap().is_empty());

    let conn = Connection::open(&db_path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM device", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}
