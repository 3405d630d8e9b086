//! HTTP-level tests for the entity and sync APIs

use axum_test::TestServer;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use atrium_server::state::AppState;
use atrium_server::{app, init_schema};

async fn test_server() -> TestServer {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    init_schema(&pool).await.unwrap();
    TestServer::new(app(AppState::new(pool))).unwrap()
}

/// Create a floor plan and return its id.
async fn create_floor_plan(server: &TestServer, name: &str, floor_number: i64) -> String {
    let response = server
        .post("/api/entities")
        .json(&json!({
            "kind": "floor_plan",
            "fields": {"name": name, "floor_number": floor_number},
            "user": "alice"
        }))
        .await;

    assert_eq!(response.status_code(), 201);
    response.json::<Value>()["id"].as_str().unwrap().to_string()
}

/// Bump an entity's name server-side so version 1 is stale.
async fn edit_name(server: &TestServer, id: &str, name: &str) {
    let response = server
        .put(&format!("/api/entities/{}", id))
        .json(&json!({"fields": {"name": name}, "version": 1, "user": "bob"}))
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn health_reports_service() {
    let server = test_server().await;

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);

    let body = response.json::<Value>();
    assert_eq!(body["service"], "atrium-server");
}

#[tokio::test]
async fn create_and_get_roundtrip() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;

    let response = server.get(&format!("/api/entities/{}", id)).await;
    assert_eq!(response.status_code(), 200);

    let body = response.json::<Value>();
    assert_eq!(body["version"], 1);
    assert_eq!(body["fields"]["name"], "HQ Level 1");
}

#[tokio::test]
async fn conflict_check_flags_stale_client() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;

    let response = server
        .post(&format!("/api/entities/{}/conflict-check", id))
        .json(&json!({"version": 1}))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["conflict"], false);

    edit_name(&server, &id, "HQ Level 1 (east wing)").await;

    let response = server
        .post(&format!("/api/entities/{}/conflict-check", id))
        .json(&json!({"version": 1}))
        .await;
    assert_eq!(response.status_code(), 409);

    let body = response.json::<Value>();
    assert_eq!(body["conflict"], true);
    assert_eq!(body["serverVersion"], 2);
    assert_eq!(body["clientVersion"], 1);
}

#[tokio::test]
async fn stale_update_with_double_edit_returns_409_payload() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;
    edit_name(&server, &id, "HQ Level 1 (east wing)").await;

    let response = server
        .put(&format!("/api/entities/{}", id))
        .json(&json!({
            "fields": {"name": "HQ Level 1 (west wing)"},
            "version": 1,
            "user": "carol"
        }))
        .await;

    assert_eq!(response.status_code(), 409);
    let body = response.json::<Value>();
    assert_eq!(body["error"], "CONFLICT_DETECTED");
    assert_eq!(body["expectedVersion"], 2);
    assert_eq!(body["conflictingFields"], json!(["name"]));
    assert_eq!(body["mergedFields"]["name"], "HQ Level 1 (west wing)");

    // Nothing applied
    let entity = server.get(&format!("/api/entities/{}", id)).await.json::<Value>();
    assert_eq!(entity["version"], 2);
    assert_eq!(entity["fields"]["name"], "HQ Level 1 (east wing)");
}

#[tokio::test]
async fn stale_update_with_disjoint_edit_auto_merges() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;
    edit_name(&server, &id, "HQ Level 1 (east wing)").await;

    let response = server
        .put(&format!("/api/entities/{}", id))
        .json(&json!({
            "fields": {"floor_number": 2},
            "version": 1,
            "user": "carol"
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    assert_eq!(body["version"], 3);
    assert_eq!(body["fields"]["name"], "HQ Level 1 (east wing)");
    assert_eq!(body["fields"]["floor_number"], 2);
}

#[tokio::test]
async fn update_rejects_unknown_field() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;

    let response = server
        .put(&format!("/api/entities/{}", id))
        .json(&json!({"fields": {"wing": "east"}, "version": 1}))
        .await;

    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn batch_sync_partitions_outcomes() {
    let server = test_server().await;

    let id_a = create_floor_plan(&server, "A", 1).await;
    let id_b = create_floor_plan(&server, "B", 2).await;
    let id_c = create_floor_plan(&server, "C", 3).await;
    edit_name(&server, &id_b, "B (contested)").await;

    let response = server
        .post("/api/sync/batch")
        .json(&json!({
            "userId": "carol",
            "changes": [
                {"changeKind": "UPDATE", "entityKind": "floor_plan", "entityId": id_a,
                 "payload": {"floor_number": 10}, "baseVersion": 1},
                {"changeKind": "UPDATE", "entityKind": "floor_plan", "entityId": id_b,
                 "payload": {"name": "B (mine)"}, "baseVersion": 1},
                {"changeKind": "UPDATE", "entityKind": "floor_plan", "entityId": id_c,
                 "payload": {"floor_number": 30}, "baseVersion": 1}
            ]
        }))
        .await;

    // Partial outcome: multi-status, with the conflict surfaced
    assert_eq!(response.status_code(), 207);

    let body = response.json::<Value>();
    assert_eq!(body["results"]["synced"].as_array().unwrap().len(), 2);
    assert_eq!(body["results"]["conflicts"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"]["failed"].as_array().unwrap().len(), 0);

    let conflict = &body["results"]["conflicts"][0];
    assert_eq!(conflict["entityId"], json!(id_b));
    assert_eq!(conflict["conflictingFields"], json!(["name"]));

    // The conflicting entity kept its version
    let entity = server.get(&format!("/api/entities/{}", id_b)).await.json::<Value>();
    assert_eq!(entity["version"], 2);
}

#[tokio::test]
async fn batch_sync_reports_missing_entity_as_failed() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "A", 1).await;

    let response = server
        .post("/api/sync/batch")
        .json(&json!({
            "userId": "carol",
            "changes": [
                {"changeKind": "UPDATE", "entityKind": "floor_plan", "entityId": "missing",
                 "payload": {"floor_number": 9}, "baseVersion": 1},
                {"changeKind": "UPDATE", "entityKind": "floor_plan", "entityId": id,
                 "payload": {"floor_number": 2}, "baseVersion": 1}
            ]
        }))
        .await;

    assert_eq!(response.status_code(), 207);

    let body = response.json::<Value>();
    assert_eq!(body["results"]["synced"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"]["failed"].as_array().unwrap().len(), 1);
    assert!(!body["results"]["failed"][0]["error"]
        .as_str()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn batch_sync_creates_entities() {
    let server = test_server().await;

    let response = server
        .post("/api/sync/batch")
        .json(&json!({
            "userId": "alice",
            "changes": [
                {"changeKind": "CREATE", "entityKind": "room",
                 "payload": {"floor_plan_id": "fp-1", "name": "Huddle A",
                             "room_number": "101", "capacity": 4}}
            ]
        }))
        .await;

    assert_eq!(response.status_code(), 200);

    let body = response.json::<Value>();
    let synced = &body["results"]["synced"][0];
    assert_eq!(synced["newVersion"], 1);

    let entity_id = synced["entityId"].as_str().unwrap();
    let entity = server.get(&format!("/api/entities/{}", entity_id)).await.json::<Value>();
    assert_eq!(entity["fields"]["name"], "Huddle A");
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let server = test_server().await;

    let response = server
        .post("/api/sync/batch")
        .json(&json!({"userId": "alice", "changes": []}))
        .await;

    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn history_lists_versions_newest_first() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;
    edit_name(&server, &id, "HQ Level 1 (east wing)").await;

    let response = server.get(&format!("/api/entities/{}/history", id)).await;
    assert_eq!(response.status_code(), 200);

    let entries = response.json::<Vec<Value>>();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["version"], 2);
    assert_eq!(entries[0]["changeKind"], "update");
    assert_eq!(entries[1]["version"], 1);
    assert_eq!(entries[1]["changeKind"], "create");
}

#[tokio::test]
async fn conflict_log_is_readable_after_conflict() {
    let server = test_server().await;
    let id = create_floor_plan(&server, "HQ Level 1", 1).await;
    edit_name(&server, &id, "HQ Level 1 (east wing)").await;

    let response = server
        .put(&format!("/api/entities/{}", id))
        .json(&json!({
            "fields": {"name": "HQ Level 1 (west wing)"},
            "version": 1,
            "user": "carol"
        }))
        .await;
    assert_eq!(response.status_code(), 409);

    let response = server
        .get(&format!("/api/conflicts?entityId={}", id))
        .await;
    assert_eq!(response.status_code(), 200);

    let records = response.json::<Vec<Value>>();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["conflictingFields"], json!(["name"]));
    assert_eq!(records[0]["strategy"], "THREE_WAY_MERGE");
    assert_eq!(records[0]["userB"], "carol");
}
