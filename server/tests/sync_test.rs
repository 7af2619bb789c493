//! Integration tests for the sync endpoint.
//!
//! The router is driven directly with `oneshot`; the end-to-end tests bind a
//! real socket and sync `cairn-engine` replicas through `HttpTransport`.

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use cairn_engine::{
    ConflictPolicy, MemoryStorage, NetworkMonitor, PushResponse, Record, RecordStore,
    StoreDescriptor, SyncConfig, SyncEngine,
};
use cairn_server::{app, routes::HealthResponse, AppState, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn router(config: Config) -> (Router, AppState) {
    let state = AppState::new(config);
    (app(state.clone()), state)
}

fn push(body: Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/sync")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

mod http_tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_record_count() {
        let (app, state) = router(Config::default());
        state.repo.offer(cairn_engine::StoreRecord::new("todos", Record::new("t1", json!({}))));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let health: HealthResponse = json_body(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.records, 1);
    }

    #[tokio::test]
    async fn push_accepts_then_conflicts() {
        let (app, state) = router(Config::default());
        let first = json!({"records": [
            {"store": "todos", "id": "t1", "data": {"title": "a"}, "version": 1, "timestamp": 10, "deleted": false, "synced": false}
        ]});

        let response = app.clone().oneshot(push(first, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: PushResponse = json_body(response).await;
        assert!(reply.success);
        assert!(reply.conflicts.is_empty());
        assert!(state.repo.get("todos", "t1").unwrap().synced);

        let stale = json!({"records": [
            {"store": "todos", "id": "t1", "data": {"title": "b"}, "version": 0}
        ]});
        let reply: PushResponse = json_body(app.oneshot(push(stale, None)).await.unwrap()).await;
        assert_eq!(reply.conflicts.len(), 1);
        let conflict = &reply.conflicts[0];
        assert_eq!(conflict.store.as_deref(), Some("todos"));
        assert_eq!(conflict.remote_version.version, 1);
        assert_eq!(conflict.remote_version.data, json!({"title": "a"}));
    }

    #[tokio::test]
    async fn push_requires_configured_token() {
        let (app, _) = router(Config::default().with_auth_token("secret"));
        let body = json!({"records": []});

        let response = app.clone().oneshot(push(body.clone(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(push(body.clone(), Some("wrong"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let error: Value = json_body(response).await;
        assert!(error["error"].as_str().unwrap().contains("invalid bearer token"));

        let response = app.oneshot(push(body, Some("secret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_push_is_rejected() {
        let config = Config {
            max_batch_size: 1,
            ..Config::default()
        };
        let (app, state) = router(config);
        let body = json!({"records": [
            {"store": "s", "id": "a", "data": null},
            {"store": "s", "id": "b", "data": null}
        ]});

        let response = app.oneshot(push(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.repo.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_client_error() {
        let (app, _) = router(Config::default());
        let request = Request::post("/sync")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"records\": 5}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}

mod end_to_end {
    use super::*;

    async fn serve(config: Config) -> (String, AppState) {
        let state = AppState::new(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}/sync"), state)
    }

    async fn replica(endpoint: &str, policy: ConflictPolicy) -> (Arc<RecordStore>, SyncEngine) {
        let store = Arc::new(
            RecordStore::open(Arc::new(MemoryStorage::new()), vec![StoreDescriptor::new("todos")])
                .await
                .unwrap(),
        );
        let config = SyncConfig::new(endpoint)
            .with_auth_token("secret")
            .with_conflict_resolution(policy);
        let engine =
            SyncEngine::http(store.clone(), Arc::new(NetworkMonitor::new(true)), config).unwrap();
        (store, engine)
    }

    #[tokio::test]
    async fn root_answers_over_a_socket() {
        let (endpoint, _) = serve(Config::default()).await;
        let base = endpoint.trim_end_matches("/sync");

        let body = reqwest::get(format!("{base}/")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "Cairn Sync Server");

        let health: HealthResponse = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.records, 0);
    }

    #[tokio::test]
    async fn stale_replica_converges_under_server_wins() {
        let (endpoint, state) = serve(Config::default().with_auth_token("secret")).await;
        let (first, first_sync) = replica(&endpoint, ConflictPolicy::ServerWins).await;
        let (second, second_sync) = replica(&endpoint, ConflictPolicy::ServerWins).await;

        first
            .create("todos", Record::new("t1", json!({"title": "buy milk"})))
            .await
            .unwrap();
        first
            .update("todos", Record::new("t1", json!({"title": "buy oat milk"})))
            .await
            .unwrap();
        let result = first_sync.perform_sync().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.synced_records, 1);
        assert_eq!(state.repo.get("todos", "t1").unwrap().version, 1);

        // The second replica never saw the update and writes its own version 0
        second
            .create("todos", Record::new("t1", json!({"title": "call mom"})))
            .await
            .unwrap();
        let result = second_sync.perform_sync().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.conflicts.len(), 1);

        let converged = second.read("todos", "t1").await.unwrap().unwrap();
        assert_eq!(converged.data, json!({"title": "buy oat milk"}));
        assert_eq!(converged.version, 1);
        assert!(converged.synced);
        assert_eq!(second_sync.status().await.pending_records, 0);
    }

    #[tokio::test]
    async fn wrong_token_fails_the_pass() {
        let (endpoint, state) = serve(Config::default().with_auth_token("other")).await;
        let store = Arc::new(
            RecordStore::open(Arc::new(MemoryStorage::new()), vec![StoreDescriptor::new("todos")])
                .await
                .unwrap(),
        );
        let config = SyncConfig {
            retry_attempts: 1,
            ..SyncConfig::new(endpoint).with_auth_token("secret")
        };
        let engine = SyncEngine::http(store.clone(), Arc::new(NetworkMonitor::new(true)), config)
            .unwrap();

        store.create("todos", Record::new("t1", json!({}))).await.unwrap();
        let result = engine.perform_sync().await;
        assert!(!result.success);
        assert!(result.errors[0].contains("401"));
        assert!(state.repo.is_empty());
        assert!(!store.read("todos", "t1").await.unwrap().unwrap().synced);
    }
}
