//! Integration tests for the HTTP surface.
//!
//! The event protocol itself is covered by the engine's gateway tests;
//! these only check what the router does before a socket is upgraded.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sp_server::{
    api::{AppState, create_router},
    config::ConnectionConfig,
};
use stake_pile::{
    Gateway, MemoryLedger, RoomConfig,
    db::MemoryRoomDirectory,
    room::{EngineSettings, RoomRegistry},
};
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot` method
use uuid::Uuid;

fn create_test_server() -> (axum::Router, RoomRegistry) {
    let registry = RoomRegistry::new(
        Arc::new(MemoryLedger::new().with_default_balance(1_000)),
        Arc::new(MemoryRoomDirectory::new()),
        EngineSettings::default(),
    );
    let state = AppState::new(Gateway::new(registry.clone()), ConnectionConfig::default());
    (create_router(state), registry)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_without_database() {
    let (app, _) = create_test_server();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert!(json["database"].is_null());
    assert_eq!(json["rooms"]["active_count"], 0);
}

#[tokio::test]
async fn test_health_counts_rooms() {
    let (app, registry) = create_test_server();
    registry
        .create(Uuid::new_v4(), RoomConfig::default())
        .await
        .unwrap();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let json = body_json(response).await;
    assert_eq!(json["rooms"]["active_count"], 1);
}

#[tokio::test]
async fn test_websocket_without_upgrade_rejected() {
    let (app, _) = create_test_server();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws?user_id=1&username=alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(
        response.status().is_client_error(),
        "plain GET on /ws should fail, got: {}",
        response.status()
    );
}

#[tokio::test]
async fn test_websocket_without_identity_rejected() {
    let (app, _) = create_test_server();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws")
                .header("connection", "upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(
        response.status().is_client_error(),
        "missing identity should fail, got: {}",
        response.status()
    );
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _) = create_test_server();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tables")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_preflight_allowed() {
    let (app, _) = create_test_server();

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/health")
                .header("origin", "http://example.com")
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}
