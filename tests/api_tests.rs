//! Control-plane contract tests.
//!
//! These exercise the router against a manager with an empty table: request
//! validation, default application, and the error codes surfaced for unknown
//! instances. Paths that would touch docker, iptables, or QEMU are covered
//! by unit tests in the respective modules.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use microvmd::{api, AgentConfig, Manager};
use std::sync::Arc;
use tower::ServiceExt;

fn test_router(root: &std::path::Path) -> axum::Router {
    let cfg = AgentConfig {
        instances_dir: root.join("instances"),
        image_cache_dir: root.join("images"),
        user_data_template: root.join("user-data.yaml"),
        ..AgentConfig::default()
    };
    let manager = Arc::new(Manager::with_public_ip(cfg, "127.0.0.1".into()).unwrap());
    api::create_router(manager)
}

fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_without_public_key_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(json_request("POST", "/instances/create", r#"{"cpu": 2}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = body_json(resp).await;
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("public_key"));
}

#[tokio::test]
async fn create_with_empty_public_key_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(json_request(
            "POST",
            "/instances/create",
            r#"{"public_key": "  "}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_with_invalid_json_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(json_request("POST", "/instances/create", "{not json"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_unknown_instance_is_500_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(
            Request::delete("/instances/no-such-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = body_json(resp).await;
    assert_eq!(body["code"], "INSTANCE_NOT_FOUND");
    assert!(body["error"].as_str().unwrap().contains("no-such-id"));
}

#[tokio::test]
async fn manage_without_action_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(json_request("PATCH", "/instances/some-id", "{}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("action"));
}

#[tokio::test]
async fn manage_unknown_instance_is_500_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let resp = app
        .oneshot(json_request(
            "PATCH",
            "/instances/no-such-id",
            r#"{"action": "start"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = body_json(resp).await;
    assert_eq!(body["code"], "INSTANCE_NOT_FOUND");
}
