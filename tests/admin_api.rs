mod helpers;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gatekeeper::authz::types::Principal;
use gatekeeper::authz::web::{router, AppState};
use helpers::{AclRecordBuilder, TestWorld};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(world: &TestWorld) -> (Router, AppState) {
    let state = AppState {
        authorizer: Arc::new(world.authorizer()),
        org_cache: world.org_cache.clone(),
    };
    (router(state.clone()), state)
}

async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_healthz() {
    let world = TestWorld::new();
    let (app, _) = app(&world);
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn test_flush_picks_up_new_records() {
    let world = TestWorld::new();
    let (app, state) = app(&world);
    world.store.put_acl_record(
        AclRecordBuilder::new(1, "visitor")
            .arbitrary("view_catalog")
            .check("anyone", json!({}))
            .build(),
    );
    assert!(state
        .authorizer
        .check_arbitrary_permissions(&Principal::Guest, "view_catalog")
        .is_err());

    let (status, body) = send(app, "POST", "/v1/flush").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"], json!(1));
    assert_eq!(body["arbitrary"], json!(1));
    state
        .authorizer
        .check_arbitrary_permissions(&Principal::Guest, "view_catalog")
        .unwrap();
}

#[tokio::test]
async fn test_flush_failure_is_client_error() {
    let world = TestWorld::new();
    let (app, _) = app(&world);
    world.store.put_acl_record(
        AclRecordBuilder::new(1, "broken")
            .arbitrary("x")
            .check("no_such_predicate", json!({}))
            .build(),
    );
    let (status, _) = send(app, "POST", "/v1/flush").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalidate_and_stats() {
    let world = TestWorld::new();
    world.store.put_org(1, None);
    world.store.put_org(2, Some(1));
    let (app, _) = app(&world);

    let (status, body) = send(app.clone(), "POST", "/v1/orgs/invalidate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generation"], json!(1));

    world.org_cache.get(1).unwrap();
    let (status, body) = send(app, "GET", "/v1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["org_cache"]["generation"], json!(1));
    assert_eq!(body["org_cache"]["hits"], json!(1));
    assert_eq!(body["index"]["entries"], json!(0));
}
