// tests/test_http_api.rs
// REST boundary: routing, data normalization, and error-status mapping.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

use strata::api::router;
use strata::batch::BatchConfig;
use strata::context::CacheConfig;
use strata::state::create_app_state_with;

async fn build_app() -> Router {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory database");
    strata::context::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let state = create_app_state_with(pool, CacheConfig::default(), BatchConfig::default());
    router(state)
}

fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_create_and_get_context() {
    let app = build_app().await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/contexts",
            Some("u1"),
            Some(json!({
                "level": "project",
                "context_id": "P1",
                "data": {"name": "Proj"}
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(request("GET", "/contexts/project/P1", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["name"], json!("Proj"));
    assert_eq!(body["version"], json!(1));
}

#[tokio::test]
async fn test_data_accepts_json_encoded_string() {
    let app = build_app().await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/contexts",
            Some("u1"),
            Some(json!({
                "level": "project",
                "context_id": "P1",
                "data": "{\"name\": \"Proj\"}"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["data"]["name"], json!("Proj"));
}

#[tokio::test]
async fn test_error_status_mapping() {
    let app = build_app().await;

    // Missing context -> 404
    let response = app
        .clone()
        .oneshot(request("GET", "/contexts/project/nope", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Unknown level -> 400
    let response = app
        .clone()
        .oneshot(request("GET", "/contexts/workspace/x", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Missing user header -> 400
    let response = app
        .clone()
        .oneshot(request("GET", "/contexts/project/P1", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Duplicate create -> 409
    let create = || {
        request(
            "POST",
            "/contexts",
            Some("u1"),
            Some(json!({"level": "project", "context_id": "P1"})),
        )
    };
    let response = app.clone().oneshot(create()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let response = app.clone().oneshot(create()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_resolve_route_merges_chain() {
    let app = build_app().await;

    for body in [
        json!({"level": "global", "context_id": "u1", "data": {"standard": "v1"}}),
        json!({"level": "project", "context_id": "P1", "data": {"standard": "v2"}}),
    ] {
        let response = app
            .clone()
            .oneshot(request("POST", "/contexts", Some("u1"), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .clone()
        .oneshot(request("POST", "/contexts/project/P1/resolve", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["standard"], json!("v2"));
    assert_eq!(body["inheritance_chain"], json!(["global", "project"]));
}

#[tokio::test]
async fn test_get_with_inheritance_query() {
    let app = build_app().await;

    for body in [
        json!({"level": "global", "context_id": "u1", "data": {"org": "acme"}}),
        json!({"level": "project", "context_id": "P1", "data": {"name": "Proj"}}),
    ] {
        app.clone()
            .oneshot(request("POST", "/contexts", Some("u1"), Some(body)))
            .await
            .unwrap();
    }

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            "/contexts/project/P1?include_inherited=true",
            Some("u1"),
            None,
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["org"], json!("acme"));
    assert_eq!(body["data"]["name"], json!("Proj"));
}

#[tokio::test]
async fn test_batch_route() {
    let app = build_app().await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/contexts/batch",
            Some("u1"),
            Some(json!({
                "operations": [
                    {"operation": "create", "level": "project", "context_id": "P1", "data": {"n": 1}},
                    {"operation": "create", "level": "project", "context_id": "P1", "data": {"n": 2}},
                    {"operation": "upsert", "level": "project", "context_id": "P2", "data": {"n": 3}}
                ],
                "stop_on_error": false
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["succeeded"], json!(2));
    assert_eq!(body["failed"], json!(1));
    assert_eq!(body["results"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_insights_and_list_routes() {
    let app = build_app().await;

    app.clone()
        .oneshot(request(
            "POST",
            "/contexts",
            Some("u1"),
            Some(json!({"level": "project", "context_id": "P1"})),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/contexts/project/P1/insights",
            Some("u1"),
            Some(json!({"content": "watch the cache", "category": "technical", "importance": "high"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(request("GET", "/contexts/project", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total"], json!(1));
}

#[tokio::test]
async fn test_delete_route() {
    let app = build_app().await;

    app.clone()
        .oneshot(request(
            "POST",
            "/contexts",
            Some("u1"),
            Some(json!({"level": "project", "context_id": "P1"})),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("DELETE", "/contexts/project/P1", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["deleted"], json!(true));

    let response = app
        .clone()
        .oneshot(request("GET", "/contexts/project/P1", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
