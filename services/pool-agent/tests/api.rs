//! HTTP surface tests against the router with a mock runtime.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use vpool_agent::api::create_router;
use vpool_agent::pool::PoolSettings;
use vpool_agent::registry::PoolRegistry;
use vpool_agent::runtime::{MockRuntime, ProcessRuntime};
use vpool_agent::scene::SceneDecoder;
use vpool_agent::state::AppState;

fn test_app(mock: &Arc<MockRuntime>) -> Router {
    let registry = PoolRegistry::new(
        ["left", "center"].map(|v| PoolSettings::new("adhoc", v)),
        ProcessRuntime::mock(Arc::clone(mock)),
    );
    create_router(AppState::new(Arc::new(registry), SceneDecoder::new("browser")))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn snapshot(items: &[(&str, &str)]) -> Value {
    let items: Vec<Value> = items
        .iter()
        .map(|(id, url)| {
            json!({
                "id": id,
                "url": url,
                "geometry": { "x": 0, "y": 0, "width": 100, "height": 100 },
            })
        })
        .collect();
    json!({ "items": items })
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = test_app(&Arc::new(MockRuntime::new()));

    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "pool-agent");

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["viewports"], json!(["center", "left"]));

    let (status, _) = send(&app, Method::GET, "/livez", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_put_snapshot_then_describe() {
    let mock = Arc::new(MockRuntime::new());
    let app = test_app(&mock);

    let (status, report) = send(
        &app,
        Method::PUT,
        "/v1/viewports/center/snapshot",
        Some(snapshot(&[("a", "http://x")])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["viewport"], "center");
    assert_eq!(report["generation"], 1);
    assert_eq!(report["created"], json!(["a"]));
    assert_eq!(report["failures"], json!([]));

    let (status, pool) = send(&app, Method::GET, "/v1/viewports/center", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pool["generation"], 1);
    assert_eq!(pool["instances"][0]["id"], "a");
    assert_eq!(pool["instances"][0]["status"], "visible");
    assert_eq!(
        pool["instances"][0]["url"],
        "http://x?ros_instance_name=adhoc__center__a"
    );

    let (_, list) = send(&app, Method::GET, "/v1/viewports", None).await;
    assert_eq!(
        list["items"],
        json!([
            { "viewport": "center", "instances": 1 },
            { "viewport": "left", "instances": 0 },
        ])
    );
}

#[tokio::test]
async fn test_unknown_viewport_is_not_found() {
    let app = test_app(&Arc::new(MockRuntime::new()));

    let (status, problem) = send(&app, Method::GET, "/v1/viewports/right", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["code"], "unknown_viewport");
    assert_eq!(problem["viewport"], "right");

    let (status, _) = send(
        &app,
        Method::PUT,
        "/v1/viewports/right/snapshot",
        Some(snapshot(&[])),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_snapshot_is_rejected_without_mutation() {
    let mock = Arc::new(MockRuntime::new());
    let app = test_app(&mock);

    send(
        &app,
        Method::PUT,
        "/v1/viewports/center/snapshot",
        Some(snapshot(&[("a", "http://x")])),
    )
    .await;

    let (status, problem) = send(
        &app,
        Method::PUT,
        "/v1/viewports/center/snapshot",
        Some(json!({ "items": [{ "id": "b" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "invalid_snapshot");

    let (_, pool) = send(&app, Method::GET, "/v1/viewports/center", None).await;
    assert_eq!(pool["generation"], 1);
    assert_eq!(mock.running_count(), 1);
}

#[tokio::test]
async fn test_instance_failure_is_reported_with_ok_status() {
    let mock = Arc::new(MockRuntime::new());
    mock.fail_spawn_for("center_b");
    let app = test_app(&mock);

    let (status, report) = send(
        &app,
        Method::PUT,
        "/v1/viewports/center/snapshot",
        Some(snapshot(&[("a", "http://x"), ("b", "http://y")])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["created"], json!(["a"]));
    assert_eq!(report["failures"][0]["id"], "b");
    assert_eq!(report["failures"][0]["action"], "create");
}

#[tokio::test]
async fn test_relaunch_endpoint() {
    let mock = Arc::new(MockRuntime::new());
    let app = test_app(&mock);

    send(
        &app,
        Method::PUT,
        "/v1/viewports/left/snapshot",
        Some(snapshot(&[("a", "http://x")])),
    )
    .await;

    let (status, report) = send(&app, Method::POST, "/v1/viewports/left/relaunch", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["relaunched"], json!(["a"]));
    assert_eq!(mock.spawn_count(), 2);
    assert_eq!(mock.running_count(), 1);
}

#[tokio::test]
async fn test_scene_reconciles_every_viewport() {
    let mock = Arc::new(MockRuntime::new());
    let app = test_app(&mock);

    let window = |viewport: &str, url: &str| {
        json!({
            "activity": "browser",
            "assets": [url],
            "x_coord": 0,
            "y_coord": 0,
            "width": 640,
            "height": 480,
            "presentation_viewport": viewport,
        })
    };

    let (status, report) = send(
        &app,
        Method::POST,
        "/v1/scenes",
        Some(json!({ "windows": [window("left", "http://x"), window("right", "http://y")] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["ignored"], json!(["right"]));
    assert_eq!(report["viewports"].as_array().unwrap().len(), 2);

    let (_, left) = send(&app, Method::GET, "/v1/viewports/left", None).await;
    assert_eq!(left["instances"].as_array().unwrap().len(), 1);
    let (_, center) = send(&app, Method::GET, "/v1/viewports/center", None).await;
    assert_eq!(center["generation"], 1);
    assert_eq!(center["instances"], json!([]));
}

#[tokio::test]
async fn test_malformed_scene_is_bad_request() {
    let mock = Arc::new(MockRuntime::new());
    let app = test_app(&mock);

    let (status, problem) = send(
        &app,
        Method::POST,
        "/v1/scenes",
        Some(json!({ "windows": [{ "activity": "browser", "assets": [] }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "missing_asset");
    assert_eq!(mock.spawn_count(), 0);
}
