//! HTTP contract tests against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use mproc_api::{create_router, ApiConfig, AppState};
use mproc_storage::{MemoryObjectStore, UploadConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

const MIB: usize = 1024 * 1024;

fn app() -> (Router, Arc<MemoryObjectStore>) {
    let store = Arc::new(MemoryObjectStore::new());
    let state = AppState::new(ApiConfig::default(), store.clone(), UploadConfig::default());
    (create_router(state, None), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_part(upload_id: &str, part: u32, key: &str, data: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(format!(
            "/api/uploads/multipart/{upload_id}/parts/{part}?key={key}"
        ))
        .header("content-type", "application/octet-stream")
        .body(Body::from(data))
        .unwrap()
}

async fn initiate(app: &Router, key: &str, size: usize) -> (String, Value) {
    let (status, body) = send(
        app,
        post_json(
            "/api/uploads/multipart/initiate",
            json!({
                "key": key,
                "contentType": "video/mp4",
                "fileSize": size,
                "metadata": {"title": "Holiday", "tags": "a,b"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    (body["uploadId"].as_str().unwrap().to_string(), body)
}

#[tokio::test]
async fn test_full_multipart_flow() {
    let (app, store) = app();
    let data: Vec<u8> = (0..12 * MIB).map(|i| (i % 251) as u8).collect();
    let key = "u1/m1/video.mp4";

    let (upload_id, body) = initiate(&app, key, data.len()).await;
    let parts = body["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0]["size"], 5 * MIB);
    assert_eq!(parts[2]["size"], 2 * MIB);
    assert_eq!(body["chunkSize"], 5 * MIB);

    // Parts may arrive out of order.
    let mut etags = Vec::new();
    for part in [3u32, 1, 2] {
        let start = (part as usize - 1) * 5 * MIB;
        let end = (start + 5 * MIB).min(data.len());
        let (status, body) = send(&app, put_part(&upload_id, part, key, data[start..end].to_vec())).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["partNumber"], part);
        etags.push(json!({"partNumber": part, "eTag": body["eTag"]}));
    }

    let (status, session) = send(
        &app,
        Request::builder()
            .uri(format!("/api/uploads/multipart/{upload_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["missingParts"], json!([]));
    assert_eq!(session["bytesUploaded"], data.len());

    let (status, body) = send(
        &app,
        post_json(
            "/api/uploads/multipart/complete",
            json!({"uploadId": upload_id, "key": key, "parts": etags}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({"key": key}));

    let stored = store.get(key).unwrap();
    assert_eq!(stored.data.as_ref(), data.as_slice());
    assert_eq!(stored.content_type, "video/mp4");
    assert_eq!(stored.metadata.get("title").map(String::as_str), Some("Holiday"));
    assert!(!stored.metadata.contains_key("tags"));
    assert_eq!(store.open_uploads(), 0);
}

#[tokio::test]
async fn test_complete_with_missing_parts_is_rejected() {
    let (app, store) = app();
    let key = "u1/m2/video.mp4";
    let (upload_id, _) = initiate(&app, key, 11 * MIB).await;

    let (status, _) = send(&app, put_part(&upload_id, 1, key, vec![0u8; 5 * MIB])).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post_json(
            "/api/uploads/multipart/complete",
            json!({"uploadId": upload_id, "key": key}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "missing_parts");
    assert!(!store.contains(key));
    assert_eq!(store.open_uploads(), 1);
}

#[tokio::test]
async fn test_part_validation() {
    let (app, _) = app();
    let key = "u1/m3/video.mp4";
    let (upload_id, _) = initiate(&app, key, 6 * MIB).await;

    // Wrong size for the plan.
    let (status, _) = send(&app, put_part(&upload_id, 1, key, vec![0u8; 1024])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Not in the plan.
    let (status, body) = send(&app, put_part(&upload_id, 3, key, vec![0u8; 1024])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "unknown_part");

    // Key does not match the session.
    let (status, _) = send(&app, put_part(&upload_id, 2, "u1/other.mp4", vec![0u8; MIB])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown session.
    let (status, _) = send(&app, put_part("missing", 1, key, vec![0u8; 5 * MIB])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_abort_discards_session() {
    let (app, store) = app();
    let key = "u1/m4/video.mp4";
    let (upload_id, _) = initiate(&app, key, 7 * MIB).await;
    send(&app, put_part(&upload_id, 1, key, vec![1u8; 5 * MIB])).await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/uploads/multipart/abort",
            json!({"uploadId": upload_id, "key": key}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
    assert_eq!(store.open_uploads(), 0);
    assert_eq!(store.aborted_uploads(), 1);

    let (status, _) = send(
        &app,
        Request::builder()
            .uri(format!("/api/uploads/multipart/{upload_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_part_aborts_session() {
    let store = Arc::new(MemoryObjectStore::new());
    store.fail_puts_matching("doomed");
    let upload = UploadConfig {
        max_chunk_retries: 1,
        retry_base_delay: Duration::from_millis(1),
        ..UploadConfig::default()
    };
    let state = AppState::new(ApiConfig::default(), store.clone(), upload);
    let app = create_router(state, None);

    let key = "u1/doomed.mp4";
    let (upload_id, _) = initiate(&app, key, 6 * MIB).await;
    assert_eq!(store.open_uploads(), 1);

    let (status, body) = send(&app, put_part(&upload_id, 1, key, vec![0u8; 5 * MIB])).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "chunk_failed");
    assert_eq!(store.open_uploads(), 0);
    assert_eq!(store.aborted_uploads(), 1);

    let (status, _) = send(
        &app,
        Request::builder()
            .uri(format!("/api/uploads/multipart/{upload_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, put_part(&upload_id, 2, key, vec![0u8; MIB])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_initiate_validation() {
    let (app, _) = app();

    let (status, _) = send(
        &app,
        post_json(
            "/api/uploads/multipart/initiate",
            json!({"key": "u1/big.mp4", "contentType": "video/mp4", "fileSize": 6u64 * 1024 * MIB as u64}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, _) = send(
        &app,
        post_json(
            "/api/uploads/multipart/initiate",
            json!({"key": "../escape.mp4", "contentType": "video/mp4", "fileSize": 10}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/uploads/multipart/initiate",
            json!({"key": "", "contentType": "video/mp4", "fileSize": 10}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json("/api/uploads/multipart/initiate", json!({"key": "u1/a.mp4"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_readiness() {
    let (app, _) = app();

    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(
        &app,
        Request::builder().uri("/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["openSessions"], 0);
    assert!(body.get("storeError").is_none());
}
