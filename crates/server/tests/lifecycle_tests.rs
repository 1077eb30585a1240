//! Resume-across-restart and durability scenarios.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestServer;
use common::fixtures::{chunk_body, filled_bytes, jpeg_bytes, multipart_content_type};
use common::server::TEST_CHUNK_SIZE;
use gantry_core::config::RegistryConfig;
use serde_json::{Value, json};
use tower::ServiceExt;

const CHUNK: usize = TEST_CHUNK_SIZE as usize;

async fn request(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn send_chunk(
    router: &axum::Router,
    upload_id: &str,
    chunk: &[u8],
    index: u32,
    total: u32,
    file_type: &str,
) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/chunk/{upload_id}"))
        .header("Content-Type", multipart_content_type())
        .body(Body::from(chunk_body(chunk, index, total, file_type)))
        .unwrap();
    request(router, req).await
}

fn sqlite_config(config: &mut gantry_core::config::AppConfig) {
    // The registry file lives beside the uploads so a restarted server on
    // the same root finds both.
    if let gantry_core::config::StorageConfig::Filesystem { path } = &config.storage {
        config.registry = RegistryConfig::Sqlite {
            path: path.parent().unwrap().join("registry.db"),
        };
    }
}

#[tokio::test]
async fn multi_chunk_resume_across_restart() {
    let root = tempfile::tempdir().unwrap();

    let chunk0 = jpeg_bytes(CHUNK, 0xA0);
    let chunk1 = filled_bytes(CHUNK, 0xA1);
    let chunk2 = filled_bytes(CHUNK, 0xA2);

    // First process: init a 3-chunk upload, land chunks 0 and 2.
    let upload_id = {
        let server = TestServer::at_path(root.path(), sqlite_config).await;

        let init = Request::builder()
            .method("POST")
            .uri("/api/upload/init")
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({
                    "fileName": "resume.jpg",
                    "fileSize": 3 * TEST_CHUNK_SIZE,
                    "fileType": "image/jpeg",
                    "totalChunks": 3,
                }))
                .unwrap(),
            ))
            .unwrap();
        let (status, body) = request(&server.router, init).await;
        assert_eq!(status, StatusCode::OK);
        let upload_id = body["uploadId"].as_str().unwrap().to_string();

        let (status, _) =
            send_chunk(&server.router, &upload_id, &chunk0, 0, 3, "image/jpeg").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            send_chunk(&server.router, &upload_id, &chunk2, 2, 3, "image/jpeg").await;
        assert_eq!(status, StatusCode::OK);

        upload_id
        // Server dropped here: simulated process exit.
    };

    // Second process over the same root: acknowledged progress survives.
    let server = TestServer::at_path(root.path(), sqlite_config).await;

    let status_req = Request::builder()
        .method("GET")
        .uri(format!("/api/upload/status/{upload_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = request(&server.router, status_req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("receiving"));
    assert_eq!(body["uploadedChunks"], json!([0, 2]));
    assert_eq!(body["totalChunks"], json!(3));

    // Fill the hole and complete.
    let (status, _) = send_chunk(&server.router, &upload_id, &chunk1, 1, 3, "image/jpeg").await;
    assert_eq!(status, StatusCode::OK);

    let complete = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/complete/{upload_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = request(&server.router, complete).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], json!("completed"));

    // Assembled content equals chunk0 ‖ chunk1 ‖ chunk2.
    let assembled = std::fs::read(root.path().join("uploads/final/resume.jpg")).unwrap();
    assert_eq!(assembled.len(), 3 * CHUNK);
    assert_eq!(&assembled[..CHUNK], &chunk0[..]);
    assert_eq!(&assembled[CHUNK..2 * CHUNK], &chunk1[..]);
    assert_eq!(&assembled[2 * CHUNK..], &chunk2[..]);
}

#[tokio::test]
async fn duplicate_replay_after_restart_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let chunk0 = jpeg_bytes(CHUNK, 0x11);

    let upload_id = {
        let server = TestServer::at_path(root.path(), sqlite_config).await;
        let init = Request::builder()
            .method("POST")
            .uri("/api/upload/init")
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({
                    "fileName": "replay.jpg",
                    "fileSize": 2 * TEST_CHUNK_SIZE,
                    "fileType": "image/jpeg",
                    "totalChunks": 2,
                }))
                .unwrap(),
            ))
            .unwrap();
        let (_, body) = request(&server.router, init).await;
        let upload_id = body["uploadId"].as_str().unwrap().to_string();
        send_chunk(&server.router, &upload_id, &chunk0, 0, 2, "image/jpeg").await;
        upload_id
    };

    let server = TestServer::at_path(root.path(), sqlite_config).await;

    // A client replaying an already-acknowledged chunk gets an idempotent
    // success and no progress change.
    let (status, body) = send_chunk(&server.router, &upload_id, &chunk0, 0, 2, "image/jpeg").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"]["receivedCount"], json!(1));

    let record = server
        .state
        .registry
        .get(gantry_core::UploadId::parse(&upload_id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.bytes_received, TEST_CHUNK_SIZE);
}
