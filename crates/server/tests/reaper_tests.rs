//! Reaper behavior: stale abort and retention cleanup.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestServer;
use common::fixtures::{chunk_body, filled_bytes, multipart_content_type};
use common::server::TEST_CHUNK_SIZE;
use gantry_core::UploadId;
use gantry_server::reaper::run_reaper_pass;
use serde_json::{Value, json};
use time::OffsetDateTime;
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

async fn start_upload(server: &TestServer, name: &str, total: u32) -> UploadId {
    let init = Request::builder()
        .method("POST")
        .uri("/api/upload/init")
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "fileName": name,
                "fileSize": u64::from(total) * TEST_CHUNK_SIZE,
                "fileType": "text/plain",
                "totalChunks": total,
            }))
            .unwrap(),
        ))
        .unwrap();
    let (status, body) = request(&server.router, init).await;
    assert_eq!(status, StatusCode::OK);
    UploadId::parse(body["uploadId"].as_str().unwrap()).unwrap()
}

async fn put_chunk(server: &TestServer, handle: UploadId, index: u32, total: u32) {
    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/chunk/{handle}"))
        .header("Content-Type", multipart_content_type())
        .body(Body::from(chunk_body(
            &filled_bytes(CHUNK, index as u8),
            index,
            total,
            "text/plain",
        )))
        .unwrap();
    let (status, body) = request(&server.router, req).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

fn staging_chunks(server: &TestServer) -> Vec<String> {
    let gantry_core::config::StorageConfig::Filesystem { path } = &server.state.config.storage;
    std::fs::read_dir(path.join("chunks"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn stale_session_is_reaped_with_artifacts() {
    let server = TestServer::new().await;
    let handle = start_upload(&server, "stale.txt", 2).await;
    put_chunk(&server, handle, 0, 2).await;
    assert_eq!(staging_chunks(&server).len(), 1);

    // Rewind the activity clock past the stale threshold (default 30 min).
    let stale_time = OffsetDateTime::now_utc() - time::Duration::minutes(31);
    server
        .state
        .registry
        .touch(handle, stale_time)
        .await
        .unwrap();

    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.reaped, 1);
    assert_eq!(stats.errors, 0);

    // Aborted, with no staging artifacts left behind.
    let record = server.state.registry.get(handle).await.unwrap().unwrap();
    assert_eq!(record.status, gantry_core::SessionStatus::Aborted);
    assert_eq!(record.failure.unwrap().kind, "stale");
    assert!(staging_chunks(&server).is_empty());

    // A later chunk for the reaped session loses cleanly.
    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/chunk/{handle}"))
        .header("Content-Type", multipart_content_type())
        .body(Body::from(chunk_body(
            &filled_bytes(CHUNK, 1),
            1,
            2,
            "text/plain",
        )))
        .unwrap();
    let (status, body) = request(&server.router, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("cancelled"));
}

#[tokio::test]
async fn stale_assembling_session_fails_instead_of_aborting() {
    let server = TestServer::new().await;
    let handle = start_upload(&server, "wedged.txt", 1).await;
    put_chunk(&server, handle, 0, 1).await;

    // Simulate an assembly wedged by a crash: the session entered
    // Assembling long ago and never finished.
    let stale_time = OffsetDateTime::now_utc() - time::Duration::minutes(31);
    server
        .state
        .registry
        .update_status(handle, gantry_core::SessionStatus::Assembling, stale_time)
        .await
        .unwrap();

    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.reaped, 1);

    let record = server.state.registry.get(handle).await.unwrap().unwrap();
    assert_eq!(record.status, gantry_core::SessionStatus::Failed);
    assert_eq!(record.failure.unwrap().kind, "stale");
    assert!(staging_chunks(&server).is_empty());
}

#[tokio::test]
async fn recently_touched_session_is_never_reaped() {
    let server = TestServer::new().await;
    let handle = start_upload(&server, "fresh.txt", 2).await;
    put_chunk(&server, handle, 0, 2).await;

    // Just inside the threshold.
    let recent = OffsetDateTime::now_utc() - time::Duration::minutes(29);
    server.state.registry.touch(handle, recent).await.unwrap();

    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.reaped, 0);

    let record = server.state.registry.get(handle).await.unwrap().unwrap();
    assert_eq!(record.status, gantry_core::SessionStatus::Receiving);
    assert_eq!(staging_chunks(&server).len(), 1);
}

#[tokio::test]
async fn retention_removes_expired_final_objects() {
    // retention_days = 0 makes every completed session expire immediately.
    let server = TestServer::with_config(|config| {
        config.reaper.retention_days = 0;
    })
    .await;

    let handle = start_upload(&server, "old.txt", 1).await;
    put_chunk(&server, handle, 0, 1).await;
    let complete = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/complete/{handle}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&server.router, complete).await;
    assert_eq!(status, StatusCode::OK);

    let record = server.state.registry.get(handle).await.unwrap().unwrap();
    let final_path = record.final_object.unwrap().storage_path;
    assert!(final_path.exists());

    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.expired, 1);
    assert!(!final_path.exists());

    // Default policy keeps the record, now without an object reference.
    let record = server.state.registry.get(handle).await.unwrap().unwrap();
    assert_eq!(record.status, gantry_core::SessionStatus::Completed);
    assert!(record.final_object.is_none());

    // A second pass has nothing left to do.
    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.expired, 0);
}

#[tokio::test]
async fn retention_purges_records_when_configured() {
    let server = TestServer::with_config(|config| {
        config.reaper.retention_days = 0;
        config.reaper.purge_records = true;
    })
    .await;

    let handle = start_upload(&server, "purge.txt", 1).await;
    put_chunk(&server, handle, 0, 1).await;
    let complete = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/complete/{handle}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&server.router, complete).await;
    assert_eq!(status, StatusCode::OK);

    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.expired, 1);

    assert!(server.state.registry.get(handle).await.unwrap().is_none());

    let status_req = Request::builder()
        .method("GET")
        .uri(format!("/api/upload/status/{handle}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&server.router, status_req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn completed_sessions_are_not_stale_candidates() {
    let server = TestServer::new().await;
    let handle = start_upload(&server, "done.txt", 1).await;
    put_chunk(&server, handle, 0, 1).await;
    let complete = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/complete/{handle}"))
        .body(Body::empty())
        .unwrap();
    request(&server.router, complete).await;

    // Even with an ancient activity timestamp, completed sessions are not
    // aborted by the stale pass.
    let old = OffsetDateTime::now_utc() - time::Duration::hours(5);
    server.state.registry.touch(handle, old).await.unwrap();

    let stats = run_reaper_pass(&server.state).await;
    assert_eq!(stats.reaped, 0);

    let record = server.state.registry.get(handle).await.unwrap().unwrap();
    assert_eq!(record.status, gantry_core::SessionStatus::Completed);
}
