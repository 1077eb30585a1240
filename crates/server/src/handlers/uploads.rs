//! Upload endpoint handlers.
//!
//! Thin HTTP adapters over the session manager: parse the wire shapes,
//! delegate, serialize the endpoint envelopes. All policy lives in the
//! manager and its collaborators.

use crate::error::{ApiError, ApiResult};
use crate::manager::{ChunkEcho, InitRequest};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use gantry_core::UploadId;
use serde::Deserialize;
use serde_json::{Value, json};

/// Maximum request body size for init and complete requests (64 KiB).
const MAX_CONTROL_BODY_SIZE: usize = 64 * 1024;

/// POST /api/upload/init - Create a new upload session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub total_chunks: u32,
}

/// Optional complete-request body.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    /// Client-computed checksum; accepted for forward compatibility,
    /// currently unused.
    #[serde(default)]
    pub checksum: Option<String>,
}

fn parse_handle(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// POST /api/upload/init
#[tracing::instrument(skip(state, req))]
pub async fn init_upload(
    State(state): State<AppState>,
    req: axum::extract::Request,
) -> ApiResult<Json<Value>> {
    let body: InitUploadRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_CONTROL_BODY_SIZE)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let handle = state
        .manager
        .init(InitRequest {
            file_name: body.file_name,
            file_size: body.file_size,
            file_type: body.file_type,
            total_chunks: body.total_chunks,
        })
        .await?;

    Ok(Json(json!({ "uploadId": handle.to_string() })))
}

/// POST /api/upload/chunk/{uploadId} - multipart chunk ingest.
///
/// Fields: `chunk` (binary payload), `chunkIndex`, `totalChunks`,
/// `fileType`. The body limit is enforced by the route layer at
/// chunk size plus framing overhead.
#[tracing::instrument(skip(state, multipart), fields(upload_id = %upload_id))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let handle = parse_handle(&upload_id)?;

    let mut chunk: Option<Bytes> = None;
    let mut chunk_index: Option<u32> = None;
    let mut total_chunks: Option<u32> = None;
    let mut file_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("chunk") => {
                chunk = Some(field.bytes().await.map_err(|e| {
                    ApiError::PayloadTooLarge(format!("failed to read chunk field: {e}"))
                })?);
            }
            Some("chunkIndex") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("chunkIndex: {e}")))?;
                chunk_index = Some(
                    text.parse()
                        .map_err(|_| ApiError::BadRequest(format!("invalid chunkIndex: {text}")))?,
                );
            }
            Some("totalChunks") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("totalChunks: {e}")))?;
                total_chunks = Some(
                    text.parse()
                        .map_err(|_| ApiError::BadRequest(format!("invalid totalChunks: {text}")))?,
                );
            }
            Some("fileType") => {
                file_type = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("fileType: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let chunk = chunk.ok_or_else(|| ApiError::BadRequest("missing chunk field".to_string()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| ApiError::BadRequest("missing chunkIndex field".to_string()))?;
    let total_chunks = total_chunks
        .ok_or_else(|| ApiError::BadRequest("missing totalChunks field".to_string()))?;
    let file_type =
        file_type.ok_or_else(|| ApiError::BadRequest("missing fileType field".to_string()))?;

    let progress = state
        .manager
        .put_chunk(
            handle,
            chunk_index,
            chunk,
            ChunkEcho {
                total_chunks,
                file_type,
            },
        )
        .await?;

    Ok(Json(json!({ "success": true, "progress": progress })))
}

/// POST /api/upload/complete/{uploadId}
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id))]
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: axum::extract::Request,
) -> ApiResult<Json<Value>> {
    let handle = parse_handle(&upload_id)?;

    // The body is optional: empty, or `{checksum}`.
    let bytes = axum::body::to_bytes(req.into_body(), MAX_CONTROL_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    let body: CompleteRequest = if bytes.is_empty() {
        CompleteRequest::default()
    } else {
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };
    if let Some(checksum) = &body.checksum {
        tracing::debug!(upload_id = %upload_id, checksum = %checksum, "Client-supplied checksum recorded");
    }

    let outcome = state.manager.complete(handle).await?;

    Ok(Json(json!({
        "success": true,
        "uploadSpeed": outcome.upload_speed,
        "status": outcome.status.as_str(),
    })))
}

/// GET /api/upload/status/{uploadId}
///
/// `uploadedChunks` lists the persisted indices, which is exactly the set a
/// resuming client may skip.
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let handle = parse_handle(&upload_id)?;
    let record = state.manager.status(handle).await?;
    let resume = state.manager.resume(handle).await?;

    Ok(Json(json!({
        "status": record.status.as_str(),
        "uploadedChunks": resume.received_indices,
        "totalChunks": resume.total_count,
        "progress": record.progress().percentage,
    })))
}

/// DELETE /api/upload/{uploadId}
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let handle = parse_handle(&upload_id)?;
    state.manager.delete(handle).await?;
    Ok(Json(json!({ "success": true })))
}
