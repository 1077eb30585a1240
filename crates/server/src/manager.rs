//! Session lifecycle orchestration.
//!
//! The manager owns the per-upload state machine
//! (`Initialized -> Receiving -> Assembling -> Completed`, with `Failed` and
//! `Aborted` edges) and coordinates the validator checks, the scheduler, the
//! blob store, and the registry. All registry mutations for a handle run
//! under that handle's lock; the lock is never held across blob I/O.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::scheduler::{AdmitError, Scheduler};
use dashmap::DashMap;
use gantry_core::config::AppConfig;
use gantry_core::{
    self as core, Declared, Failure, FinalObject, MediaType, Progress, SessionRecord,
    SessionStatus, UploadId, filename,
};
use gantry_registry::{RegistryError, SessionRegistry};
use gantry_store::{BlobStore, StoreError};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Validated init parameters.
#[derive(Clone, Debug)]
pub struct InitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub total_chunks: u32,
}

/// Declared fields echoed on every chunk request; must match the session.
#[derive(Clone, Debug)]
pub struct ChunkEcho {
    pub total_chunks: u32,
    pub file_type: String,
}

/// Result of a completion request.
#[derive(Clone, Debug)]
pub struct CompleteOutcome {
    pub status: SessionStatus,
    pub upload_speed: Option<f64>,
    pub final_object: Option<FinalObject>,
}

/// Indices a resuming client may skip.
#[derive(Clone, Debug)]
pub struct ResumeInfo {
    pub received_indices: Vec<u32>,
    pub total_count: u32,
}

/// Orchestrates session lifecycle across registry, scheduler, and store.
pub struct SessionManager {
    config: Arc<AppConfig>,
    registry: Arc<dyn SessionRegistry>,
    store: Arc<dyn BlobStore>,
    scheduler: Arc<Scheduler>,
    locks: DashMap<UploadId, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<dyn SessionRegistry>,
        store: Arc<dyn BlobStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            scheduler,
            locks: DashMap::new(),
        }
    }

    /// The per-handle critical section guarding registry mutations.
    fn lock_for(&self, handle: UploadId) -> Arc<Mutex<()>> {
        self.locks
            .entry(handle)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drop_lock(&self, handle: UploadId) {
        self.locks.remove(&handle);
    }

    /// Create a session from validated declared fields.
    #[tracing::instrument(skip(self, req), fields(file_size = req.file_size))]
    pub async fn init(&self, req: InitRequest) -> ApiResult<UploadId> {
        let file_name = filename::sanitize(&req.file_name)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        MediaType::parse(&req.file_type).map_err(|e| ApiError::BadRequest(e.to_string()))?;

        if req.file_size == 0 {
            return Err(ApiError::BadRequest("fileSize must be positive".to_string()));
        }
        let max = self.config.upload.max_file_size;
        if req.file_size > max {
            return Err(ApiError::BadRequest(format!(
                "fileSize {} exceeds maximum {max}",
                req.file_size
            )));
        }

        let chunk_size = self.config.upload.chunk_size;
        let expected_total = core::chunk_count(req.file_size, chunk_size);
        if u64::from(req.total_chunks) != expected_total {
            return Err(ApiError::BadRequest(format!(
                "totalChunks {} does not match fileSize {} at chunk size {chunk_size} \
                 (expected {expected_total})",
                req.total_chunks, req.file_size
            )));
        }

        let now = OffsetDateTime::now_utc();
        let record = SessionRecord::new(
            Declared {
                file_name,
                file_size: req.file_size,
                media_type: req.file_type,
                total_chunks: req.total_chunks,
            },
            chunk_size,
            now,
        );
        let handle = record.handle;
        self.registry.create(&record).await?;

        metrics::SESSIONS_CREATED.inc();
        metrics::ACTIVE_SESSIONS.inc();
        tracing::info!(
            upload_id = %handle,
            file_name = %record.declared.file_name,
            file_size = record.declared.file_size,
            total_chunks = record.declared.total_chunks,
            "Created upload session"
        );
        Ok(handle)
    }

    /// Validate, admit, persist, and record one chunk.
    #[tracing::instrument(skip(self, data, echo), fields(upload_id = %handle, chunk_index = index, size = data.len()))]
    pub async fn put_chunk(
        &self,
        handle: UploadId,
        index: u32,
        data: bytes::Bytes,
        echo: ChunkEcho,
    ) -> ApiResult<Progress> {
        let now = OffsetDateTime::now_utc();
        let snapshot = self.require(handle).await?;

        // Structural gate: the session must still be accepting chunks.
        match snapshot.status {
            SessionStatus::Aborted => {
                return Err(ApiError::Cancelled("session was aborted".to_string()));
            }
            SessionStatus::Failed => {
                return Err(ApiError::BadRequest(format!(
                    "session is failed: {}",
                    snapshot
                        .failure
                        .as_ref()
                        .map(|f| f.kind.as_str())
                        .unwrap_or("unknown")
                )));
            }
            status if !status.is_active() => {
                return Err(ApiError::BadRequest(format!(
                    "session is {status}, not accepting chunks"
                )));
            }
            _ => {}
        }

        // Declared fields must stay consistent across calls for a handle.
        if echo.total_chunks != snapshot.declared.total_chunks
            || echo.file_type != snapshot.declared.media_type
        {
            metrics::record_upload_error("conflict");
            self.touch(handle, now).await;
            return Err(ApiError::Conflict(format!(
                "declared fields changed: totalChunks {} fileType {:?} vs session {} {:?}",
                echo.total_chunks,
                echo.file_type,
                snapshot.declared.total_chunks,
                snapshot.declared.media_type
            )));
        }

        let total = snapshot.declared.total_chunks;
        if index >= total {
            metrics::record_upload_error("index_out_of_range");
            self.touch(handle, now).await;
            return Err(ApiError::BadRequest(format!(
                "chunkIndex {index} out of range (total {total})"
            )));
        }

        let chunk_size = snapshot.chunk_size;
        if data.len() as u64 > chunk_size {
            metrics::record_upload_error("chunk_too_large");
            self.touch(handle, now).await;
            return Err(ApiError::PayloadTooLarge(format!(
                "chunk size {} exceeds maximum {chunk_size}",
                data.len()
            )));
        }
        let expected_len =
            core::expected_chunk_len(snapshot.declared.file_size, chunk_size, index)
                .ok_or_else(|| {
                    ApiError::Internal(format!("chunk length undefined for index {index}"))
                })?;
        if data.len() as u64 != expected_len {
            metrics::record_upload_error("chunk_size_mismatch");
            self.touch(handle, now).await;
            return Err(ApiError::BadRequest(format!(
                "chunk {index} must be exactly {expected_len} bytes, got {}",
                data.len()
            )));
        }

        // Content sniffing on the leading chunk only.
        if index == 0 {
            let declared = MediaType::parse(&snapshot.declared.media_type)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            if let Err(e) = declared.check_leading_bytes(&data) {
                metrics::record_upload_error("signature_mismatch");
                self.touch(handle, now).await;
                return Err(ApiError::BadRequest(e.to_string()));
            }
        }

        // Duplicate fast path: already persisted, acknowledge idempotently
        // without another write.
        if snapshot.received.contains(index) {
            metrics::CHUNKS_DUPLICATE.inc();
            self.touch(handle, now).await;
            tracing::debug!(upload_id = %handle, chunk_index = index, "Duplicate chunk acknowledged");
            return Ok(snapshot.progress());
        }

        // Admission, then the bounded write.
        let permit = self.scheduler.admit(handle).await.map_err(|e| match e {
            AdmitError::Overloaded => {
                metrics::record_upload_error("overloaded");
                ApiError::Overloaded {
                    retry_after_secs: 1,
                }
            }
            AdmitError::Cancelled => ApiError::Cancelled("session was aborted".to_string()),
        })?;

        if permit.is_cancelled() {
            return Err(ApiError::Cancelled("session was aborted".to_string()));
        }

        let started = Instant::now();
        let write = tokio::time::timeout(
            permit.deadline(),
            self.store.write_chunk(handle, index, data.clone()),
        );
        let write_result = tokio::select! {
            res = write => res,
            _ = permit.cancelled() => {
                // The interrupted write's staging leftovers are reclaimed
                // with the session artifacts.
                return Err(ApiError::Cancelled("session was aborted".to_string()));
            }
        };

        let write_result = match write_result {
            Ok(inner) => inner,
            Err(_) => {
                metrics::record_upload_error("timeout");
                tracing::warn!(upload_id = %handle, chunk_index = index, "Chunk write deadline exceeded");
                return Err(ApiError::Timeout(format!(
                    "chunk {index} write exceeded {}s",
                    permit.deadline().as_secs()
                )));
            }
        };

        if let Err(e) = write_result {
            // Transient by policy: the session stays Receiving and the
            // client retries the same chunk.
            self.touch(handle, now).await;
            return Err(match e {
                StoreError::Exhausted { needed, available } => {
                    metrics::record_upload_error("exhausted");
                    ApiError::Exhausted { needed, available }
                }
                other => {
                    metrics::record_upload_error("io_failure");
                    tracing::warn!(upload_id = %handle, chunk_index = index, error = %other, "Chunk write failed");
                    ApiError::IoFailure(other.to_string())
                }
            });
        }

        // A write that completed after cancellation is garbage.
        if permit.is_cancelled() {
            let _ = self.store.delete_chunk(handle, index).await;
            return Err(ApiError::Cancelled("session was aborted".to_string()));
        }

        // Registry update under the per-handle critical section.
        let lock = self.lock_for(handle);
        let guard = lock.lock().await;
        let ack = match self
            .registry
            .mark_chunk_received(handle, index, expected_len, OffsetDateTime::now_utc())
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                drop(guard);
                // The chunk landed but the session is gone or no longer
                // accepting; the write is garbage.
                let _ = self.store.delete_chunk(handle, index).await;
                return Err(match e {
                    RegistryError::NotFound(_) => {
                        ApiError::NotFound("upload session not found".to_string())
                    }
                    RegistryError::NotAccepting {
                        status: SessionStatus::Aborted,
                    } => ApiError::Cancelled("session was aborted".to_string()),
                    other => other.into(),
                });
            }
        };
        drop(guard);

        metrics::CHUNK_WRITE_DURATION.observe(started.elapsed().as_secs_f64());
        if ack.newly_recorded {
            metrics::CHUNKS_RECEIVED.inc();
            metrics::BYTES_RECEIVED.inc_by(expected_len);
        } else {
            // A concurrent writer for the same index won the race; this
            // acknowledgement is idempotent.
            metrics::CHUNKS_DUPLICATE.inc();
        }

        tracing::debug!(
            upload_id = %handle,
            chunk_index = index,
            size = expected_len,
            newly_recorded = ack.newly_recorded,
            "Chunk persisted"
        );
        Ok(ack.record.progress())
    }

    /// Drive a fully-received session through assembly. Idempotent: repeated
    /// calls on an Assembling or Completed session report current state.
    #[tracing::instrument(skip(self), fields(upload_id = %handle))]
    pub async fn complete(&self, handle: UploadId) -> ApiResult<CompleteOutcome> {
        let now = OffsetDateTime::now_utc();

        let record = {
            let lock = self.lock_for(handle);
            let _guard = lock.lock().await;
            let record = self.require(handle).await?;

            match record.status {
                SessionStatus::Completed => {
                    return Ok(CompleteOutcome {
                        status: SessionStatus::Completed,
                        upload_speed: record.upload_speed(),
                        final_object: record.final_object.clone(),
                    });
                }
                SessionStatus::Assembling => {
                    // Another caller is assembling; report, don't error.
                    return Ok(CompleteOutcome {
                        status: SessionStatus::Assembling,
                        upload_speed: record.upload_speed(),
                        final_object: None,
                    });
                }
                SessionStatus::Aborted => {
                    return Err(ApiError::Cancelled("session was aborted".to_string()));
                }
                SessionStatus::Failed => {
                    return Err(ApiError::BadRequest(format!(
                        "session failed: {}",
                        record
                            .failure
                            .as_ref()
                            .map(|f| f.kind.as_str())
                            .unwrap_or("unknown")
                    )));
                }
                SessionStatus::Initialized | SessionStatus::Receiving => {}
            }

            if !record.is_complete() {
                let missing = record.declared.total_chunks - record.received.count();
                metrics::record_upload_error("incomplete");
                return Err(ApiError::BadRequest(format!(
                    "upload incomplete: {missing} of {} chunks missing",
                    record.declared.total_chunks
                )));
            }

            self.registry
                .update_status(handle, SessionStatus::Assembling, now)
                .await?;
            record
        };

        // Assembly runs outside the lock; the Assembling status keeps every
        // other mutation out.
        let started = Instant::now();
        let assembled = self
            .store
            .assemble(
                handle,
                record.declared.total_chunks,
                &record.declared.file_name,
            )
            .await;

        let (path, size) = match assembled {
            Ok(ok) => ok,
            Err(e) => {
                self.fail(handle, "assembly_failed", &e.to_string()).await;
                return Err(ApiError::IoFailure(format!("assembly failed: {e}")));
            }
        };

        if size != record.declared.file_size {
            self.fail(
                handle,
                "assembly_size_mismatch",
                &format!("assembled {size} bytes, declared {}", record.declared.file_size),
            )
            .await;
            return Err(ApiError::IoFailure(format!(
                "assembled object is {size} bytes, declared {}",
                record.declared.file_size
            )));
        }

        let object = FinalObject {
            name: record.declared.file_name.clone(),
            size,
            media_type: record.declared.media_type.clone(),
            assembled_at: OffsetDateTime::now_utc(),
            storage_path: path,
        };

        {
            let lock = self.lock_for(handle);
            let _guard = lock.lock().await;
            self.registry
                .set_final_object(handle, &object, OffsetDateTime::now_utc())
                .await?;
        }

        // Staging chunks are folded into the final object; reclaim them.
        if let Err(e) = self.store.delete_session_artifacts(handle, None).await {
            tracing::warn!(upload_id = %handle, error = %e, "Failed to clean staging chunks after assembly");
        }
        self.scheduler.release_session(handle);
        self.drop_lock(handle);

        metrics::ASSEMBLE_DURATION.observe(started.elapsed().as_secs_f64());
        metrics::SESSIONS_COMPLETED.inc();
        metrics::ACTIVE_SESSIONS.dec();

        let final_record = self.require(handle).await?;
        tracing::info!(
            upload_id = %handle,
            file_name = %object.name,
            size = object.size,
            "Upload completed"
        );
        Ok(CompleteOutcome {
            status: SessionStatus::Completed,
            upload_speed: final_record.upload_speed(),
            final_object: Some(object),
        })
    }

    /// Lock-free status snapshot.
    pub async fn status(&self, handle: UploadId) -> ApiResult<SessionRecord> {
        self.require(handle).await
    }

    /// Indices a client may safely skip when resuming.
    pub async fn resume(&self, handle: UploadId) -> ApiResult<ResumeInfo> {
        let record = self.require(handle).await?;
        Ok(ResumeInfo {
            received_indices: record.received.indices(),
            total_count: record.declared.total_chunks,
        })
    }

    /// Abort a session and delete its artifacts and record.
    ///
    /// Idempotent with respect to the session's state: an already-terminal
    /// session is simply removed.
    #[tracing::instrument(skip(self), fields(upload_id = %handle))]
    pub async fn delete(&self, handle: UploadId) -> ApiResult<()> {
        let now = OffsetDateTime::now_utc();
        self.scheduler.cancel_session(handle);

        let record = {
            let lock = self.lock_for(handle);
            let _guard = lock.lock().await;
            let record = self.require(handle).await?;

            if !record.status.is_terminal() {
                self.registry
                    .record_failure(
                        handle,
                        SessionStatus::Aborted,
                        &Failure::new("aborted", "cancelled by client"),
                        now,
                    )
                    .await?;
                metrics::SESSIONS_ABORTED.inc();
                metrics::ACTIVE_SESSIONS.dec();
            }
            record
        };

        let final_name = record.final_object.as_ref().map(|o| o.name.as_str());
        if let Err(e) = self
            .store
            .delete_session_artifacts(handle, final_name)
            .await
        {
            tracing::warn!(upload_id = %handle, error = %e, "Failed to delete session artifacts");
        }

        {
            let lock = self.lock_for(handle);
            let _guard = lock.lock().await;
            self.registry.delete(handle).await?;
        }
        self.drop_lock(handle);

        tracing::info!(upload_id = %handle, "Upload deleted");
        Ok(())
    }

    /// Reaper entry point: reap `handle` if it is still stale.
    ///
    /// Abandoned uploads (Initialized or Receiving) are aborted; a session
    /// stuck in Assembling past the threshold is a crashed or wedged
    /// assembly and moves to Failed instead. Re-reads under the per-handle
    /// lock before acting, so a session touched after the scan snapshot is
    /// never reaped.
    pub async fn reap_if_stale(&self, handle: UploadId, cutoff: OffsetDateTime) -> ApiResult<bool> {
        let now = OffsetDateTime::now_utc();

        let reaped = {
            let lock = self.lock_for(handle);
            let _guard = lock.lock().await;
            let Some(record) = self.registry.get(handle).await? else {
                return Ok(false);
            };
            if record.status.is_terminal() || record.last_activity_at >= cutoff {
                return Ok(false);
            }

            let (target, failure) = if record.status == SessionStatus::Assembling {
                (
                    SessionStatus::Failed,
                    Failure::new("stale", "assembly did not finish before stale threshold"),
                )
            } else {
                (
                    SessionStatus::Aborted,
                    Failure::new("stale", "no activity before stale threshold"),
                )
            };
            self.registry
                .record_failure(handle, target, &failure, now)
                .await?;
            Some(target)
        };

        if let Some(target) = reaped {
            self.scheduler.cancel_session(handle);
            if let Err(e) = self.store.delete_session_artifacts(handle, None).await {
                tracing::warn!(upload_id = %handle, error = %e, "Failed to delete artifacts of reaped session");
            }
            self.drop_lock(handle);
            metrics::SESSIONS_REAPED.inc();
            metrics::ACTIVE_SESSIONS.dec();
            tracing::info!(upload_id = %handle, status = %target, "Reaped stale session");
        }
        Ok(reaped.is_some())
    }

    /// Move a session to Failed with a recorded reason (best-effort).
    async fn fail(&self, handle: UploadId, kind: &str, message: &str) {
        metrics::record_upload_error(kind);
        let lock = self.lock_for(handle);
        let _guard = lock.lock().await;
        match self
            .registry
            .record_failure(
                handle,
                SessionStatus::Failed,
                &Failure::new(kind, message),
                OffsetDateTime::now_utc(),
            )
            .await
        {
            Ok(()) => {
                metrics::SESSIONS_FAILED.inc();
                metrics::ACTIVE_SESSIONS.dec();
            }
            Err(e) => {
                tracing::warn!(upload_id = %handle, error = %e, "Failed to record session failure");
            }
        }
    }

    async fn require(&self, handle: UploadId) -> ApiResult<SessionRecord> {
        self.registry
            .get(handle)
            .await?
            .ok_or_else(|| ApiError::NotFound("upload session not found".to_string()))
    }

    /// Best-effort `lastActivityAt` bump on structurally-rejected requests.
    async fn touch(&self, handle: UploadId, now: OffsetDateTime) {
        if let Err(e) = self.registry.touch(handle, now).await {
            tracing::debug!(upload_id = %handle, error = %e, "touch failed");
        }
    }
}
