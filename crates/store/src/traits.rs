//! Blob store trait definition.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::UploadId;
use std::path::PathBuf;

/// Durable storage for staged chunks and assembled objects.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Persist one chunk under `(handle, index)`.
    ///
    /// The write is flushed to disk before this returns; a success is an
    /// acknowledgement the client may rely on across restarts. Writes that
    /// would exceed available disk space fail with `StoreError::Exhausted`.
    /// Concurrent writes for the same `(handle, index)` are safe: exactly
    /// one payload wins and both callers see success.
    async fn write_chunk(&self, handle: UploadId, index: u32, data: Bytes) -> StoreResult<()>;

    /// Read a staged chunk back.
    async fn read_chunk(&self, handle: UploadId, index: u32) -> StoreResult<Bytes>;

    /// Check whether a staged chunk exists.
    async fn chunk_exists(&self, handle: UploadId, index: u32) -> StoreResult<bool>;

    /// Size in bytes of a staged chunk.
    async fn chunk_len(&self, handle: UploadId, index: u32) -> StoreResult<u64>;

    /// Concatenate chunks `0..total_chunks` in ascending index order into
    /// the final namespace under `out_name`.
    ///
    /// At most one chunk is buffered in memory at a time. The output becomes
    /// visible atomically; on any error the partial temp file is removed.
    /// Returns the final path and the assembled byte length.
    async fn assemble(
        &self,
        handle: UploadId,
        total_chunks: u32,
        out_name: &str,
    ) -> StoreResult<(PathBuf, u64)>;

    /// Remove one staged chunk. Missing chunks are not an error.
    async fn delete_chunk(&self, handle: UploadId, index: u32) -> StoreResult<()>;

    /// Remove every staging chunk for `handle`, then the final object when
    /// `final_name` is given. Individual failures are logged and skipped;
    /// the return value is the number of staging chunks removed.
    async fn delete_session_artifacts(
        &self,
        handle: UploadId,
        final_name: Option<&str>,
    ) -> StoreResult<u64>;

    /// Bytes currently available on the backing volume, if the platform can
    /// report it. `None` means unknown (treated as unlimited).
    fn available_space(&self) -> Option<u64>;

    /// Verify the backend is reachable and writable.
    async fn health_check(&self) -> StoreResult<()>;
}
