//! Session registry abstraction and implementations for gantry.
//!
//! The registry is the canonical mapping of upload handle to session record.
//! Two implementations are provided:
//! - [`MemoryRegistry`]: process-local, for development and tests
//! - [`SqliteRegistry`]: durable, survives restart (crash recovery restores
//!   every session whose last mutation was acknowledged)
//!
//! All mutations are invoked by the session manager under a per-handle
//! critical section; each registry operation is additionally atomic on its
//! own and refuses transitions that would violate a session invariant.

pub mod error;
pub mod memory;
pub mod models;
pub(crate) mod mutate;
pub mod sqlite;

pub use error::{RegistryError, RegistryResult};
pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use gantry_core::config::RegistryConfig;
use gantry_core::{Failure, FinalObject, SessionRecord, SessionStatus, UploadId};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;

/// Result of recording a chunk: whether the index was new, plus the updated
/// record so callers can report progress without a second read.
#[derive(Clone, Debug)]
pub struct ChunkAck {
    /// False when the index was already present (duplicate acknowledgement).
    pub newly_recorded: bool,
    /// The record after the mutation.
    pub record: SessionRecord,
}

/// Aggregate registry counters for the monitoring surface.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RegistryStats {
    /// Sessions known to the registry (all statuses).
    pub total_sessions: u64,
    /// Sessions currently in a non-terminal status.
    pub active_sessions: u64,
    /// Sessions in the Failed status.
    pub failed_sessions: u64,
    /// Sessions in the Completed status.
    pub completed_sessions: u64,
    /// Bytes received across all sessions.
    pub total_bytes: u64,
    /// Mean derived upload speed over completed sessions, bytes/second.
    /// Zero when no completed session has a measurable window.
    pub average_speed_bps: f64,
}

/// Canonical session persistence.
#[async_trait]
pub trait SessionRegistry: Send + Sync + 'static {
    /// Insert a fresh record. Fails if the handle already exists.
    async fn create(&self, record: &SessionRecord) -> RegistryResult<()>;

    /// Snapshot read of a record.
    async fn get(&self, handle: UploadId) -> RegistryResult<Option<SessionRecord>>;

    /// Record a persisted chunk: sets the bitmap bit, adds `len` to the byte
    /// count (first recording only), moves Initialized to Receiving, stamps
    /// `first_chunk_at` and `last_activity_at`.
    ///
    /// Duplicate indices are an idempotent acknowledgement
    /// (`newly_recorded = false`, no byte-count change). Out-of-range
    /// indices and sessions that can no longer accept chunks are errors and
    /// leave the record unchanged.
    async fn mark_chunk_received(
        &self,
        handle: UploadId,
        index: u32,
        len: u64,
        now: OffsetDateTime,
    ) -> RegistryResult<ChunkAck>;

    /// Transition to `status`, stamping `last_activity_at`.
    ///
    /// Transitions out of a terminal status are refused and leave the record
    /// unchanged.
    async fn update_status(
        &self,
        handle: UploadId,
        status: SessionStatus,
        now: OffsetDateTime,
    ) -> RegistryResult<()>;

    /// Move a session to Failed or Aborted with a recorded reason.
    async fn record_failure(
        &self,
        handle: UploadId,
        status: SessionStatus,
        failure: &Failure,
        now: OffsetDateTime,
    ) -> RegistryResult<()>;

    /// Record the assembled object and move Assembling to Completed.
    async fn set_final_object(
        &self,
        handle: UploadId,
        object: &FinalObject,
        now: OffsetDateTime,
    ) -> RegistryResult<()>;

    /// Bump `last_activity_at` without any other change.
    async fn touch(&self, handle: UploadId, now: OffsetDateTime) -> RegistryResult<()>;

    /// Non-terminal sessions whose `last_activity_at` is before `cutoff`.
    ///
    /// Assembling sessions are included so an assembly wedged by a crash is
    /// eventually recovered; the reaper fails those rather than aborting
    /// them. Returns snapshots; the reaper re-reads under the per-handle
    /// lock before acting on one.
    async fn scan_stale(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<SessionRecord>>;

    /// Completed sessions whose `completed_at` is before `cutoff` and whose
    /// final object has not yet been cleared by the retention pass.
    async fn scan_expired_completed(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<SessionRecord>>;

    /// Drop the final-object reference after retention removed the artifact.
    ///
    /// The record stays Completed; the session simply no longer claims an
    /// on-disk object, which also keeps the retention scan from returning it
    /// again.
    async fn clear_final_object(&self, handle: UploadId, now: OffsetDateTime)
    -> RegistryResult<()>;

    /// Remove a record entirely.
    async fn delete(&self, handle: UploadId) -> RegistryResult<()>;

    /// Aggregate counters for monitoring.
    async fn stats(&self) -> RegistryResult<RegistryStats>;

    /// Check backend connectivity.
    async fn health_check(&self) -> RegistryResult<()>;
}

/// Create a session registry from configuration.
pub async fn from_config(config: &RegistryConfig) -> RegistryResult<Arc<dyn SessionRegistry>> {
    match config {
        RegistryConfig::Memory => Ok(Arc::new(MemoryRegistry::new()) as Arc<dyn SessionRegistry>),
        RegistryConfig::Sqlite { path } => {
            let registry = SqliteRegistry::new(path).await?;
            Ok(Arc::new(registry) as Arc<dyn SessionRegistry>)
        }
    }
}

/// Shared transition guard: statuses a session may move to from `from`.
///
/// Both backends funnel status changes through this check so the state
/// machine is enforced identically regardless of persistence.
pub(crate) fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    match (from, to) {
        // Terminal states never move again.
        (Completed | Failed | Aborted, _) => false,
        (Initialized, Receiving) => true,
        // Zero-chunk edge: an empty upload completes straight from Initialized.
        (Initialized | Receiving, Assembling) => true,
        (Assembling, Completed) => true,
        // Any live state may fail or be aborted.
        (Initialized | Receiving | Assembling, Failed | Aborted) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_config_memory() {
        let registry = from_config(&RegistryConfig::Memory).await.unwrap();
        registry.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_sqlite() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("registry.db");
        let registry = from_config(&RegistryConfig::Sqlite { path: path.clone() })
            .await
            .unwrap();
        registry.health_check().await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn transition_table() {
        use SessionStatus::*;
        assert!(transition_allowed(Initialized, Receiving));
        assert!(transition_allowed(Receiving, Assembling));
        assert!(transition_allowed(Assembling, Completed));
        assert!(transition_allowed(Initialized, Aborted));
        assert!(transition_allowed(Receiving, Failed));
        assert!(transition_allowed(Assembling, Failed));

        assert!(!transition_allowed(Completed, Aborted));
        assert!(!transition_allowed(Aborted, Receiving));
        assert!(!transition_allowed(Failed, Assembling));
        assert!(!transition_allowed(Receiving, Initialized));
        assert!(!transition_allowed(Assembling, Receiving));
    }
}
