//! In-memory session registry for development and tests.

use crate::error::{RegistryError, RegistryResult};
use crate::{ChunkAck, RegistryStats, SessionRegistry, mutate};
use async_trait::async_trait;
use dashmap::DashMap;
use gantry_core::{Failure, FinalObject, SessionRecord, SessionStatus, UploadId};
use time::OffsetDateTime;

/// Process-local registry backed by a concurrent map.
///
/// State dies with the process; production deployments use the SQLite
/// backend. Each operation locks only the touched entry, so reads of other
/// sessions never contend.
#[derive(Default)]
pub struct MemoryRegistry {
    sessions: DashMap<UploadId, SessionRecord>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        handle: UploadId,
        f: impl FnOnce(&mut SessionRecord) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut entry = self
            .sessions
            .get_mut(&handle)
            .ok_or_else(|| RegistryError::NotFound(handle.to_string()))?;
        f(entry.value_mut())
    }
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn create(&self, record: &SessionRecord) -> RegistryResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(record.handle) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(record.handle.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, handle: UploadId) -> RegistryResult<Option<SessionRecord>> {
        Ok(self.sessions.get(&handle).map(|r| r.clone()))
    }

    async fn mark_chunk_received(
        &self,
        handle: UploadId,
        index: u32,
        len: u64,
        now: OffsetDateTime,
    ) -> RegistryResult<ChunkAck> {
        self.with_record(handle, |record| {
            let newly_recorded = mutate::apply_chunk(record, index, len, now)?;
            Ok(ChunkAck {
                newly_recorded,
                record: record.clone(),
            })
        })
    }

    async fn update_status(
        &self,
        handle: UploadId,
        status: SessionStatus,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.with_record(handle, |record| mutate::apply_status(record, status, now))
    }

    async fn record_failure(
        &self,
        handle: UploadId,
        status: SessionStatus,
        failure: &Failure,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.with_record(handle, |record| {
            mutate::apply_failure(record, status, failure, now)
        })
    }

    async fn set_final_object(
        &self,
        handle: UploadId,
        object: &FinalObject,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.with_record(handle, |record| {
            mutate::apply_final_object(record, object, now)
        })
    }

    async fn touch(&self, handle: UploadId, now: OffsetDateTime) -> RegistryResult<()> {
        self.with_record(handle, |record| {
            record.last_activity_at = now;
            Ok(())
        })
    }

    async fn scan_stale(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<SessionRecord>> {
        let mut stale: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|r| !r.status.is_terminal() && r.last_activity_at < cutoff)
            .map(|r| r.clone())
            .collect();
        stale.sort_by_key(|r| r.last_activity_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn scan_expired_completed(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<SessionRecord>> {
        let mut expired: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|r| {
                r.status == SessionStatus::Completed
                    && r.final_object.is_some()
                    && r.completed_at.is_some_and(|t| t < cutoff)
            })
            .map(|r| r.clone())
            .collect();
        expired.sort_by_key(|r| r.completed_at);
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn clear_final_object(
        &self,
        handle: UploadId,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.with_record(handle, |record| {
            record.final_object = None;
            record.last_activity_at = now;
            Ok(())
        })
    }

    async fn delete(&self, handle: UploadId) -> RegistryResult<()> {
        self.sessions
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(handle.to_string()))
    }

    async fn stats(&self) -> RegistryResult<RegistryStats> {
        let mut stats = RegistryStats::default();
        let mut speed_sum = 0.0;
        let mut speed_samples = 0u64;
        for record in self.sessions.iter() {
            stats.total_sessions += 1;
            stats.total_bytes += record.bytes_received;
            match record.status {
                SessionStatus::Failed => stats.failed_sessions += 1,
                SessionStatus::Completed => {
                    stats.completed_sessions += 1;
                    if let Some(speed) = record.upload_speed() {
                        speed_sum += speed;
                        speed_samples += 1;
                    }
                }
                status if !status.is_terminal() => stats.active_sessions += 1,
                _ => {}
            }
        }
        if speed_samples > 0 {
            stats.average_speed_bps = speed_sum / speed_samples as f64;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RegistryResult<()> {
        Ok(())
    }
}
