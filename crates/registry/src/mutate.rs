//! Invariant-checking mutations applied to session records.
//!
//! Both registry backends funnel writes through these functions so the
//! lifecycle rules hold identically whether state lives in memory or in
//! SQLite. Every function either applies the full mutation or returns an
//! error leaving the record untouched.

use crate::error::{RegistryError, RegistryResult};
use crate::transition_allowed;
use gantry_core::{Failure, FinalObject, SessionRecord, SessionStatus};
use time::OffsetDateTime;

/// Record a persisted chunk. Returns whether the index was newly set.
pub(crate) fn apply_chunk(
    record: &mut SessionRecord,
    index: u32,
    len: u64,
    now: OffsetDateTime,
) -> RegistryResult<bool> {
    if !record.status.is_active() {
        return Err(RegistryError::NotAccepting {
            status: record.status,
        });
    }
    let total = record.declared.total_chunks;
    if index >= total {
        return Err(RegistryError::IndexOutOfRange { index, total });
    }

    let newly_recorded = record.received.set(index);
    if newly_recorded {
        record.bytes_received += len;
    }
    if record.status == SessionStatus::Initialized {
        record.status = SessionStatus::Receiving;
    }
    if record.first_chunk_at.is_none() {
        record.first_chunk_at = Some(now);
    }
    record.last_activity_at = now;
    Ok(newly_recorded)
}

/// Transition to `status`.
pub(crate) fn apply_status(
    record: &mut SessionRecord,
    status: SessionStatus,
    now: OffsetDateTime,
) -> RegistryResult<()> {
    if !transition_allowed(record.status, status) {
        return Err(RegistryError::InvalidTransition {
            from: record.status,
            to: status,
        });
    }
    record.status = status;
    record.last_activity_at = now;
    Ok(())
}

/// Move to Failed or Aborted with a reason.
pub(crate) fn apply_failure(
    record: &mut SessionRecord,
    status: SessionStatus,
    failure: &Failure,
    now: OffsetDateTime,
) -> RegistryResult<()> {
    if !matches!(status, SessionStatus::Failed | SessionStatus::Aborted) {
        return Err(RegistryError::Internal(format!(
            "record_failure called with non-failure status {status}"
        )));
    }
    apply_status(record, status, now)?;
    record.failure = Some(failure.clone());
    Ok(())
}

/// Record the assembled object and complete the session.
pub(crate) fn apply_final_object(
    record: &mut SessionRecord,
    object: &FinalObject,
    now: OffsetDateTime,
) -> RegistryResult<()> {
    apply_status(record, SessionStatus::Completed, now)?;
    record.final_object = Some(object.clone());
    record.completed_at = Some(now);
    Ok(())
}
