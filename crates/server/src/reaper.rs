//! The reaper: periodic cleanup of abandoned and expired work.
//!
//! Two passes per tick:
//! - **Stale pass**: non-terminal sessions idle past the stale threshold are
//!   reaped and their staging artifacts deleted — abandoned uploads
//!   (Initialized or Receiving) are aborted, a wedged Assembling session is
//!   failed. The scan returns snapshots; the manager re-reads under the
//!   per-handle lock before acting, so a session touched after the scan is
//!   never reaped.
//! - **Retention pass**: completed sessions older than the retention bound
//!   have their assembled object removed. The record is purged as well when
//!   `reaper.purge_records` is set, otherwise it is kept with the
//!   final-object reference cleared.
//!
//! The first tick fires immediately on startup, which doubles as crash
//! recovery: work orphaned by a previous process (stale sessions, leftover
//! staging files of reaped uploads) is cleaned on boot.

use crate::state::AppState;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Counters from a single reaper pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Stale sessions moved to Aborted.
    pub reaped: u64,
    /// Completed sessions whose artifacts were removed.
    pub expired: u64,
    /// Sessions skipped because they were touched after the scan.
    pub skipped: u64,
    /// Errors encountered (logged, never fatal to the pass).
    pub errors: u64,
}

/// Spawn the periodic reaper task.
pub fn spawn_reaper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.reaper.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // The first tick completes immediately: one pass at startup.
            ticker.tick().await;
            let stats = run_reaper_pass(&state).await;
            if stats != ReaperStats::default() {
                tracing::info!(
                    reaped = stats.reaped,
                    expired = stats.expired,
                    skipped = stats.skipped,
                    errors = stats.errors,
                    "Reaper pass finished"
                );
            }
        }
    })
}

/// Run one stale + retention pass.
pub async fn run_reaper_pass(state: &AppState) -> ReaperStats {
    let mut stats = ReaperStats::default();
    let now = OffsetDateTime::now_utc();
    let batch = state.config.reaper.batch_size;

    // Stale pass.
    let stale_cutoff = now - state.config.reaper.stale_threshold();
    match state.registry.scan_stale(stale_cutoff, batch).await {
        Ok(candidates) => {
            for record in candidates {
                match state.manager.reap_if_stale(record.handle, stale_cutoff).await {
                    Ok(true) => stats.reaped += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            upload_id = %record.handle,
                            error = %e,
                            "Failed to reap stale session"
                        );
                    }
                }
            }
        }
        Err(e) => {
            stats.errors += 1;
            tracing::error!(error = %e, "Stale session scan failed");
        }
    }

    // Retention pass.
    let retention_cutoff = now - state.config.reaper.retention();
    match state
        .registry
        .scan_expired_completed(retention_cutoff, batch)
        .await
    {
        Ok(expired) => {
            for record in expired {
                let final_name = record.final_object.as_ref().map(|o| o.name.clone());
                if let Err(e) = state
                    .store
                    .delete_session_artifacts(record.handle, final_name.as_deref())
                    .await
                {
                    stats.errors += 1;
                    tracing::warn!(
                        upload_id = %record.handle,
                        error = %e,
                        "Failed to delete expired artifacts"
                    );
                    continue;
                }

                let outcome = if state.config.reaper.purge_records {
                    state.registry.delete(record.handle).await
                } else {
                    state.registry.clear_final_object(record.handle, now).await
                };
                match outcome {
                    Ok(()) => {
                        stats.expired += 1;
                        tracing::info!(
                            upload_id = %record.handle,
                            purged = state.config.reaper.purge_records,
                            "Retention expired completed upload"
                        );
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            upload_id = %record.handle,
                            error = %e,
                            "Failed to update registry after retention cleanup"
                        );
                    }
                }
            }
        }
        Err(e) => {
            stats.errors += 1;
            tracing::error!(error = %e, "Expired session scan failed");
        }
    }

    stats
}
