//! Admission control for chunk writes.
//!
//! A bounded-concurrency gate between the receive path and the blob store:
//! - a global semaphore caps writes in flight across all sessions
//! - a per-session semaphore caps any one session's share
//! - waiters beyond a per-session queue bound fail fast with `Overloaded`
//! - aborting a session flips a watch channel observed by queued waiters and
//!   in-flight writes at their next suspension point
//!
//! Both semaphores grant FIFO, so when the global pool is saturated the
//! per-session caps interleave admission across sessions with queued work.

use dashmap::DashMap;
use gantry_core::UploadId;
use gantry_core::config::SchedulerConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

/// Why an admission request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// The session's wait queue is full; the client should retry.
    Overloaded,
    /// The session was cancelled while queued.
    Cancelled,
}

/// Per-session admission state.
struct SessionSlots {
    permits: Arc<Semaphore>,
    waiting: AtomicU32,
    cancel_tx: watch::Sender<bool>,
}

impl SessionSlots {
    fn new(per_session: u32) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(per_session as usize)),
            waiting: AtomicU32::new(0),
            cancel_tx,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// Decrements the waiter count when a queued admission resolves either way.
struct WaitGuard<'a>(&'a AtomicU32);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An admitted chunk write: holds one global and one per-session slot until
/// dropped, and carries the session's cancellation signal.
#[derive(Debug)]
pub struct WritePermit {
    _session: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    cancel_rx: watch::Receiver<bool>,
    deadline: Duration,
}

impl WritePermit {
    /// Whether the session was cancelled after admission.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves when the session is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone without a cancel signal: the session ended
            // normally, nothing to observe.
            std::future::pending::<()>().await;
        }
    }

    /// Wall-clock deadline the admitted write must finish within.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Bounded admission gate shared by all sessions.
pub struct Scheduler {
    config: SchedulerConfig,
    global: Arc<Semaphore>,
    sessions: DashMap<UploadId, Arc<SessionSlots>>,
}

impl Scheduler {
    /// Create a scheduler from validated configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.max_parallel_writes as usize));
        Self {
            config,
            global,
            sessions: DashMap::new(),
        }
    }

    fn slots(&self, handle: UploadId) -> Arc<SessionSlots> {
        self.sessions
            .entry(handle)
            .or_insert_with(|| Arc::new(SessionSlots::new(self.config.max_parallel_per_session)))
            .clone()
    }

    /// Admit one chunk write for `handle`.
    ///
    /// Fast path: when both a session slot and a global slot are free the
    /// write is admitted without queueing. Otherwise the request joins the
    /// session's bounded wait queue; past the bound it fails fast with
    /// `Overloaded`. Cancellation is checked before queueing and while
    /// waiting.
    pub async fn admit(&self, handle: UploadId) -> Result<WritePermit, AdmitError> {
        let slots = self.slots(handle);
        if slots.is_cancelled() {
            return Err(AdmitError::Cancelled);
        }

        let deadline = self.config.write_deadline();
        let cancel_rx = slots.cancel_tx.subscribe();

        // Fast path: both permits free, no queueing.
        if let Ok(session) = slots.permits.clone().try_acquire_owned() {
            match self.global.clone().try_acquire_owned() {
                Ok(global) => {
                    return Ok(WritePermit {
                        _session: session,
                        _global: global,
                        cancel_rx,
                        deadline,
                    });
                }
                Err(_) => {
                    // Keep the session slot while waiting for a global one
                    // below; it is part of this request's admission.
                    return self
                        .wait_for_global(slots.clone(), session, cancel_rx, deadline)
                        .await;
                }
            }
        }

        // Queued path: no session slot free.
        let waiting = slots.waiting.fetch_add(1, Ordering::Relaxed);
        let _guard = WaitGuard(&slots.waiting);
        if waiting >= self.config.queue_depth {
            crate::metrics::SCHEDULER_QUEUE_REJECTIONS.inc();
            return Err(AdmitError::Overloaded);
        }

        let mut rx = slots.cancel_tx.subscribe();
        let session = tokio::select! {
            permit = slots.permits.clone().acquire_owned() => {
                permit.map_err(|_| AdmitError::Cancelled)?
            }
            _ = rx.wait_for(|cancelled| *cancelled) => {
                return Err(AdmitError::Cancelled);
            }
        };

        drop(_guard);
        self.wait_for_global(slots, session, cancel_rx, deadline)
            .await
    }

    /// Second acquisition stage: a session slot is held, wait for a global
    /// one. Counted against the same per-session queue bound.
    async fn wait_for_global(
        &self,
        slots: Arc<SessionSlots>,
        session: OwnedSemaphorePermit,
        cancel_rx: watch::Receiver<bool>,
        deadline: Duration,
    ) -> Result<WritePermit, AdmitError> {
        let waiting = slots.waiting.fetch_add(1, Ordering::Relaxed);
        let _guard = WaitGuard(&slots.waiting);
        if waiting >= self.config.queue_depth {
            crate::metrics::SCHEDULER_QUEUE_REJECTIONS.inc();
            return Err(AdmitError::Overloaded);
        }

        let mut rx = slots.cancel_tx.subscribe();
        let global = tokio::select! {
            permit = self.global.clone().acquire_owned() => {
                permit.map_err(|_| AdmitError::Cancelled)?
            }
            _ = rx.wait_for(|cancelled| *cancelled) => {
                return Err(AdmitError::Cancelled);
            }
        };

        Ok(WritePermit {
            _session: session,
            _global: global,
            cancel_rx,
            deadline,
        })
    }

    /// Cancel every queued and in-flight write for `handle`.
    ///
    /// Waiters and permit holders observe the signal at their next
    /// suspension point; the admission state is dropped so the handle no
    /// longer pins memory.
    pub fn cancel_session(&self, handle: UploadId) {
        if let Some((_, slots)) = self.sessions.remove(&handle) {
            let _ = slots.cancel_tx.send(true);
        }
    }

    /// Drop admission state for a session that ended normally.
    pub fn release_session(&self, handle: UploadId) {
        self.sessions.remove(&handle);
    }

    /// Number of sessions with live admission state.
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }
}
