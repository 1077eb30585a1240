//! Upload session types and lifecycle.

use crate::bitmap::ChunkBitmap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum stored length of a failure message, in bytes.
const MAX_FAILURE_MESSAGE_LEN: usize = 256;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidHandle(e.to_string()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session created, no chunk accepted yet.
    Initialized,
    /// At least one chunk accepted, more outstanding.
    Receiving,
    /// All chunks present; assembly in progress.
    Assembling,
    /// Final object assembled and recorded.
    Completed,
    /// Unrecoverable write or assembly error.
    Failed,
    /// Explicitly cancelled or reaped.
    Aborted,
}

impl SessionStatus {
    /// Check if the session can still accept chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initialized | Self::Receiving)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Stable wire name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Receiving => "receiving",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parse a stable wire name back into a status.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "receiving" => Ok(Self::Receiving),
            "assembling" => Ok(Self::Assembling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(crate::Error::Session(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-declared properties of the object being uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declared {
    /// Sanitized file name (no path separators).
    pub file_name: String,
    /// Declared total size in bytes.
    pub file_size: u64,
    /// Declared MIME type.
    pub media_type: String,
    /// Declared chunk count, must equal ceil(file_size / chunk_size).
    pub total_chunks: u32,
}

/// Failure reason recorded on terminal error states.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Stable error-kind tag (e.g. "io_failure", "stale").
    pub kind: String,
    /// Bounded human-readable detail.
    pub message: String,
}

impl Failure {
    /// Create a failure reason, truncating the message to its stored bound.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_FAILURE_MESSAGE_LEN {
            let mut cut = MAX_FAILURE_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            kind: kind.into(),
            message,
        }
    }
}

/// The assembled output of a completed session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalObject {
    /// File name in the final namespace.
    pub name: String,
    /// Assembled size in bytes.
    pub size: u64,
    /// Media type carried over from the declaration.
    pub media_type: String,
    /// When assembly finished.
    #[serde(with = "time::serde::rfc3339")]
    pub assembled_at: OffsetDateTime,
    /// Path of the assembled object on durable storage.
    pub storage_path: PathBuf,
}

/// A session record: the unit of state persisted per upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session handle.
    pub handle: UploadId,
    /// Client-declared object properties.
    pub declared: Declared,
    /// Server-imposed chunk size for this session.
    pub chunk_size: u64,
    /// Bitmap of chunk indices durably persisted.
    pub received: ChunkBitmap,
    /// Total bytes durably written; monotone.
    pub bytes_received: u64,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Advances on every accepted chunk and every transition.
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    /// When the first chunk was accepted, for derived speed.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub first_chunk_at: Option<OffsetDateTime>,
    /// Set on terminal success.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Present iff status is Failed or Aborted.
    pub failure: Option<Failure>,
    /// Present iff status is Completed.
    pub final_object: Option<FinalObject>,
}

impl SessionRecord {
    /// Create a fresh record in the `Initialized` state.
    pub fn new(declared: Declared, chunk_size: u64, now: OffsetDateTime) -> Self {
        let total = declared.total_chunks;
        Self {
            handle: UploadId::new(),
            declared,
            chunk_size,
            received: ChunkBitmap::new(total),
            bytes_received: 0,
            status: SessionStatus::Initialized,
            created_at: now,
            last_activity_at: now,
            first_chunk_at: None,
            completed_at: None,
            failure: None,
            final_object: None,
        }
    }

    /// Whether every declared chunk has been persisted.
    pub fn is_complete(&self) -> bool {
        self.received.count() == self.declared.total_chunks
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> Progress {
        Progress::new(self.received.count(), self.declared.total_chunks)
    }

    /// Upload throughput in bytes per second, derived on read.
    ///
    /// Measured from the first accepted chunk to the last activity (or
    /// completion). `None` until at least one chunk landed or when the
    /// elapsed window rounds to zero.
    pub fn upload_speed(&self) -> Option<f64> {
        let started = self.first_chunk_at?;
        let ended = self.completed_at.unwrap_or(self.last_activity_at);
        let elapsed = (ended - started).as_seconds_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.bytes_received as f64 / elapsed)
    }
}

/// Per-session progress returned on every accepted chunk.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Distinct chunk indices persisted so far.
    pub received_count: u32,
    /// Declared chunk total.
    pub total_count: u32,
    /// Whole-number percentage in `[0, 100]`.
    pub percentage: u8,
}

impl Progress {
    /// Build a progress snapshot from received/total counts.
    pub fn new(received_count: u32, total_count: u32) -> Self {
        let percentage = if total_count == 0 {
            100
        } else {
            ((u64::from(received_count) * 100) / u64::from(total_count)) as u8
        };
        Self {
            received_count,
            total_count,
            percentage,
        }
    }
}
