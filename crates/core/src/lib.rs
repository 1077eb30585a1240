//! Core domain types and shared logic for the gantry upload coordinator.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload handles and session lifecycle
//! - The received-chunk bitmap
//! - Media type allow-set and magic-number signatures
//! - File name sanitization
//! - Application configuration

pub mod bitmap;
pub mod config;
pub mod error;
pub mod filename;
pub mod media;
pub mod session;

pub use bitmap::ChunkBitmap;
pub use error::{Error, Result};
pub use media::MediaType;
pub use session::{
    Declared, Failure, FinalObject, Progress, SessionRecord, SessionStatus, UploadId,
};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Maximum configurable chunk size: 16 MiB.
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum configurable chunk size: 64 KiB.
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Default maximum file size: 2 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Compute the chunk count a file of `file_size` bytes splits into.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size)
}

/// Expected byte length of chunk `index` within a file of `file_size` bytes.
///
/// Every chunk is exactly `chunk_size` bytes except the last, which carries
/// the remainder. Returns `None` for indices past the end of the file.
pub fn expected_chunk_len(file_size: u64, chunk_size: u64, index: u32) -> Option<u64> {
    let total = chunk_count(file_size, chunk_size);
    let index = u64::from(index);
    if index >= total {
        return None;
    }
    if index + 1 < total {
        Some(chunk_size)
    } else {
        Some(file_size - index * chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(100, 64), 2);
        assert_eq!(chunk_count(128, 64), 2);
        assert_eq!(chunk_count(1, 64), 1);
        assert_eq!(chunk_count(0, 64), 0);
    }

    #[test]
    fn expected_chunk_len_full_and_tail() {
        let size = 2 * DEFAULT_CHUNK_SIZE + 1;
        assert_eq!(
            expected_chunk_len(size, DEFAULT_CHUNK_SIZE, 0),
            Some(DEFAULT_CHUNK_SIZE)
        );
        assert_eq!(
            expected_chunk_len(size, DEFAULT_CHUNK_SIZE, 1),
            Some(DEFAULT_CHUNK_SIZE)
        );
        assert_eq!(expected_chunk_len(size, DEFAULT_CHUNK_SIZE, 2), Some(1));
        assert_eq!(expected_chunk_len(size, DEFAULT_CHUNK_SIZE, 3), None);
    }

    #[test]
    fn expected_chunk_len_exact_multiple() {
        let size = 2 * DEFAULT_CHUNK_SIZE;
        assert_eq!(
            expected_chunk_len(size, DEFAULT_CHUNK_SIZE, 1),
            Some(DEFAULT_CHUNK_SIZE)
        );
        assert_eq!(expected_chunk_len(size, DEFAULT_CHUNK_SIZE, 2), None);
    }
}
