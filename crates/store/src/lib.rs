//! Blob store abstraction and filesystem backend for gantry.
//!
//! Chunks land in a staging namespace keyed by `(handle, index)`; completed
//! uploads are assembled into a final namespace under their sanitized name.
//! Assembly is atomic: a temp file is filled chunk by chunk, flushed, and
//! renamed into place, so a partial object is never visible under the final
//! name.

pub mod error;
pub mod filesystem;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use filesystem::FilesystemStore;
pub use traits::BlobStore;

use gantry_core::config::StorageConfig;
use std::sync::Arc;

/// Create a blob store from configuration.
pub async fn from_config(config: &StorageConfig) -> StoreResult<Arc<dyn BlobStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            let store = FilesystemStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn BlobStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_config_filesystem() {
        let temp = tempfile::tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("uploads"),
        };
        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(temp.path().join("uploads/chunks").is_dir());
        assert!(temp.path().join("uploads/final").is_dir());
    }
}
