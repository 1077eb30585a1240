//! Server test harness.

use gantry_core::config::AppConfig;
use gantry_server::{AppState, create_router};
use std::path::Path;
use tempfile::TempDir;

/// Chunk size used across server tests; small enough to keep payloads cheap.
pub const TEST_CHUNK_SIZE: u64 = 64 * 1024;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server on a fresh tempdir with default test config
    /// (in-memory registry, rate limiting off, small chunk size).
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with config modifications applied before the
    /// backends are built.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut server = Self::at_path(temp_dir.path(), modifier).await;
        server._temp_dir = Some(temp_dir);
        server
    }

    /// Create a test server rooted at an existing directory.
    ///
    /// The caller owns the directory's lifetime, which makes restart tests
    /// possible: build a second server over the same path.
    pub async fn at_path<F>(root: &Path, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = AppConfig::for_testing();
        config.upload.chunk_size = TEST_CHUNK_SIZE;
        config.storage = gantry_core::config::StorageConfig::Filesystem {
            path: root.join("uploads"),
        };
        modifier(&mut config);

        let store = gantry_store::from_config(&config.storage)
            .await
            .expect("Failed to create blob store");
        let registry = gantry_registry::from_config(&config.registry)
            .await
            .expect("Failed to create session registry");

        let state = AppState::new(config, store, registry);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: None,
        }
    }
}
