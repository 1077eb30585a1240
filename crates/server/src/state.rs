//! Application state shared across handlers.

use crate::manager::SessionManager;
use crate::ratelimit::RateLimitState;
use crate::scheduler::Scheduler;
use gantry_core::config::AppConfig;
use gantry_registry::SessionRegistry;
use gantry_store::BlobStore;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Blob store backend.
    pub store: Arc<dyn BlobStore>,
    /// Session registry.
    pub registry: Arc<dyn SessionRegistry>,
    /// Admission control.
    pub scheduler: Arc<Scheduler>,
    /// Session lifecycle orchestration.
    pub manager: Arc<SessionManager>,
    /// Rate limiting state.
    pub rate_limit: RateLimitState,
}

impl AppState {
    /// Create a new application state.
    ///
    /// This performs configuration validation and logs warnings for
    /// potentially dangerous settings. Panics if configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics if upload, scheduler, reaper, or rate limit configuration
    /// validation fails with an error.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn BlobStore>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Self {
        if let Err(error) = config.upload.validate() {
            panic!("Invalid upload configuration: {error}");
        }
        match config.scheduler.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {warning}");
                }
            }
            Err(error) => panic!("Invalid scheduler configuration: {error}"),
        }
        if let Err(error) = config.reaper.validate() {
            panic!("Invalid reaper configuration: {error}");
        }
        match config.rate_limit.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {warning}");
                }
            }
            Err(error) => panic!("Invalid rate limit configuration: {error}"),
        }

        let config = Arc::new(config);
        let rate_limit = RateLimitState::new(&config.rate_limit);
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let manager = Arc::new(SessionManager::new(
            config.clone(),
            registry.clone(),
            store.clone(),
            scheduler.clone(),
        ));

        Self {
            config,
            store,
            registry,
            scheduler,
            manager,
            rate_limit,
        }
    }

    /// Get the cleanup interval for the rate limiter, if enabled.
    /// Returns None if rate limiting is disabled.
    /// Returns a default of 60 seconds if the configured interval is zero
    /// (to prevent tokio::time::interval from panicking).
    pub fn rate_limit_cleanup_interval(&self) -> Option<Duration> {
        if self.rate_limit.is_enabled() {
            let interval_secs = self.config.rate_limit.cleanup_interval_secs;
            if interval_secs == 0 {
                tracing::warn!("rate_limit.cleanup_interval_secs is 0, using default of 60 seconds");
                Some(Duration::from_secs(60))
            } else {
                Some(Duration::from_secs(interval_secs))
            }
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_registry::MemoryRegistry;
    use gantry_store::FilesystemStore;

    async fn build_state(config: AppConfig) -> (tempfile::TempDir, AppState) {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemStore::new(temp.path()).await.unwrap());
        let registry: Arc<dyn SessionRegistry> = Arc::new(MemoryRegistry::new());
        let state = AppState::new(config, store, registry);
        (temp, state)
    }

    #[tokio::test]
    async fn cleanup_interval_none_when_disabled() {
        let (_temp, state) = build_state(AppConfig::for_testing()).await;
        assert!(state.rate_limit_cleanup_interval().is_none());
    }

    #[tokio::test]
    async fn cleanup_interval_respects_config() {
        let mut config = AppConfig::for_testing();
        config.rate_limit.enabled = true;
        config.rate_limit.cleanup_interval_secs = 12;

        let (_temp, state) = build_state(config).await;
        assert_eq!(
            state.rate_limit_cleanup_interval(),
            Some(Duration::from_secs(12))
        );
    }

    #[tokio::test]
    #[should_panic(expected = "Invalid scheduler configuration")]
    async fn invalid_scheduler_config_panics() {
        let mut config = AppConfig::for_testing();
        config.scheduler.max_parallel_writes = 0;
        let _ = build_state(config).await;
    }
}
