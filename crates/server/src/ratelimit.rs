//! Rate limiting middleware using token bucket algorithm.
//!
//! Three independent per-IP buckets with separate refill, selected by route
//! class:
//! - general: init/complete/status/delete traffic
//! - upload: the chunk ingest path (much higher rate)
//! - monitoring: stats and health reads
//!
//! # Memory Safety
//!
//! This implementation includes protection against memory exhaustion attacks:
//! - Configurable maximum tracked keys per bucket
//! - Automatic eviction of stale entries based on TTL
//! - Background cleanup task that runs periodically
//!
//! # Security Note
//!
//! By default, X-Forwarded-For and X-Real-IP headers are NOT trusted to prevent
//! IP spoofing attacks. You must explicitly configure `trusted_proxies` to enable
//! header-based IP detection:
//!
//! - Empty list (default): Only direct connection IP is used (most secure)
//! - List of IPs/CIDRs: Headers trusted only when request comes from these IPs
//! - ["*"]: Trust headers from all sources (NOT recommended for production)

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::{DashMap, mapref::entry::Entry};
use gantry_core::config::RateLimitConfig;
use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState,
};
use ipnet::IpNet;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Type alias for the keyed per-IP rate limiter.
type KeyedLimiter =
    RateLimiter<String, DashMap<String, InMemoryState>, DefaultClock, NoOpMiddleware>;

/// Which bucket a route class draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateScope {
    General,
    Upload,
    Monitoring,
}

impl RateScope {
    fn name(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Upload => "upload",
            Self::Monitoring => "monitoring",
        }
    }
}

/// Minimum number of evictions before a limiter rebuild is considered.
/// Rebuilding resets in-flight rate state, so small cleanups skip it.
const REBUILD_EVICTION_MIN_COUNT: usize = 100;

/// Minimum interval between rebuilds; after this long we rebuild regardless
/// to eventually reclaim governor's internal map memory.
const REBUILD_MIN_INTERVAL: Duration = Duration::from_secs(300);

/// One token bucket plus its key-tracking state.
struct ScopedLimiter {
    limiter: RwLock<KeyedLimiter>,
    last_access: DashMap<String, Instant>,
    quota: Quota,
    at_capacity_warned: AtomicBool,
    last_rebuild: RwLock<Instant>,
}

impl ScopedLimiter {
    fn new(per_minute: u32, burst: u32) -> Self {
        let quota =
            Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::new(60).unwrap()))
                .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::new(1).unwrap()));
        Self {
            limiter: RwLock::new(RateLimiter::dashmap(quota)),
            last_access: DashMap::new(),
            quota,
            at_capacity_warned: AtomicBool::new(false),
            last_rebuild: RwLock::new(Instant::now()),
        }
    }

    fn check(&self, ip: &str, scope: RateScope, max_entries: u32) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let key = ip.to_string();

        // Check capacity before acquiring the entry lock; DashMap's len() can
        // deadlock if called while holding an entry lock. Slightly racy, but
        // the entry API prevents duplicate inserts and the worst case is a
        // brief overshoot bounded by concurrent threads.
        let current_len = self.last_access.len();
        let at_capacity = current_len >= max_entries as usize;

        match self.last_access.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                if at_capacity {
                    if !self.at_capacity_warned.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            scope = scope.name(),
                            current_entries = current_len,
                            max_entries = max_entries,
                            "Rate limiter at capacity, rejecting new entries. \
                             This warning is logged once per capacity event to prevent log spam."
                        );
                    }
                    return Err(RateLimitError {
                        retry_after_secs: 60,
                        reason: RateLimitReason::AtCapacity,
                    });
                }
                entry.insert(now);
            }
        }

        let limiter = self.limiter.read().unwrap_or_else(|poisoned| {
            tracing::warn!("rate limiter RwLock was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        });
        match limiter.check_key(&key) {
            Ok(_) => Ok(()),
            Err(not_until) => {
                let wait_time =
                    not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                Err(RateLimitError {
                    retry_after_secs: wait_time.as_secs() + 1,
                    reason: RateLimitReason::RateLimited,
                })
            }
        }
    }

    /// Evict keys idle past `ttl`; rebuild the governor limiter when enough
    /// state was dropped to justify resetting live buckets.
    fn cleanup(&self, scope: RateScope, ttl: Duration) -> usize {
        let now = Instant::now();

        let stale_keys: Vec<String> = self
            .last_access
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale_keys {
            // Atomically remove only if still stale; a concurrent request may
            // have refreshed the timestamp since collection.
            if self
                .last_access
                .remove_if(&key, |_, last| now.duration_since(*last) > ttl)
                .is_some()
            {
                evicted += 1;
            }
        }

        if evicted == 0 {
            return 0;
        }

        self.at_capacity_warned.store(false, Ordering::Relaxed);

        // Governor's internal DashMap doesn't support key removal; without a
        // periodic rebuild its memory grows with every key ever seen.
        let due_by_interval = {
            let last = self.last_rebuild.read().unwrap_or_else(|p| p.into_inner());
            now.duration_since(*last) >= REBUILD_MIN_INTERVAL
        };
        if evicted >= REBUILD_EVICTION_MIN_COUNT || due_by_interval {
            let mut limiter = self.limiter.write().unwrap_or_else(|p| p.into_inner());
            *limiter = RateLimiter::dashmap(self.quota);
            drop(limiter);
            let mut last = self.last_rebuild.write().unwrap_or_else(|p| p.into_inner());
            *last = Instant::now();
            tracing::debug!(
                scope = scope.name(),
                evicted = evicted,
                remaining = self.last_access.len(),
                "Rebuilt rate limiter after cleanup"
            );
        }

        evicted
    }
}

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    inner: Option<Arc<RateLimitStateInner>>,
}

struct RateLimitStateInner {
    general: ScopedLimiter,
    upload: ScopedLimiter,
    monitoring: ScopedLimiter,
    trusted_proxies: TrustedProxies,
    max_entries: u32,
    entry_ttl: Duration,
    connect_info_warned: AtomicBool,
}

/// A parsed trusted proxy entry (either an IP or CIDR range).
#[derive(Clone, Debug)]
enum TrustedEntry {
    Ip(IpAddr),
    Cidr(IpNet),
}

/// Trusted proxy configuration for IP extraction.
#[derive(Clone, Debug)]
enum TrustedProxies {
    /// Never trust forwarded headers (default, most secure).
    None,
    /// Trust headers from all sources (dangerous, for development only).
    All,
    /// Trust headers only from specific IPs/CIDRs.
    List(Vec<TrustedEntry>),
}

impl TrustedProxies {
    fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            Self::None
        } else if proxies.len() == 1 && proxies[0] == "*" {
            Self::All
        } else {
            let entries: Vec<TrustedEntry> = proxies
                .iter()
                .filter_map(|p| {
                    if p.contains('/') {
                        match p.parse::<IpNet>() {
                            Ok(net) => Some(TrustedEntry::Cidr(net)),
                            Err(e) => {
                                tracing::warn!("Invalid CIDR in trusted_proxies: '{}': {}", p, e);
                                None
                            }
                        }
                    } else {
                        match p.parse::<IpAddr>() {
                            Ok(ip) => Some(TrustedEntry::Ip(ip)),
                            Err(e) => {
                                tracing::warn!("Invalid IP in trusted_proxies: '{}': {}", p, e);
                                None
                            }
                        }
                    }
                })
                .collect();
            Self::List(entries)
        }
    }

    /// Check if the given connection IP is a trusted proxy.
    fn is_trusted(&self, connection_ip: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(entries) => {
                let ip: IpAddr = match connection_ip.parse() {
                    Ok(ip) => ip,
                    Err(_) => return false,
                };
                entries.iter().any(|entry| match entry {
                    TrustedEntry::Ip(trusted) => *trusted == ip,
                    TrustedEntry::Cidr(network) => network.contains(&ip),
                })
            }
        }
    }
}

impl RateLimitState {
    /// Create a new rate limit state from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }

        Self {
            inner: Some(Arc::new(RateLimitStateInner {
                general: ScopedLimiter::new(config.general_per_minute, config.burst_size),
                upload: ScopedLimiter::new(config.upload_per_minute, config.burst_size),
                monitoring: ScopedLimiter::new(config.monitoring_per_minute, config.burst_size),
                trusted_proxies: TrustedProxies::from_config(&config.trusted_proxies),
                max_entries: config.max_entries,
                entry_ttl: Duration::from_secs(config.entry_ttl_secs),
                connect_info_warned: AtomicBool::new(false),
            })),
        }
    }

    /// Check if a request from `ip` is allowed against `scope`'s bucket.
    pub fn check(&self, scope: RateScope, ip: &str) -> Result<(), RateLimitError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        inner.scoped(scope).check(ip, scope, inner.max_entries)
    }

    /// Check if rate limiting is enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Clean up stale entries from all buckets.
    /// Returns the number of entries evicted.
    pub fn cleanup(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        [RateScope::General, RateScope::Upload, RateScope::Monitoring]
            .into_iter()
            .map(|scope| inner.scoped(scope).cleanup(scope, inner.entry_ttl))
            .sum()
    }

    /// Tracked key counts per bucket (general, upload, monitoring).
    pub fn entry_counts(&self) -> (usize, usize, usize) {
        match &self.inner {
            Some(inner) => (
                inner.general.last_access.len(),
                inner.upload.last_access.len(),
                inner.monitoring.last_access.len(),
            ),
            None => (0, 0, 0),
        }
    }

    /// Log a warning if ConnectInfo is not available (only once).
    fn warn_connect_info_missing(&self) {
        if let Some(inner) = &self.inner
            && !inner.connect_info_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "ConnectInfo not available for rate limiting. All requests will share a single \
                 rate limit bucket ('unknown' IP). Add .into_make_service_with_connect_info::<SocketAddr>() \
                 to your server configuration to enable per-IP rate limiting."
            );
        }
    }
}

impl RateLimitStateInner {
    fn scoped(&self, scope: RateScope) -> &ScopedLimiter {
        match scope {
            RateScope::General => &self.general,
            RateScope::Upload => &self.upload,
            RateScope::Monitoring => &self.monitoring,
        }
    }
}

/// Reason for rate limit rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// Request exceeded rate limit.
    RateLimited,
    /// Rate limiter at capacity, cannot track new entries.
    AtCapacity,
}

/// Error returned when rate limit is exceeded.
#[derive(Debug)]
pub struct RateLimitError {
    /// Number of seconds to wait before retrying.
    pub retry_after_secs: u64,
    /// Reason for the rate limit.
    pub reason: RateLimitReason,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let (code, message) = match self.reason {
            RateLimitReason::RateLimited => (
                "rate_limited",
                format!(
                    "Rate limit exceeded. Retry after {} seconds.",
                    self.retry_after_secs
                ),
            ),
            RateLimitReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "Server is experiencing high load. Please retry later.".to_string(),
            ),
        };

        let body = serde_json::json!({
            "code": code,
            "message": message,
            "retry_after": self.retry_after_secs,
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            axum::Json(body),
        )
            .into_response()
    }
}

/// Extract client IP address from request headers (only if trusted).
fn extract_forwarded_ip(req: &Request<Body>) -> Option<String> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(s) = forwarded.to_str()
        && let Some(ip) = s.split(',').next()
    {
        // First IP in the chain is the client.
        return Some(ip.trim().to_string());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(s) = real_ip.to_str()
    {
        return Some(s.trim().to_string());
    }

    None
}

/// Extract connection IP from request extensions (set by ConnectInfo).
fn extract_connection_ip(req: &Request<Body>) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

/// Extract client IP address from request.
///
/// # Security
///
/// This function respects the trusted_proxies configuration:
/// - If no proxies are trusted, always uses the direct connection IP
/// - If specific proxies are trusted, only reads forwarded headers when
///   the connection comes from a trusted proxy IP
/// - If all proxies are trusted ("*"), always reads forwarded headers (unsafe)
fn extract_ip(req: &Request<Body>, state: &RateLimitState) -> String {
    let Some(inner) = &state.inner else {
        return "unknown".to_string();
    };

    let connection_ip = extract_connection_ip(req);

    let trust_headers = match (&connection_ip, &inner.trusted_proxies) {
        // No connection info available - only the all-trusting config reads headers.
        (None, TrustedProxies::All) => true,
        (None, TrustedProxies::List(_)) | (None, TrustedProxies::None) => false,
        (Some(conn_ip), trusted_proxies) => trusted_proxies.is_trusted(conn_ip),
    };

    if trust_headers && let Some(forwarded_ip) = extract_forwarded_ip(req) {
        return forwarded_ip;
    }

    match connection_ip {
        Some(ip) => ip,
        None => {
            state.warn_connect_info_missing();
            "unknown".to_string()
        }
    }
}

/// Per-IP rate limiting middleware for one route class.
///
/// Attach with `middleware::from_fn_with_state((state, scope), ...)` so each
/// route group draws from its own bucket.
pub async fn rate_limit_middleware(
    State((rate_limit, scope)): State<(RateLimitState, RateScope)>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() {
        return next.run(req).await;
    }

    let ip = extract_ip(&req, &rate_limit);

    match rate_limit.check(scope, &ip) {
        Ok(_) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

/// Spawn a background task that periodically cleans up stale rate limiter entries.
pub fn spawn_cleanup_task(
    state: RateLimitState,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted = state.cleanup();
            if evicted > 0 {
                tracing::info!(
                    evicted = evicted,
                    "Rate limiter cleanup task evicted stale entries"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            general_per_minute: 60,
            upload_per_minute: 120,
            monitoring_per_minute: 60,
            burst_size: 5,
            max_entries: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_state_allows_everything() {
        let config = RateLimitConfig {
            enabled: false,
            ..Default::default()
        };
        let state = RateLimitState::new(&config);
        assert!(!state.is_enabled());
        for scope in [RateScope::General, RateScope::Upload, RateScope::Monitoring] {
            assert!(state.check(scope, "127.0.0.1").is_ok());
        }
    }

    #[test]
    fn burst_exhaustion_rejects() {
        let state = RateLimitState::new(&enabled_config());

        for _ in 0..5 {
            assert!(state.check(RateScope::General, "127.0.0.1").is_ok());
        }
        let result = state.check(RateScope::General, "127.0.0.1");
        assert!(
            result.is_err(),
            "Should be rate limited after burst is exhausted"
        );

        // Different IP has its own bucket.
        assert!(state.check(RateScope::General, "192.168.1.1").is_ok());
    }

    #[test]
    fn buckets_are_independent() {
        let state = RateLimitState::new(&enabled_config());

        for _ in 0..5 {
            assert!(state.check(RateScope::General, "10.0.0.1").is_ok());
        }
        assert!(state.check(RateScope::General, "10.0.0.1").is_err());

        // Exhausting the general bucket must not touch the upload bucket.
        assert!(state.check(RateScope::Upload, "10.0.0.1").is_ok());
        assert!(state.check(RateScope::Monitoring, "10.0.0.1").is_ok());
    }

    #[test]
    fn max_entries_bounds_tracked_ips() {
        let config = RateLimitConfig {
            max_entries: 3,
            ..enabled_config()
        };
        let state = RateLimitState::new(&config);

        assert!(state.check(RateScope::General, "1.1.1.1").is_ok());
        assert!(state.check(RateScope::General, "2.2.2.2").is_ok());
        assert!(state.check(RateScope::General, "3.3.3.3").is_ok());

        let result = state.check(RateScope::General, "4.4.4.4");
        match result {
            Err(e) => assert_eq!(e.reason, RateLimitReason::AtCapacity),
            Ok(_) => panic!("expected at-capacity rejection"),
        }

        // Existing IPs still work.
        assert!(state.check(RateScope::General, "1.1.1.1").is_ok());
    }

    #[test]
    fn cleanup_evicts_stale_entries() {
        let config = RateLimitConfig {
            entry_ttl_secs: 0,
            ..enabled_config()
        };
        let state = RateLimitState::new(&config);

        assert!(state.check(RateScope::General, "1.1.1.1").is_ok());
        assert!(state.check(RateScope::Upload, "2.2.2.2").is_ok());

        let (general, upload, _) = state.entry_counts();
        assert_eq!(general, 1);
        assert_eq!(upload, 1);

        std::thread::sleep(Duration::from_millis(10));
        let evicted = state.cleanup();
        assert_eq!(evicted, 2);

        let (general, upload, _) = state.entry_counts();
        assert_eq!(general, 0);
        assert_eq!(upload, 0);
    }

    #[test]
    fn trusted_proxies_parsing() {
        let none = TrustedProxies::from_config(&[]);
        assert!(!none.is_trusted("127.0.0.1"));

        let all = TrustedProxies::from_config(&["*".to_string()]);
        assert!(all.is_trusted("127.0.0.1"));
        assert!(all.is_trusted("anything"));

        let list =
            TrustedProxies::from_config(&["127.0.0.1".to_string(), "10.0.0.0/8".to_string()]);
        assert!(list.is_trusted("127.0.0.1"));
        assert!(list.is_trusted("10.255.255.255"));
        assert!(!list.is_trusted("192.168.1.1"));
        assert!(!list.is_trusted("11.0.0.1"));
    }
}
