//! Worker configuration loaded from process environment.
//!
//! All cadence and threshold knobs have defaults tuned for production; the
//! only required variables are the edge base URL and the worker secret.

use crate::worker::error::{WorkerError, WorkerResult};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Reconnect backoff schedule, indexed by the per-session attempt counter.
pub const RECONNECT_BACKOFF_SECS: [u64; 6] = [2, 5, 10, 20, 40, 60];

/// Sleeps between send attempts after a session refresh.
pub const SESSION_REFRESH_BACKOFF_MS: [u64; 3] = [1000, 2000, 5000];

/// Maximum contact-cache entries per session before a purge.
pub const CONTACT_CACHE_MAX: usize = 500;

/// TTL for successfully resolved contact ids.
pub const CONTACT_CACHE_OK_TTL_MS: u64 = 300_000;

/// Eligibility listing page size.
pub const ELIGIBLE_LIMIT: usize = 50;

/// Worker configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Control-plane base URL (trailing `/inbound` stripped).
    pub edge_base_url: String,
    /// Bearer token for every edge call.
    pub worker_secret: String,
    /// Liveness server port.
    pub port: u16,
    pub http_timeout: Duration,
    pub discovery_poll: Duration,
    pub queue_poll: Duration,
    /// Per-session auth directories root.
    pub auth_base: PathBuf,
    /// Inbound media scratch root.
    pub media_base: PathBuf,
    /// Fallback cap when worker settings are unreachable.
    pub fallback_max_active: usize,
    pub lock_ttl: Duration,
    pub lock_renew: Duration,
    pub stop_cooldown: Duration,
    pub bad_mac_window: Duration,
    pub bad_mac_threshold: usize,
    pub bad_mac_cooldown: Duration,
    pub contact_error_cooldown: Duration,
    pub contact_duplicate_cooldown: Duration,
    /// Extra send attempts allowed after a session refresh.
    pub decrypt_retry_max_attempts: u32,
}

impl WorkerConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> WorkerResult<Self> {
        let edge_base_url = required("EDGE_BASE_URL").map(normalize_base_url)?;
        let worker_secret = required("WORKER_SECRET")?;

        let lock_ttl_ms = env_u64("INSTANCE_LOCK_TTL_MS", 30_000).max(5_000);
        let lock_renew_ms = match std::env::var("INSTANCE_LOCK_RENEW_MS") {
            Ok(raw) => parse_or_default("INSTANCE_LOCK_RENEW_MS", &raw, lock_ttl_ms / 2),
            Err(_) => lock_ttl_ms / 2,
        }
        .max(2_000);

        Ok(Self {
            edge_base_url,
            worker_secret,
            port: env_u64("PORT", 3000) as u16,
            http_timeout: Duration::from_millis(env_u64("HTTP_TIMEOUT_MS", 10_000)),
            discovery_poll: Duration::from_millis(env_u64("DISCOVERY_POLL_MS", 10_000)),
            queue_poll: Duration::from_millis(env_u64("QUEUE_POLL_MS", 2_000)),
            auth_base: PathBuf::from(env_str("AUTH_BASE", "/data/auth")),
            media_base: PathBuf::from(env_str("MEDIA_BASE", "/data/media")),
            fallback_max_active: env_u64("MAX_ACTIVE_INSTANCES", 0) as usize,
            lock_ttl: Duration::from_millis(lock_ttl_ms),
            lock_renew: Duration::from_millis(lock_renew_ms),
            stop_cooldown: Duration::from_millis(env_u64("STOP_COOLDOWN_MS", 60_000)),
            bad_mac_window: Duration::from_millis(env_u64("BAD_MAC_WINDOW_MS", 60_000)),
            bad_mac_threshold: env_u64("BAD_MAC_THRESHOLD", 20) as usize,
            bad_mac_cooldown: Duration::from_millis(env_u64("BAD_MAC_COOLDOWN_MS", 300_000)),
            contact_error_cooldown: Duration::from_millis(env_u64(
                "CONTACT_RESOLVE_ERROR_COOLDOWN_MS",
                60_000,
            )),
            contact_duplicate_cooldown: Duration::from_millis(env_u64(
                "CONTACT_RESOLVE_DUPLICATE_COOLDOWN_MS",
                300_000,
            )),
            decrypt_retry_max_attempts: env_u64("DECRYPT_RETRY_MAX_ATTEMPTS", 3) as u32,
        })
    }

    /// Cluster-wide lock owner id for this process: `<hostname>:<pid>`.
    pub fn owner_id() -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!("{}:{}", host, std::process::id())
    }

    /// Auth directory for one session.
    pub fn auth_dir(&self, session_id: &str) -> PathBuf {
        self.auth_base.join(session_id)
    }

    /// Media scratch directory for one session.
    pub fn media_dir(&self, session_id: &str) -> PathBuf {
        self.media_base.join(session_id)
    }

    /// Path of the persisted identity-alias map for one session.
    pub fn alias_map_path(&self, session_id: &str) -> PathBuf {
        self.auth_dir(session_id).join("identity-alias-map.json")
    }
}

fn required(name: &str) -> WorkerResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(WorkerError::internal(format!(
            "required env var {} is not set",
            name
        ))),
    }
}

fn normalize_base_url(raw: String) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/inbound")
        .unwrap_or(trimmed)
        .to_string()
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => parse_or_default(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or_default(name: &str, raw: &str, default: u64) -> u64 {
    match raw.trim().parse::<u64>() {
        Ok(v) => v,
        Err(_) => {
            warn!(var = name, value = raw, "invalid numeric env var, using default");
            default
        }
    }
}
