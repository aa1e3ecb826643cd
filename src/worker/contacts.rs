//! Sender contact resolution with a per-session TTL cache.
//!
//! Inbound relay needs a control-plane contact id for each sender. Results
//! are cached per jid; duplicate-key conflicts and transient failures are
//! negatively cached with their own cooldowns so a hot chat does not hammer
//! the resolve endpoint.

use crate::worker::alias::{is_lid_jid, is_pn_jid};
use crate::worker::config::{WorkerConfig, CONTACT_CACHE_MAX, CONTACT_CACHE_OK_TTL_MS};
use crate::worker::edge::EdgeClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    contact_id: Option<String>,
    expires_at: Instant,
}

/// Per-session resolve cache over `POST /contacts/resolve`.
pub struct ContactCache {
    session_id: String,
    edge: Arc<EdgeClient>,
    ok_ttl: Duration,
    error_ttl: Duration,
    duplicate_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ContactCache {
    pub fn new(session_id: &str, edge: Arc<EdgeClient>, cfg: &WorkerConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            edge,
            ok_ttl: Duration::from_millis(CONTACT_CACHE_OK_TTL_MS),
            error_ttl: cfg.contact_error_cooldown,
            duplicate_ttl: cfg.contact_duplicate_cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the contact id for a sender jid, consulting the cache first.
    pub async fn resolve(&self, jid: &str, push_name: Option<&str>) -> Option<String> {
        if let Some(hit) = self.cached(jid) {
            return hit;
        }

        let jid_type = jid_type_of(jid);
        let (contact_id, ttl) = match self
            .edge
            .resolve_contact(&self.session_id, jid, jid_type, push_name)
            .await
        {
            Ok(id) => (id, self.ok_ttl),
            Err(e) if e.is_duplicate_conflict() => {
                debug!(session = %self.session_id, jid, "contact resolve hit duplicate, caching null");
                (None, self.duplicate_ttl)
            }
            Err(e) => {
                warn!(session = %self.session_id, jid, error = %e, "contact resolve failed");
                (None, self.error_ttl)
            }
        };

        self.insert(jid, contact_id.clone(), ttl);
        contact_id
    }

    /// `Some(hit)` when a live entry exists; expired entries are dropped.
    fn cached(&self, jid: &str) -> Option<Option<String>> {
        let mut entries = self.entries.lock().expect("contact cache poisoned");
        match entries.get(jid) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.contact_id.clone()),
            Some(_) => {
                entries.remove(jid);
                None
            }
            None => None,
        }
    }

    fn insert(&self, jid: &str, contact_id: Option<String>, ttl: Duration) {
        let mut entries = self.entries.lock().expect("contact cache poisoned");
        entries.insert(
            jid.to_string(),
            CacheEntry {
                contact_id,
                expires_at: Instant::now() + ttl,
            },
        );

        if entries.len() > CONTACT_CACHE_MAX {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
        while entries.len() > CONTACT_CACHE_MAX {
            // Still over the cap: evict the entry closest to expiry.
            let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&victim);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn jid_type_of(jid: &str) -> &'static str {
    if is_lid_jid(jid) {
        "lid"
    } else if is_pn_jid(jid) {
        "pn"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::config::WorkerConfig;
    use std::path::PathBuf;

    fn test_cfg() -> WorkerConfig {
        WorkerConfig {
            edge_base_url: "http://127.0.0.1:9".into(),
            worker_secret: "s".into(),
            port: 0,
            http_timeout: Duration::from_millis(200),
            discovery_poll: Duration::from_secs(10),
            queue_poll: Duration::from_secs(2),
            auth_base: PathBuf::from("/tmp/a"),
            media_base: PathBuf::from("/tmp/m"),
            fallback_max_active: 0,
            lock_ttl: Duration::from_secs(30),
            lock_renew: Duration::from_secs(15),
            stop_cooldown: Duration::from_secs(60),
            bad_mac_window: Duration::from_secs(60),
            bad_mac_threshold: 20,
            bad_mac_cooldown: Duration::from_secs(300),
            contact_error_cooldown: Duration::from_millis(50),
            contact_duplicate_cooldown: Duration::from_secs(300),
            decrypt_retry_max_attempts: 3,
        }
    }

    fn cache() -> ContactCache {
        let cfg = test_cfg();
        let edge = Arc::new(EdgeClient::new(&cfg).unwrap());
        ContactCache::new("session-1", edge, &cfg)
    }

    #[test]
    fn test_jid_type_of() {
        assert_eq!(jid_type_of("1@lid"), "lid");
        assert_eq!(jid_type_of("1@s.whatsapp.net"), "pn");
        assert_eq!(jid_type_of("1-2@g.us"), "other");
    }

    #[test]
    fn test_cache_hit_and_expiry() {
        let c = cache();
        c.insert("a@s.whatsapp.net", Some("contact-1".into()), Duration::from_secs(60));
        assert_eq!(c.cached("a@s.whatsapp.net"), Some(Some("contact-1".into())));

        c.insert("b@s.whatsapp.net", None, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(c.cached("b@s.whatsapp.net"), None);
        // Expired entry was dropped on read.
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_cache_soft_purge_over_cap() {
        let c = cache();
        for i in 0..CONTACT_CACHE_MAX {
            c.insert(
                &format!("{}@s.whatsapp.net", i),
                None,
                Duration::from_millis(1),
            );
        }
        std::thread::sleep(Duration::from_millis(10));
        // One more insert purges the expired bulk.
        c.insert("fresh@s.whatsapp.net", None, Duration::from_secs(60));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_cache_evicts_soonest_expiry_when_all_live() {
        let c = cache();
        for i in 0..CONTACT_CACHE_MAX {
            c.insert(
                &format!("{}@s.whatsapp.net", i),
                None,
                Duration::from_secs(600),
            );
        }
        c.insert("near@s.whatsapp.net", None, Duration::from_secs(1));
        c.insert("far@s.whatsapp.net", None, Duration::from_secs(900));
        assert!(c.len() <= CONTACT_CACHE_MAX);
        // The near-expiry entry is the eviction victim, not the far one.
        assert!(c.cached("far@s.whatsapp.net").is_some());
    }

    #[tokio::test]
    async fn test_resolve_failure_negative_caches() {
        // Edge is unreachable: resolve fails and caches None.
        let c = cache();
        assert_eq!(c.resolve("x@s.whatsapp.net", None).await, None);
        assert_eq!(c.cached("x@s.whatsapp.net"), Some(None));
    }
}
