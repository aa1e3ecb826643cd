//! Per-session identity alias store.
//!
//! WhatsApp addresses one user under two jids: an `@lid` pseudonym and the
//! `@s.whatsapp.net` phone jid. The store keeps both directions of that
//! mapping in a small JSON file inside the session's auth directory so chat
//! identity survives aliasing across reconnects. Writes rewrite the whole
//! file atomically (temp file + rename).

use crate::worker::error::WorkerResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Suffix helpers shared across the worker.
pub fn is_pn_jid(jid: &str) -> bool {
    jid.ends_with("@s.whatsapp.net")
}

pub fn is_lid_jid(jid: &str) -> bool {
    jid.ends_with("@lid")
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AliasMaps {
    #[serde(default)]
    lid_to_pn: HashMap<String, String>,
    #[serde(default)]
    pn_to_lid: HashMap<String, String>,
}

/// Lazy-loaded, file-backed LID ↔ PN map for one session.
pub struct IdentityAliasStore {
    path: PathBuf,
    maps: Mutex<Option<AliasMaps>>,
}

impl IdentityAliasStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            maps: Mutex::new(None),
        }
    }

    /// Record a LID/PN pair in both directions. Saves only when the maps
    /// actually changed; returns whether they did.
    pub async fn remember_pair(&self, lid: &str, pn: &str) -> WorkerResult<bool> {
        if !is_lid_jid(lid) || !is_pn_jid(pn) {
            return Ok(false);
        }

        let mut guard = self.maps.lock().await;
        let maps = self.loaded(&mut guard).await?;

        if maps.lid_to_pn.get(lid).map(String::as_str) == Some(pn)
            && maps.pn_to_lid.get(pn).map(String::as_str) == Some(lid)
        {
            return Ok(false);
        }

        // Drop stale inverse entries so both maps stay exact inverses.
        if let Some(old_pn) = maps.lid_to_pn.insert(lid.to_string(), pn.to_string()) {
            if old_pn != pn {
                maps.pn_to_lid.remove(&old_pn);
            }
        }
        if let Some(old_lid) = maps.pn_to_lid.insert(pn.to_string(), lid.to_string()) {
            if old_lid != lid {
                maps.lid_to_pn.remove(&old_lid);
            }
        }

        let snapshot = maps.clone();
        self.save(&snapshot).await?;
        debug!(path = %self.path.display(), "identity alias map updated");
        Ok(true)
    }

    /// Canonicalize a jid: prefer a phone-jid fallback, then a known LID
    /// mapping, then the input unchanged.
    pub async fn resolve_canonical(&self, jid: &str, fallback_pn: Option<&str>) -> String {
        if let Some(pn) = fallback_pn {
            if is_pn_jid(pn) {
                return pn.to_string();
            }
        }
        if is_lid_jid(jid) {
            let mut guard = self.maps.lock().await;
            if let Ok(maps) = self.loaded(&mut guard).await {
                if let Some(pn) = maps.lid_to_pn.get(jid) {
                    return pn.clone();
                }
            }
        }
        jid.to_string()
    }

    /// Known phone jid for a LID, if any.
    pub async fn lookup_pn(&self, lid: &str) -> Option<String> {
        let mut guard = self.maps.lock().await;
        self.loaded(&mut guard).await.ok()?.lid_to_pn.get(lid).cloned()
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<AliasMaps>,
    ) -> WorkerResult<&'a mut AliasMaps> {
        if guard.is_none() {
            *guard = Some(self.load_from_disk().await?);
        }
        Ok(guard.as_mut().expect("maps loaded above"))
    }

    async fn load_from_disk(&self) -> WorkerResult<AliasMaps> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AliasMaps::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, maps: &AliasMaps) -> WorkerResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(&self.path);
        let body = serde_json::to_vec_pretty(maps)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "alias-map".to_string());
    name.push_str(&format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> IdentityAliasStore {
        IdentityAliasStore::new(dir.path().join("auth").join("identity-alias-map.json"))
    }

    #[tokio::test]
    async fn test_remember_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let changed = store
            .remember_pair("1203630@lid", "5511888@s.whatsapp.net")
            .await
            .unwrap();
        assert!(changed);

        assert_eq!(
            store.resolve_canonical("1203630@lid", None).await,
            "5511888@s.whatsapp.net"
        );
        // Unknown lid passes through.
        assert_eq!(store.resolve_canonical("999@lid", None).await, "999@lid");
    }

    #[tokio::test]
    async fn test_remember_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store
            .remember_pair("1@lid", "55@s.whatsapp.net")
            .await
            .unwrap());
        assert!(!store
            .remember_pair("1@lid", "55@s.whatsapp.net")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fallback_pn_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(
            store
                .resolve_canonical("1@lid", Some("77@s.whatsapp.net"))
                .await,
            "77@s.whatsapp.net"
        );
        // A non-phone fallback is ignored.
        assert_eq!(
            store.resolve_canonical("1@lid", Some("2@lid")).await,
            "1@lid"
        );
    }

    #[tokio::test]
    async fn test_canonical_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .remember_pair("1@lid", "55@s.whatsapp.net")
            .await
            .unwrap();

        for jid in ["1@lid", "55@s.whatsapp.net", "12345-678@g.us", "9@lid"] {
            let once = store.resolve_canonical(jid, None).await;
            let twice = store.resolve_canonical(&once, None).await;
            assert_eq!(once, twice, "jid: {}", jid);
        }
    }

    #[tokio::test]
    async fn test_maps_stay_inverse_after_remap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .remember_pair("1@lid", "55@s.whatsapp.net")
            .await
            .unwrap();
        // Same lid remaps to a new phone jid.
        store
            .remember_pair("1@lid", "66@s.whatsapp.net")
            .await
            .unwrap();

        assert_eq!(
            store.resolve_canonical("1@lid", None).await,
            "66@s.whatsapp.net"
        );
        // The stale inverse must be gone: a fresh store reading the same
        // file sees consistent maps.
        let reread = IdentityAliasStore::new(
            dir.path().join("auth").join("identity-alias-map.json"),
        );
        assert_eq!(reread.lookup_pn("1@lid").await.unwrap(), "66@s.whatsapp.net");
        let raw = std::fs::read_to_string(
            dir.path().join("auth").join("identity-alias-map.json"),
        )
        .unwrap();
        assert!(!raw.contains("55@s.whatsapp.net"));
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store_in(&dir);
            store
                .remember_pair("8@lid", "11@s.whatsapp.net")
                .await
                .unwrap();
        }
        let store = store_in(&dir);
        assert_eq!(
            store.resolve_canonical("8@lid", None).await,
            "11@s.whatsapp.net"
        );
    }

    #[test]
    fn test_jid_suffix_helpers() {
        assert!(is_pn_jid("1@s.whatsapp.net"));
        assert!(is_lid_jid("1@lid"));
        assert!(is_group_jid("1-2@g.us"));
        assert!(!is_pn_jid("1@lid"));
    }
}
