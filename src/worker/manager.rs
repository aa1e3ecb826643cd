//! Top-level session supervisor.
//!
//! Runs the discovery cycle against the control plane, computes the desired
//! session set, acquires the per-session lock before anything starts, and
//! tears sessions down when they leave the desired set (subject to the stop
//! cooldown), when their lock is lost, or on shutdown.

use crate::worker::config::{WorkerConfig, ELIGIBLE_LIMIT};
use crate::worker::connection::SessionRuntime;
use crate::worker::edge::EdgeClient;
use crate::worker::locks::{LockCoordinator, LockLost};
use crate::worker::socket::WaTransport;
use crate::worker::types::{EligibleInstance, WorkerSettings};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The typed handle runtimes hold back to their manager.
#[async_trait]
pub trait ManagerHandle: Send + Sync {
    /// Whether the last discovery cycle chose this session.
    fn is_desired(&self, session_id: &str) -> bool;

    /// Acquire the lock (idempotent) and start the session if idle.
    async fn ensure_running(&self, session_id: &str);

    /// Forget the session's runtime so the next ensure builds a fresh one.
    /// The lock is kept.
    async fn reset_runtime(&self, session_id: &str);

    /// Record a breaker cooldown floor that must survive a runtime reset.
    fn note_breaker_cooldown(&self, session_id: &str, until: Instant);
}

/// Supervises every session this process governs.
pub struct InstanceManager {
    cfg: Arc<WorkerConfig>,
    edge: Arc<EdgeClient>,
    transport: Arc<dyn WaTransport>,
    locks: Arc<LockCoordinator>,
    runtimes: Mutex<HashMap<String, Arc<SessionRuntime>>>,
    desired: RwLock<HashSet<String>>,
    discovery_running: AtomicBool,
    breaker_floors: Mutex<HashMap<String, Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<InstanceManager>,
}

impl InstanceManager {
    pub fn new(
        cfg: Arc<WorkerConfig>,
        edge: Arc<EdgeClient>,
        transport: Arc<dyn WaTransport>,
        locks: Arc<LockCoordinator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            cfg,
            edge,
            transport,
            locks,
            runtimes: Mutex::new(HashMap::new()),
            desired: RwLock::new(HashSet::new()),
            discovery_running: AtomicBool::new(false),
            breaker_floors: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Start the discovery ticker and the lost-lock consumer.
    pub fn start(self: &Arc<Self>, mut lock_lost: mpsc::UnboundedReceiver<LockLost>) {
        let manager = Arc::clone(self);
        let discovery = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.cfg.discovery_poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.discovery_cycle().await;
            }
        });

        let manager = Arc::clone(self);
        let lost = tokio::spawn(async move {
            while let Some(LockLost { session_id }) = lock_lost.recv().await {
                warn!(session = %session_id, "lock lost, stopping session");
                manager.stop_session(&session_id).await;
            }
        });

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(discovery);
        tasks.push(lost);
    }

    // ─── Discovery ───────────────────────────────────────────────────

    /// One discovery pass. Serialized by a running flag; back-to-back
    /// passes with unchanged control-plane state are no-ops.
    pub async fn discovery_cycle(&self) {
        if self.discovery_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.discovery_cycle_inner().await;
        self.discovery_running.store(false, Ordering::SeqCst);
    }

    async fn discovery_cycle_inner(&self) {
        let (settings, eligible) = tokio::join!(
            self.edge.get_settings(),
            self.edge
                .list_eligible(true, ELIGIBLE_LIMIT, "priority.desc"),
        );
        let eligible = match eligible {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "eligible-instances fetch failed, skipping cycle");
                return;
            }
        };

        let target_ids = compute_targets(settings, &eligible, self.cfg.fallback_max_active);
        debug!(targets = target_ids.len(), "discovery targets computed");

        {
            let mut desired = self.desired.write().expect("desired set poisoned");
            *desired = target_ids.iter().map(|(id, _)| id.clone()).collect();
        }

        for (id, priority) in &target_ids {
            self.ensure_running_with_priority(id, *priority).await;
        }

        // Stop sessions that fell out of the desired set, honouring the
        // stop cooldown for open ones.
        let to_stop: Vec<String> = {
            let desired = self.desired.read().expect("desired set poisoned");
            let runtimes = self.runtimes.lock().expect("runtime map poisoned");
            runtimes
                .iter()
                .filter(|(id, rt)| !desired.contains(*id) && rt.can_stop())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in to_stop {
            info!(session = %id, "session no longer desired, stopping");
            self.stop_session(&id).await;
        }
    }

    async fn ensure_running_with_priority(&self, session_id: &str, priority: i64) {
        if !self.locks.acquire(session_id).await {
            return;
        }

        let runtime = {
            let mut runtimes = self.runtimes.lock().expect("runtime map poisoned");
            if let Some(existing) = runtimes.get(session_id) {
                Arc::clone(existing)
            } else {
                let floor = self
                    .breaker_floors
                    .lock()
                    .expect("breaker floors poisoned")
                    .get(session_id)
                    .copied();
                let runtime = SessionRuntime::new(
                    session_id,
                    Arc::clone(&self.cfg),
                    Arc::clone(&self.edge),
                    Arc::clone(&self.transport),
                    self.as_handle(),
                    floor,
                );
                runtimes.insert(session_id.to_string(), Arc::clone(&runtime));
                runtime
            }
        };
        runtime.set_priority(priority);
        runtime.connect().await;
    }

    fn as_handle(&self) -> Arc<dyn ManagerHandle> {
        // The manager is always constructed behind an Arc (`new_cyclic`),
        // so the self reference upgrades for as long as `self` is callable.
        let manager: Arc<InstanceManager> =
            self.self_ref.upgrade().expect("manager alive");
        manager
    }

    // ─── Stop & shutdown ─────────────────────────────────────────────

    /// Stop one session and release its lock. When the lock was already
    /// lost upstream the release is a local no-op.
    async fn stop_session(&self, session_id: &str) {
        let runtime = self
            .runtimes
            .lock()
            .expect("runtime map poisoned")
            .remove(session_id);
        if let Some(runtime) = runtime {
            runtime.stop().await;
        }
        self.locks.release(session_id).await;
    }

    /// Ordered shutdown: discovery stops, every session stops, every lock
    /// is released best-effort.
    pub async fn shutdown(&self) {
        info!("shutting down session manager");
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }

        let ids: Vec<String> = self
            .runtimes
            .lock()
            .expect("runtime map poisoned")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.stop_session(&id).await;
        }
        self.locks.release_all().await;
        info!("session manager stopped");
    }

    /// Whether this process currently governs a session.
    pub fn governs(&self, session_id: &str) -> bool {
        self.runtimes
            .lock()
            .expect("runtime map poisoned")
            .contains_key(session_id)
    }

    /// Number of sessions currently governed.
    pub fn governed_count(&self) -> usize {
        self.runtimes.lock().expect("runtime map poisoned").len()
    }
}

// The handle trait is implemented directly on the manager; runtimes receive
// it as `Arc<dyn ManagerHandle>` cloned from the owning Arc.
#[async_trait]
impl ManagerHandle for InstanceManager {
    fn is_desired(&self, session_id: &str) -> bool {
        self.desired
            .read()
            .expect("desired set poisoned")
            .contains(session_id)
    }

    async fn ensure_running(&self, session_id: &str) {
        let priority = self
            .runtimes
            .lock()
            .expect("runtime map poisoned")
            .get(session_id)
            .map(|rt| rt.priority())
            .unwrap_or(0);
        self.ensure_running_with_priority(session_id, priority).await;
    }

    async fn reset_runtime(&self, session_id: &str) {
        self.runtimes
            .lock()
            .expect("runtime map poisoned")
            .remove(session_id);
    }

    fn note_breaker_cooldown(&self, session_id: &str, until: Instant) {
        self.breaker_floors
            .lock()
            .expect("breaker floors poisoned")
            .insert(session_id.to_string(), until);
    }
}

/// Stable prioritization: priority descending, ties kept in listing order,
/// then the cap from settings (or the fallback). A zero cap falls back to
/// the full ordered list.
pub fn compute_targets(
    settings: Option<WorkerSettings>,
    eligible: &[EligibleInstance],
    fallback_max: usize,
) -> Vec<(String, i64)> {
    let mut ordered: Vec<(usize, String, i64)> = eligible
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let id = item.id.clone().filter(|id| !id.trim().is_empty())?;
            Some((idx, id, item.priority.unwrap_or(0)))
        })
        .collect();
    // `sort_by` is stable, so the original index breaks ties.
    ordered.sort_by(|a, b| b.2.cmp(&a.2));

    let cap = settings
        .and_then(|s| s.max_active_instances)
        .map(|n| n.max(0) as usize)
        .unwrap_or(fallback_max);

    let take = if cap > 0 { cap.min(ordered.len()) } else { ordered.len() };
    ordered
        .into_iter()
        .take(take)
        .map(|(_, id, priority)| (id, priority))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eligible(items: &[(&str, i64)]) -> Vec<EligibleInstance> {
        items
            .iter()
            .map(|(id, priority)| EligibleInstance {
                id: Some(id.to_string()),
                priority: Some(*priority),
            })
            .collect()
    }

    #[test]
    fn test_compute_targets_stable_tie_break() {
        // Scenario: N=2, priorities B=10, C=10, A=5 → {B, C}.
        let list = eligible(&[("A", 5), ("B", 10), ("C", 10)]);
        let settings = Some(WorkerSettings {
            max_active_instances: Some(2),
        });
        let targets = compute_targets(settings, &list, 0);
        let ids: Vec<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["B", "C"]);
    }

    #[test]
    fn test_compute_targets_fallback_cap() {
        let list = eligible(&[("A", 1), ("B", 2), ("C", 3)]);
        let targets = compute_targets(None, &list, 1);
        let ids: Vec<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["C"]);
    }

    #[test]
    fn test_compute_targets_zero_cap_takes_all() {
        let list = eligible(&[("A", 1), ("B", 2)]);
        let targets = compute_targets(
            Some(WorkerSettings {
                max_active_instances: Some(0),
            }),
            &list,
            0,
        );
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_compute_targets_negative_cap_clamped() {
        let list = eligible(&[("A", 1), ("B", 2)]);
        let targets = compute_targets(
            Some(WorkerSettings {
                max_active_instances: Some(-3),
            }),
            &list,
            0,
        );
        // max(0, -3) = 0 → fallback to the full list.
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_compute_targets_filters_missing_ids() {
        let mut list = eligible(&[("A", 1)]);
        list.push(EligibleInstance {
            id: None,
            priority: Some(99),
        });
        list.push(EligibleInstance {
            id: Some("".into()),
            priority: Some(99),
        });
        let targets = compute_targets(None, &list, 0);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "A");
    }
}
