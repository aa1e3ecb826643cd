//! Cluster-wide per-session lock coordination.
//!
//! One session may be driven by exactly one worker process. The control
//! plane enforces that with a TTL lock; this coordinator acquires the lock
//! before a session starts, renews it on a timer for as long as the session
//! is held, and releases it on stop. A failed renewal clears local
//! ownership and reports the session on the lost-lock channel so the
//! manager can stop it gracefully.

use crate::worker::edge::{EdgeClient, LockOp};
use crate::worker::error::WorkerErrorKind;
use crate::worker::types::{LockRequest, LockResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Emitted when a held lock could not be renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLost {
    pub session_id: String,
}

struct HeldLock {
    token: Option<String>,
    renew_task: JoinHandle<()>,
}

/// Acquires, renews, and releases per-session locks.
pub struct LockCoordinator {
    edge: Arc<EdgeClient>,
    owner: String,
    ttl: Duration,
    renew_every: Duration,
    held: Mutex<HashMap<String, HeldLock>>,
    lost_tx: mpsc::UnboundedSender<LockLost>,
}

impl LockCoordinator {
    /// Create the coordinator and the channel the manager consumes
    /// lost-lock notifications from.
    pub fn new(
        edge: Arc<EdgeClient>,
        owner: String,
        ttl: Duration,
        renew_every: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LockLost>) {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                edge,
                owner,
                ttl,
                renew_every,
                held: Mutex::new(HashMap::new()),
                lost_tx,
            }),
            lost_rx,
        )
    }

    /// Whether this process currently holds the lock for a session.
    pub fn owns(&self, session_id: &str) -> bool {
        self.held.lock().expect("lock map poisoned").contains_key(session_id)
    }

    /// Acquire the lock for a session. Idempotent while held. Returns
    /// `false` on conflict or when the control plane does not know the
    /// session.
    pub async fn acquire(self: &Arc<Self>, session_id: &str) -> bool {
        if self.owns(session_id) {
            return true;
        }

        let req = LockRequest {
            instance_id: session_id,
            instance_owner: &self.owner,
            ttl_ms: self.ttl.as_millis() as u64,
            lock_token: None,
        };
        let resp = match self.edge.lock(LockOp::Acquire, &req).await {
            Ok(resp) => resp,
            Err(e) if e.kind == WorkerErrorKind::NotFound => {
                info!(session = session_id, "lock acquire skipped, session unknown to edge");
                return false;
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "lock acquire failed");
                return false;
            }
        };

        if !resp.acquired {
            warn!(
                session = session_id,
                holder = resp.instance_owner.as_deref().unwrap_or("?"),
                "lock conflict, session held elsewhere"
            );
            return false;
        }

        let renew_task = self.spawn_renewal(session_id.to_string());
        let mut held = self.held.lock().expect("lock map poisoned");
        held.insert(
            session_id.to_string(),
            HeldLock {
                token: resp.lock_token,
                renew_task,
            },
        );
        debug!(session = session_id, "lock acquired");
        true
    }

    /// Release the lock for a session. Local state is cleared regardless of
    /// the HTTP result; the release call itself is best-effort.
    pub async fn release(&self, session_id: &str) {
        let Some(held) = self
            .held
            .lock()
            .expect("lock map poisoned")
            .remove(session_id)
        else {
            return;
        };
        held.renew_task.abort();

        let req = LockRequest {
            instance_id: session_id,
            instance_owner: &self.owner,
            ttl_ms: self.ttl.as_millis() as u64,
            lock_token: held.token.as_deref(),
        };
        if let Err(e) = self.edge.lock(LockOp::Release, &req).await {
            warn!(session = session_id, error = %e, "lock release failed");
        } else {
            debug!(session = session_id, "lock released");
        }
    }

    /// Release every held lock; called once on shutdown.
    pub async fn release_all(&self) {
        let ids: Vec<String> = self
            .held
            .lock()
            .expect("lock map poisoned")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.release(&id).await;
        }
    }

    fn spawn_renewal(self: &Arc<Self>, session_id: String) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.renew_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !coordinator.renew_once(&session_id).await {
                    break;
                }
            }
        })
    }

    /// One renewal round. Returns `false` once the lock is gone.
    async fn renew_once(&self, session_id: &str) -> bool {
        let token = {
            let held = self.held.lock().expect("lock map poisoned");
            match held.get(session_id) {
                Some(h) => h.token.clone(),
                None => return false,
            }
        };

        let req = LockRequest {
            instance_id: session_id,
            instance_owner: &self.owner,
            ttl_ms: self.ttl.as_millis() as u64,
            lock_token: token.as_deref(),
        };
        let outcome: Result<LockResponse, _> = self.edge.lock(LockOp::Renew, &req).await;
        match outcome {
            Ok(resp) if resp.acquired => {
                if resp.lock_token.is_some() {
                    let mut held = self.held.lock().expect("lock map poisoned");
                    if let Some(h) = held.get_mut(session_id) {
                        h.token = resp.lock_token;
                    }
                }
                true
            }
            Ok(_) => {
                warn!(session = session_id, "lock renewal rejected, ownership lost");
                self.drop_ownership(session_id);
                false
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "lock renewal failed, ownership lost");
                self.drop_ownership(session_id);
                false
            }
        }
    }

    fn drop_ownership(&self, session_id: &str) {
        // Entry and renewal timer go together; the timer exits after this.
        self.held
            .lock()
            .expect("lock map poisoned")
            .remove(session_id);
        let _ = self.lost_tx.send(LockLost {
            session_id: session_id.to_string(),
        });
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}
