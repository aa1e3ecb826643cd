//! Per-session connection state machine.
//!
//! One [`SessionRuntime`] exists per session governed by this process. It
//! owns the auth directory, the live socket, reconnect scheduling, QR
//! relay, the auth-wipe path, and the Bad-MAC circuit breaker. All events
//! and timers for a session run on its own event-loop task, so state
//! transitions are naturally serialized.

use crate::worker::alias::IdentityAliasStore;
use crate::worker::config::{WorkerConfig, RECONNECT_BACKOFF_SECS};
use crate::worker::contacts::ContactCache;
use crate::worker::edge::EdgeClient;
use crate::worker::error::{WorkerError, LOGGED_OUT_CODE, STREAM_RESTART_CODE};
use crate::worker::inbound::{self, RelayDeps};
use crate::worker::manager::ManagerHandle;
use crate::worker::outbound;
use crate::worker::qr;
use crate::worker::socket::{CloseInfo, WaEvent, WaSocket, WaTransport};
use crate::worker::types::{ConnectionState, SessionStatus};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Mutable per-session runtime state.
#[derive(Debug)]
pub struct RuntimeState {
    pub connection: ConnectionState,
    pub connected_at: Option<Instant>,
    pub reconnect_attempt: u32,
    pub intentional_stop: bool,
    pub bad_mac_window: VecDeque<Instant>,
    pub bad_mac_breaker_until: Option<Instant>,
}

impl RuntimeState {
    fn new(breaker_floor: Option<Instant>) -> Self {
        Self {
            connection: ConnectionState::Idle,
            connected_at: None,
            reconnect_attempt: 0,
            intentional_stop: false,
            bad_mac_window: VecDeque::new(),
            bad_mac_breaker_until: breaker_floor,
        }
    }
}

/// One governed session: state machine plus the handles it owns.
pub struct SessionRuntime {
    pub id: String,
    pub(crate) cfg: Arc<WorkerConfig>,
    pub(crate) edge: Arc<EdgeClient>,
    pub(crate) alias: Arc<IdentityAliasStore>,
    transport: Arc<dyn WaTransport>,
    manager: Arc<dyn ManagerHandle>,
    contacts: Arc<ContactCache>,
    state: Mutex<RuntimeState>,
    socket: Mutex<Option<Arc<dyn WaSocket>>>,
    outbound_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    priority: AtomicI64,
}

impl SessionRuntime {
    pub fn new(
        id: &str,
        cfg: Arc<WorkerConfig>,
        edge: Arc<EdgeClient>,
        transport: Arc<dyn WaTransport>,
        manager: Arc<dyn ManagerHandle>,
        breaker_floor: Option<Instant>,
    ) -> Arc<Self> {
        let alias = Arc::new(IdentityAliasStore::new(cfg.alias_map_path(id)));
        let contacts = Arc::new(ContactCache::new(id, Arc::clone(&edge), &cfg));
        Arc::new(Self {
            id: id.to_string(),
            cfg,
            edge,
            alias,
            transport,
            manager,
            contacts,
            state: Mutex::new(RuntimeState::new(breaker_floor)),
            socket: Mutex::new(None),
            outbound_task: Mutex::new(None),
            event_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            priority: AtomicI64::new(0),
        })
    }

    // ─── State queries ───────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().expect("state poisoned").connection
    }

    pub fn is_open(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    pub fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Stop-cooldown rule: open sessions must stay open for the configured
    /// minimum before they may be de-scheduled.
    pub fn can_stop(&self) -> bool {
        let state = self.state.lock().expect("state poisoned");
        if state.connection != ConnectionState::Open {
            return true;
        }
        match state.connected_at {
            Some(at) => at.elapsed() >= self.cfg.stop_cooldown,
            None => true,
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────

    /// Drive the session toward Open. No-op unless Idle.
    pub async fn connect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("state poisoned");
            match state.connection {
                ConnectionState::Idle | ConnectionState::WipedPendingRestart => {
                    state.connection = ConnectionState::Connecting;
                    state.intentional_stop = false;
                }
                _ => return,
            }
        }

        let auth_dir = self.cfg.auth_dir(&self.id);
        if let Err(e) = tokio::fs::create_dir_all(&auth_dir).await {
            error!(session = %self.id, error = %e, "auth dir create failed");
            self.state.lock().expect("state poisoned").connection = ConnectionState::Idle;
            return;
        }
        // Scratch dir for inbound media; best-effort.
        let _ = tokio::fs::create_dir_all(self.cfg.media_dir(&self.id)).await;

        self.edge
            .update_status(&self.id, SessionStatus::Connecting, None)
            .await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.transport.connect(&self.id, &auth_dir, events_tx).await {
            Ok(socket) => {
                *self.socket.lock().expect("socket slot poisoned") = Some(Arc::clone(&socket));
                let task = self.spawn_event_loop(socket, events_rx);
                if let Some(old) = self
                    .event_task
                    .lock()
                    .expect("event task slot poisoned")
                    .replace(task)
                {
                    old.abort();
                }
                info!(session = %self.id, "socket created");
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "socket create failed");
                self.state.lock().expect("state poisoned").connection = ConnectionState::Idle;
                self.handle_close(CloseInfo {
                    status_code: e.http_status,
                    message: Some(e.message),
                })
                .await;
            }
        }
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        socket: Arc<dyn WaSocket>,
        mut events: mpsc::UnboundedReceiver<WaEvent>,
    ) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    WaEvent::Qr(raw) => runtime.handle_qr(&raw).await,
                    WaEvent::Open { .. } => runtime.handle_open(&socket).await,
                    WaEvent::ProtocolError(err) => runtime.handle_protocol_error(err).await,
                    WaEvent::MessagesUpsert { kind, messages } => {
                        let deps = RelayDeps {
                            edge: &runtime.edge,
                            alias: &runtime.alias,
                            contacts: &runtime.contacts,
                            session_id: &runtime.id,
                            socket: socket.as_ref(),
                        };
                        inbound::handle_upsert(&deps, kind, &messages).await;
                    }
                    WaEvent::Closed(info) => {
                        runtime.handle_close(info).await;
                        break;
                    }
                }
            }
        })
    }

    // ─── Event handlers ──────────────────────────────────────────────

    async fn handle_qr(&self, raw: &str) {
        match qr::to_data_url(raw) {
            Ok(data_url) => {
                debug!(session = %self.id, "publishing pairing QR");
                self.edge
                    .update_status(&self.id, SessionStatus::Connecting, Some(&data_url))
                    .await;
            }
            Err(e) => warn!(session = %self.id, error = %e, "QR render failed"),
        }
    }

    async fn handle_open(self: &Arc<Self>, socket: &Arc<dyn WaSocket>) {
        {
            let mut state = self.state.lock().expect("state poisoned");
            state.connection = ConnectionState::Open;
            state.connected_at = Some(Instant::now());
            state.reconnect_attempt = 0;
            state.bad_mac_window.clear();
        }
        info!(session = %self.id, "connection open");
        self.edge
            .update_status(&self.id, SessionStatus::Connected, None)
            .await;

        let task = outbound::spawn_for(self, Arc::clone(socket));
        if let Some(old) = self
            .outbound_task
            .lock()
            .expect("outbound slot poisoned")
            .replace(task)
        {
            old.abort();
        }
    }

    async fn handle_protocol_error(self: &Arc<Self>, err: WorkerError) {
        if !err.counts_toward_breaker() {
            warn!(session = %self.id, error = %err, "protocol error");
            return;
        }

        let tripped = {
            let mut state = self.state.lock().expect("state poisoned");
            let now = Instant::now();
            state.bad_mac_window.push_back(now);
            if let Some(horizon) = now.checked_sub(self.cfg.bad_mac_window) {
                while state
                    .bad_mac_window
                    .front()
                    .is_some_and(|t| *t < horizon)
                {
                    state.bad_mac_window.pop_front();
                }
            }

            let over_threshold = state.bad_mac_window.len() >= self.cfg.bad_mac_threshold;
            let cooled_down = state
                .bad_mac_breaker_until
                .map_or(true, |until| now >= until);
            if over_threshold && cooled_down {
                state.bad_mac_breaker_until = Some(now + self.cfg.bad_mac_cooldown);
                true
            } else {
                false
            }
        };

        if tripped {
            let until = self
                .state
                .lock()
                .expect("state poisoned")
                .bad_mac_breaker_until
                .expect("set above");
            warn!(session = %self.id, "bad-mac breaker tripped, wiping session auth");
            self.manager.note_breaker_cooldown(&self.id, until);
            self.breaker_trip().await;
        } else {
            debug!(session = %self.id, kind = ?err.kind, "decrypt failure recorded");
        }
    }

    /// Breaker action: tear the session down, wipe auth, restart fresh.
    async fn breaker_trip(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("state poisoned");
            state.intentional_stop = true;
            state.connection = ConnectionState::WipedPendingRestart;
        }
        self.stop_outbound();
        if let Some(socket) = self.take_socket() {
            socket.end().await;
        }
        self.edge
            .update_status(&self.id, SessionStatus::Disconnected, None)
            .await;
        self.wipe_auth_and_restart().await;
    }

    async fn handle_close(self: &Arc<Self>, info: CloseInfo) {
        let intentional = {
            let mut state = self.state.lock().expect("state poisoned");
            match state.connection {
                // Breaker and graceful-stop paths already ran their own
                // teardown; the close event is just the socket winding down.
                ConnectionState::WipedPendingRestart | ConnectionState::Closing => return,
                _ => {}
            }
            state.connection = ConnectionState::Idle;
            state.connected_at = None;
            state.intentional_stop
        };

        info!(
            session = %self.id,
            code = info.status_code.unwrap_or(0),
            reason = info.message.as_deref().unwrap_or(""),
            "connection closed"
        );
        self.edge
            .update_status(&self.id, SessionStatus::Disconnected, None)
            .await;
        self.stop_outbound();
        self.take_socket();

        if intentional || !self.manager.is_desired(&self.id) {
            debug!(session = %self.id, "no reconnect, session not desired");
            return;
        }

        if should_wipe_auth(&info) {
            self.state.lock().expect("state poisoned").connection =
                ConnectionState::WipedPendingRestart;
            warn!(session = %self.id, "session invalidated, wiping auth");
            self.wipe_auth_and_restart().await;
            return;
        }

        let delay = if info.status_code == Some(STREAM_RESTART_CODE) {
            // Stream restarts want a fast, jittered retry.
            Duration::from_millis(rand::thread_rng().gen_range(2_000..=5_000))
        } else {
            let attempt = {
                let mut state = self.state.lock().expect("state poisoned");
                let attempt = state.reconnect_attempt;
                state.reconnect_attempt += 1;
                attempt
            };
            let idx = (attempt as usize).min(RECONNECT_BACKOFF_SECS.len() - 1);
            Duration::from_secs(RECONNECT_BACKOFF_SECS[idx])
        };
        self.schedule_reconnect(delay);
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        debug!(session = %self.id, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        let runtime = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let stopped = runtime
                .state
                .lock()
                .expect("state poisoned")
                .intentional_stop;
            if !stopped && runtime.manager.is_desired(&runtime.id) {
                runtime.connect().await;
            }
        });
        if let Some(old) = self
            .reconnect_task
            .lock()
            .expect("reconnect slot poisoned")
            .replace(task)
        {
            old.abort();
        }
    }

    async fn wipe_auth_and_restart(self: &Arc<Self>) {
        let auth_dir = self.cfg.auth_dir(&self.id);
        match tokio::fs::remove_dir_all(&auth_dir).await {
            Ok(()) => info!(session = %self.id, "auth material wiped"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(session = %self.id, error = %e, "auth wipe failed"),
        }
        self.manager.reset_runtime(&self.id).await;
        self.manager.ensure_running(&self.id).await;
    }

    // ─── Stop ────────────────────────────────────────────────────────

    /// Graceful stop: suppress reconnection, end the socket, report
    /// DISCONNECTED. The auth directory is left untouched.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("state poisoned");
            state.intentional_stop = true;
            state.connection = ConnectionState::Closing;
        }
        self.stop_outbound();
        if let Some(task) = self
            .reconnect_task
            .lock()
            .expect("reconnect slot poisoned")
            .take()
        {
            task.abort();
        }
        if let Some(socket) = self.take_socket() {
            socket.end().await;
        }
        if let Some(task) = self
            .event_task
            .lock()
            .expect("event task slot poisoned")
            .take()
        {
            task.abort();
        }
        self.edge
            .update_status(&self.id, SessionStatus::Disconnected, None)
            .await;
        {
            let mut state = self.state.lock().expect("state poisoned");
            state.connection = ConnectionState::Idle;
            state.connected_at = None;
        }
        info!(session = %self.id, "session stopped");
    }

    fn stop_outbound(&self) {
        if let Some(task) = self
            .outbound_task
            .lock()
            .expect("outbound slot poisoned")
            .take()
        {
            task.abort();
        }
    }

    fn take_socket(&self) -> Option<Arc<dyn WaSocket>> {
        self.socket.lock().expect("socket slot poisoned").take()
    }

    #[cfg(test)]
    pub(crate) fn test_state<R>(&self, f: impl FnOnce(&RuntimeState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }
}

/// Auth-wipe triggers: a logged-out stream code or error text naming an
/// invalidated session.
fn should_wipe_auth(info: &CloseInfo) -> bool {
    if info.status_code == Some(LOGGED_OUT_CODE) {
        return true;
    }
    info.message
        .as_deref()
        .map(|m| WorkerError::classify_signal(m).triggers_auth_wipe())
        .unwrap_or(false)
}
