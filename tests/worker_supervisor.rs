//! End-to-end supervisor tests against a mock control plane and a
//! scripted transport: discovery targeting, lock lifecycle, outbound
//! delivery, send recovery, the Bad-MAC breaker, and inbound relay.

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use wa_worker::worker::config::WorkerConfig;
use wa_worker::worker::edge::EdgeClient;
use wa_worker::worker::error::{WorkerError, WorkerResult};
use wa_worker::worker::inbound;
use wa_worker::worker::locks::LockCoordinator;
use wa_worker::worker::manager::InstanceManager;
use wa_worker::worker::outbound;
use wa_worker::worker::socket::{
    InboundMessage, MediaPart, MessageBody, OutboundMedia, UpsertKind, WaEvent, WaSocket,
    WaTransport,
};
use wa_worker::worker::types::QueuedMessage;

// ─── Mock control plane ─────────────────────────────────────────────────

#[derive(Default)]
struct EdgeState {
    max_active: Option<i64>,
    eligible: Vec<Value>,
    queued: Vec<Value>,
    statuses: Vec<(String, String, bool)>,
    sent: Vec<Value>,
    failed: Vec<Value>,
    inbound: Vec<Value>,
    refreshes: Vec<Value>,
    uploads: Vec<Value>,
    acquires: Vec<String>,
    releases: Vec<String>,
    acquire_ok: bool,
    renew_ok: bool,
    primary_jids: HashMap<String, Value>,
    upload_ok: bool,
}

impl EdgeState {
    fn new() -> Self {
        Self {
            acquire_ok: true,
            renew_ok: true,
            upload_ok: true,
            ..Default::default()
        }
    }

    fn disconnected_count(&self, session_id: &str) -> usize {
        self.statuses
            .iter()
            .filter(|(id, status, _)| id == session_id && status == "DISCONNECTED")
            .count()
    }
}

type Shared = Arc<Mutex<EdgeState>>;

async fn spawn_edge(state: Shared) -> String {
    async fn worker_settings(State(s): State<Shared>) -> Json<Value> {
        let s = s.lock().unwrap();
        Json(json!({ "max_active_instances": s.max_active }))
    }

    async fn eligible(State(s): State<Shared>) -> Json<Value> {
        let s = s.lock().unwrap();
        Json(json!({ "instances": s.eligible }))
    }

    async fn update_status(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        s.lock().unwrap().statuses.push((
            body["instanceId"].as_str().unwrap_or_default().to_string(),
            body["status"].as_str().unwrap_or_default().to_string(),
            !body["qr_code"].is_null(),
        ));
        Json(json!({}))
    }

    async fn queued(
        State(s): State<Shared>,
        Query(q): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        let _ = q;
        let s = s.lock().unwrap();
        Json(Value::Array(s.queued.clone()))
    }

    async fn mark_sent(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let mut s = s.lock().unwrap();
        let id = body["messageId"].as_str().unwrap_or_default().to_string();
        s.queued.retain(|m| m["id"].as_str() != Some(id.as_str()));
        s.sent.push(body);
        Json(json!({}))
    }

    async fn mark_failed(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let mut s = s.lock().unwrap();
        let id = body["messageId"].as_str().unwrap_or_default().to_string();
        s.queued.retain(|m| m["id"].as_str() != Some(id.as_str()));
        s.failed.push(body);
        Json(json!({}))
    }

    async fn inbound_post(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        s.lock().unwrap().inbound.push(body);
        Json(json!({}))
    }

    async fn resolve(State(_s): State<Shared>, Json(_body): Json<Value>) -> Json<Value> {
        Json(json!({ "contact_id": "contact-1" }))
    }

    async fn primary_jid(
        State(s): State<Shared>,
        Query(q): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        let s = s.lock().unwrap();
        let jid = q.get("jid").cloned().unwrap_or_default();
        Json(
            s.primary_jids
                .get(&jid)
                .cloned()
                .unwrap_or_else(|| json!({ "jid_pn": null })),
        )
    }

    async fn upload(
        State(s): State<Shared>,
        Json(body): Json<Value>,
    ) -> (axum::http::StatusCode, Json<Value>) {
        let mut s = s.lock().unwrap();
        if !s.upload_ok {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "upload rejected" })),
            );
        }
        // The payload itself is large; keep only the metadata.
        s.uploads.push(json!({
            "instanceId": body["instanceId"],
            "messageId": body["messageId"],
            "mime_type": body["mime_type"],
            "file_name": body["file_name"],
            "bytes": body["bytes_base64"].as_str().map(|b| b.len()).unwrap_or(0),
        }));
        (
            axum::http::StatusCode::OK,
            Json(json!({ "media_url": "https://cdn.test/uploaded" })),
        )
    }

    async fn refresh(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        s.lock().unwrap().refreshes.push(body);
        Json(json!({}))
    }

    async fn lock_acquire(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let mut s = s.lock().unwrap();
        let id = body["instanceId"].as_str().unwrap_or_default().to_string();
        if s.acquire_ok {
            s.acquires.push(id.clone());
            Json(json!({
                "acquired": true,
                "instance_owner": body["instance_owner"],
                "lock_token": format!("tok-{}", id),
            }))
        } else {
            Json(json!({
                "acquired": false,
                "instance_owner": "other-host:99",
                "lock_token": null,
            }))
        }
    }

    async fn lock_renew(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let s = s.lock().unwrap();
        Json(json!({
            "acquired": s.renew_ok,
            "instance_owner": body["instance_owner"],
            "lock_token": body["lock_token"],
        }))
    }

    async fn lock_release(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let mut s = s.lock().unwrap();
        let id = body["instanceId"].as_str().unwrap_or_default().to_string();
        s.releases.push(id);
        Json(json!({ "acquired": false }))
    }

    let app = Router::new()
        .route("/worker-settings", get(worker_settings))
        .route("/eligible-instances", get(eligible))
        .route("/update-status", post(update_status))
        .route("/queued-messages", get(queued))
        .route("/mark-sent", post(mark_sent))
        .route("/mark-failed", post(mark_failed))
        .route("/inbound", post(inbound_post))
        .route("/contacts/resolve", post(resolve))
        .route("/contacts/primary-jid", get(primary_jid))
        .route("/upload-media", post(upload))
        .route("/sessions/refresh", post(refresh))
        .route("/instance-lock/acquire", post(lock_acquire))
        .route("/instance-lock/renew", post(lock_renew))
        .route("/instance-lock/release", post(lock_release))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ─── Scripted transport ─────────────────────────────────────────────────

struct MockSocket {
    session_id: String,
    sent: Mutex<Vec<(String, String)>>,
    send_failures: AtomicU32,
    media_bytes: Vec<u8>,
}

impl MockSocket {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sent: Mutex::new(Vec::new()),
            send_failures: AtomicU32::new(0),
            media_bytes: b"fake media payload".to_vec(),
        }
    }
}

#[async_trait]
impl WaSocket for MockSocket {
    fn own_jid(&self) -> Option<String> {
        Some(format!("own-{}@s.whatsapp.net", self.session_id))
    }

    async fn send_text(&self, jid: &str, body: &str) -> WorkerResult<String> {
        let failures = self.send_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.send_failures.store(failures - 1, Ordering::SeqCst);
            return Err(WorkerError::classify_signal("No matching sessions found"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), body.to_string()));
        Ok(format!("WAMID.{}", self.sent.lock().unwrap().len()))
    }

    async fn send_media(&self, jid: &str, media: OutboundMedia) -> WorkerResult<String> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), format!("<{}>", media.kind.as_str())));
        Ok("WAMID.media".into())
    }

    async fn download_media(&self, _message: &InboundMessage) -> WorkerResult<Vec<u8>> {
        Ok(self.media_bytes.clone())
    }

    async fn end(&self) {}
}

#[derive(Default)]
struct MockTransport {
    connects: Mutex<Vec<String>>,
    events: Mutex<HashMap<String, mpsc::UnboundedSender<WaEvent>>>,
    sockets: Mutex<HashMap<String, Arc<MockSocket>>>,
}

impl MockTransport {
    fn connect_count(&self, session_id: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == session_id)
            .count()
    }

    fn send_event(&self, session_id: &str, event: WaEvent) {
        let events = self.events.lock().unwrap();
        events
            .get(session_id)
            .expect("session connected")
            .send(event)
            .expect("event loop alive");
    }
}

#[async_trait]
impl WaTransport for MockTransport {
    async fn connect(
        &self,
        session_id: &str,
        auth_dir: &Path,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> WorkerResult<Arc<dyn WaSocket>> {
        tokio::fs::create_dir_all(auth_dir).await?;
        tokio::fs::write(auth_dir.join("creds.json"), b"{}").await?;

        let socket = Arc::new(MockSocket::new(session_id));
        self.connects.lock().unwrap().push(session_id.to_string());
        self.sockets
            .lock()
            .unwrap()
            .insert(session_id.to_string(), Arc::clone(&socket));

        let _ = events.send(WaEvent::Open {
            own_jid: socket.own_jid(),
        });
        self.events
            .lock()
            .unwrap()
            .insert(session_id.to_string(), events);
        Ok(socket)
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

struct Harness {
    state: Shared,
    cfg: Arc<WorkerConfig>,
    edge: Arc<EdgeClient>,
    transport: Arc<MockTransport>,
    manager: Arc<InstanceManager>,
    _tmp: tempfile::TempDir,
}

async fn harness() -> Harness {
    let state: Shared = Arc::new(Mutex::new(EdgeState::new()));
    let base_url = spawn_edge(Arc::clone(&state)).await;
    let tmp = tempfile::tempdir().unwrap();

    let cfg = Arc::new(WorkerConfig {
        edge_base_url: base_url,
        worker_secret: "test-secret".into(),
        port: 0,
        http_timeout: Duration::from_secs(2),
        discovery_poll: Duration::from_secs(60),
        queue_poll: Duration::from_millis(50),
        auth_base: tmp.path().join("auth"),
        media_base: tmp.path().join("media"),
        fallback_max_active: 0,
        lock_ttl: Duration::from_secs(5),
        lock_renew: Duration::from_millis(100),
        stop_cooldown: Duration::from_millis(300),
        bad_mac_window: Duration::from_secs(60),
        bad_mac_threshold: 20,
        bad_mac_cooldown: Duration::from_secs(300),
        contact_error_cooldown: Duration::from_secs(60),
        contact_duplicate_cooldown: Duration::from_secs(300),
        decrypt_retry_max_attempts: 3,
    });
    let edge = Arc::new(EdgeClient::new(&cfg).unwrap());
    let transport = Arc::new(MockTransport::default());
    let (locks, lock_lost) = LockCoordinator::new(
        Arc::clone(&edge),
        "test-host:1".into(),
        cfg.lock_ttl,
        cfg.lock_renew,
    );
    let manager = InstanceManager::new(
        Arc::clone(&cfg),
        Arc::clone(&edge),
        Arc::clone(&transport) as Arc<dyn WaTransport>,
        locks,
    );
    manager.start(lock_lost);
    // Let the ticker's immediate first cycle (empty eligible list) finish
    // so manual cycles below never hit the reentrancy guard.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        state,
        cfg,
        edge,
        transport,
        manager,
        _tmp: tmp,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, millis: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn set_eligible(state: &Shared, items: &[(&str, i64)]) {
    state.lock().unwrap().eligible = items
        .iter()
        .map(|(id, priority)| json!({ "id": id, "priority": priority }))
        .collect();
}

// ─── Scenarios ──────────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_targets_by_priority_with_stable_tie_break() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(2);
    set_eligible(&h.state, &[("A", 5), ("B", 10), ("C", 10)]);

    h.manager.discovery_cycle().await;

    let acquires = h.state.lock().unwrap().acquires.clone();
    assert!(acquires.contains(&"B".to_string()));
    assert!(acquires.contains(&"C".to_string()));
    assert!(!acquires.contains(&"A".to_string()));

    assert!(
        wait_until(|| h.transport.connect_count("B") == 1, 1_000).await,
        "B connects"
    );
    assert_eq!(h.transport.connect_count("A"), 0);
}

#[tokio::test]
async fn discovery_is_idempotent_across_cycles() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(1);
    set_eligible(&h.state, &[("A", 5)]);

    h.manager.discovery_cycle().await;
    h.manager.discovery_cycle().await;

    let state = h.state.lock().unwrap();
    // Lock acquire is idempotent while held: one edge call total.
    assert_eq!(state.acquires, ["A"]);
    assert!(state.releases.is_empty());
    drop(state);
    assert_eq!(h.transport.connect_count("A"), 1);
}

#[tokio::test]
async fn outbound_text_is_normalized_and_marked_sent() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(1);
    set_eligible(&h.state, &[("S", 1)]);
    h.state.lock().unwrap().queued = vec![json!({
        "id": "m1",
        "to": "5511999999999",
        "body": "hi",
    })];

    h.manager.discovery_cycle().await;

    assert!(
        wait_until(|| !h.state.lock().unwrap().sent.is_empty(), 2_000).await,
        "message marked sent"
    );

    let state = h.state.lock().unwrap();
    let sent = &state.sent[0];
    assert_eq!(sent["messageId"], "m1");
    assert!(sent["wa_message_id"].as_str().unwrap().starts_with("WAMID."));
    assert_eq!(
        sent["send_debug"]["to_normalized"],
        "5511999999999@s.whatsapp.net"
    );
    drop(state);

    let socket = h.transport.sockets.lock().unwrap().get("S").cloned().unwrap();
    assert_eq!(
        socket.sent.lock().unwrap()[0].0,
        "5511999999999@s.whatsapp.net"
    );
}

#[tokio::test]
async fn outbound_lid_destination_uses_primary_jid() {
    let h = harness().await;
    h.state.lock().unwrap().primary_jids.insert(
        "1203630@lid".into(),
        json!({ "jid_pn": "5511888@s.whatsapp.net" }),
    );

    let socket = MockSocket::new("S");
    let msg = QueuedMessage {
        id: "m2".into(),
        to: "1203630@lid".into(),
        body: Some("hi".into()),
        ..Default::default()
    };
    let alias = wa_worker::worker::alias::IdentityAliasStore::new(
        h._tmp.path().join("alias.json"),
    );
    outbound::process_message(&h.cfg, &h.edge, &alias, "S", &socket, &msg).await;

    assert_eq!(socket.sent.lock().unwrap()[0].0, "5511888@s.whatsapp.net");
    assert_eq!(h.state.lock().unwrap().sent.len(), 1);
}

#[tokio::test]
async fn outbound_lid_without_mapping_marks_failed() {
    let h = harness().await;
    // No primary-jid entry: mock answers { jid_pn: null }.
    let socket = MockSocket::new("S");
    let msg = QueuedMessage {
        id: "m3".into(),
        to: "77@lid".into(),
        body: Some("hi".into()),
        ..Default::default()
    };
    let alias = wa_worker::worker::alias::IdentityAliasStore::new(
        h._tmp.path().join("alias.json"),
    );
    outbound::process_message(&h.cfg, &h.edge, &alias, "S", &socket, &msg).await;

    let state = h.state.lock().unwrap();
    assert!(state.sent.is_empty());
    assert_eq!(state.failed.len(), 1);
    assert_eq!(state.failed[0]["error"], "lid_without_mapping");
    assert!(socket.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn outbound_refresh_retry_recovers_transient_decrypt_failure() {
    let h = harness().await;
    let socket = MockSocket::new("S");
    socket.send_failures.store(2, Ordering::SeqCst);
    let msg = QueuedMessage {
        id: "m4".into(),
        to: "5511999999999".into(),
        body: Some("hi".into()),
        ..Default::default()
    };
    let alias = wa_worker::worker::alias::IdentityAliasStore::new(
        h._tmp.path().join("alias.json"),
    );
    outbound::process_message(&h.cfg, &h.edge, &alias, "S", &socket, &msg).await;

    let state = h.state.lock().unwrap();
    assert_eq!(state.refreshes.len(), 2, "one refresh per failed attempt");
    for refresh in &state.refreshes {
        assert_eq!(refresh["trigger"], "no_matching_sessions");
        assert_eq!(refresh["jid"], "5511999999999@s.whatsapp.net");
    }
    assert_eq!(state.sent.len(), 1);
    assert_eq!(state.sent[0]["send_debug"]["attempts"], 3);
}

#[tokio::test]
async fn malformed_queue_record_marks_failed_and_drain_continues() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(1);
    set_eligible(&h.state, &[("S", 1)]);
    h.state.lock().unwrap().queued = vec![
        json!({ "id": "bad", "to": "123" }),
        json!({ "id": "good", "to": "123", "body": "hi" }),
    ];

    h.manager.discovery_cycle().await;

    assert!(
        wait_until(
            || {
                let s = h.state.lock().unwrap();
                !s.sent.is_empty() && !s.failed.is_empty()
            },
            2_000
        )
        .await
    );
    let state = h.state.lock().unwrap();
    assert_eq!(state.failed[0]["messageId"], "bad");
    assert_eq!(state.failed[0]["error"], "malformed-message");
    assert_eq!(state.sent[0]["messageId"], "good");
}

#[tokio::test]
async fn bad_mac_burst_trips_breaker_and_restarts_fresh() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(1);
    set_eligible(&h.state, &[("S", 1)]);

    h.manager.discovery_cycle().await;
    assert!(wait_until(|| h.transport.connect_count("S") == 1, 1_000).await);
    let auth_dir = h.cfg.auth_dir("S");
    assert!(auth_dir.join("creds.json").exists());

    // Baseline DISCONNECTED count before the burst.
    let before = h.state.lock().unwrap().disconnected_count("S");

    for _ in 0..20 {
        h.transport.send_event(
            "S",
            WaEvent::ProtocolError(WorkerError::classify_signal("Bad MAC")),
        );
    }

    // The breaker wipes auth and the manager restarts the session.
    assert!(
        wait_until(|| h.transport.connect_count("S") == 2, 2_000).await,
        "session restarted after wipe"
    );
    let after = h.state.lock().unwrap().disconnected_count("S");
    assert_eq!(after - before, 1, "exactly one DISCONNECTED post");

    // The restart recreated auth from scratch.
    assert!(auth_dir.join("creds.json").exists());
}

#[tokio::test]
async fn lock_renewal_rejection_stops_the_session() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(1);
    set_eligible(&h.state, &[("S", 1)]);

    h.manager.discovery_cycle().await;
    assert!(wait_until(|| h.transport.connect_count("S") == 1, 1_000).await);

    h.state.lock().unwrap().renew_ok = false;

    assert!(
        wait_until(|| h.manager_runtime_gone("S"), 3_000).await,
        "session stopped after lost lock"
    );
    assert!(h.state.lock().unwrap().disconnected_count("S") >= 1);
}

#[tokio::test]
async fn stop_cooldown_delays_descheduling_of_open_sessions() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(1);
    set_eligible(&h.state, &[("S", 1)]);

    h.manager.discovery_cycle().await;
    assert!(
        wait_until(
            || {
                h.state
                    .lock()
                    .unwrap()
                    .statuses
                    .iter()
                    .any(|(id, status, _)| id == "S" && status == "CONNECTED")
            },
            1_000
        )
        .await,
        "session reaches open"
    );

    // Session leaves the desired set while freshly open.
    set_eligible(&h.state, &[]);
    h.manager.discovery_cycle().await;
    assert!(
        !h.manager_runtime_gone("S"),
        "open session survives inside the cooldown window"
    );

    tokio::time::sleep(Duration::from_millis(350)).await;
    h.manager.discovery_cycle().await;
    assert!(
        wait_until(|| h.manager_runtime_gone("S"), 1_000).await,
        "session stops once the cooldown has passed"
    );
    assert_eq!(h.state.lock().unwrap().releases, ["S"]);
}

#[tokio::test]
async fn inbound_media_message_uploads_then_posts() {
    let h = harness().await;
    let socket = MockSocket::new("S");
    let contacts = wa_worker::worker::contacts::ContactCache::new(
        "S",
        Arc::clone(&h.edge),
        &h.cfg,
    );
    let alias = wa_worker::worker::alias::IdentityAliasStore::new(
        h._tmp.path().join("alias.json"),
    );
    let deps = inbound::RelayDeps {
        edge: &h.edge,
        alias: &alias,
        contacts: &contacts,
        session_id: "S",
        socket: &socket,
    };

    let message = InboundMessage {
        id: "WAIN.1".into(),
        remote_jid: Some("5511777@s.whatsapp.net".into()),
        push_name: Some("Alice".into()),
        content: MessageBody {
            image: Some(MediaPart {
                caption: Some("a photo".into()),
                mime_type: Some("image/jpeg".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    inbound::handle_upsert(&deps, UpsertKind::Notify, &[message]).await;

    let state = h.state.lock().unwrap();
    assert_eq!(state.uploads.len(), 1);
    assert_eq!(state.uploads[0]["mime_type"], "image/jpeg");
    assert_eq!(state.inbound.len(), 1);
    let payload = &state.inbound[0];
    assert_eq!(payload["instanceId"], "S");
    assert_eq!(payload["body"], "a photo");
    assert_eq!(payload["media_type"], "image");
    assert_eq!(payload["media_url"], "https://cdn.test/uploaded");
    assert_eq!(payload["sender_contact_id"], "contact-1");
    assert_eq!(payload["from"], "5511777@s.whatsapp.net");
}

#[tokio::test]
async fn inbound_upload_failure_skips_the_post() {
    let h = harness().await;
    h.state.lock().unwrap().upload_ok = false;

    let socket = MockSocket::new("S");
    let contacts = wa_worker::worker::contacts::ContactCache::new(
        "S",
        Arc::clone(&h.edge),
        &h.cfg,
    );
    let alias = wa_worker::worker::alias::IdentityAliasStore::new(
        h._tmp.path().join("alias.json"),
    );
    let deps = inbound::RelayDeps {
        edge: &h.edge,
        alias: &alias,
        contacts: &contacts,
        session_id: "S",
        socket: &socket,
    };

    let message = InboundMessage {
        id: "WAIN.2".into(),
        remote_jid: Some("5511777@s.whatsapp.net".into()),
        content: MessageBody {
            document: Some(MediaPart::default()),
            ..Default::default()
        },
        ..Default::default()
    };
    inbound::handle_upsert(&deps, UpsertKind::Notify, &[message]).await;

    let state = h.state.lock().unwrap();
    assert!(state.inbound.is_empty(), "no partial inbound post");
}

#[tokio::test]
async fn inbound_learns_lid_pn_pair_and_normalizes_chat() {
    let h = harness().await;
    let socket = MockSocket::new("S");
    let contacts = wa_worker::worker::contacts::ContactCache::new(
        "S",
        Arc::clone(&h.edge),
        &h.cfg,
    );
    let alias = wa_worker::worker::alias::IdentityAliasStore::new(
        h._tmp.path().join("alias.json"),
    );
    let deps = inbound::RelayDeps {
        edge: &h.edge,
        alias: &alias,
        contacts: &contacts,
        session_id: "S",
        socket: &socket,
    };

    let message = InboundMessage {
        id: "WAIN.3".into(),
        remote_jid: Some("88@lid".into()),
        remote_jid_alt: Some("5511888@s.whatsapp.net".into()),
        content: MessageBody {
            conversation: Some("hello".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    inbound::handle_upsert(&deps, UpsertKind::Notify, &[message]).await;

    // The pair was learned and the chat id normalized to the phone jid.
    assert_eq!(
        alias.resolve_canonical("88@lid", None).await,
        "5511888@s.whatsapp.net"
    );
    let state = h.state.lock().unwrap();
    assert_eq!(state.inbound[0]["chat_id_norm"], "5511888@s.whatsapp.net");
}

#[tokio::test]
async fn shutdown_stops_sessions_and_releases_locks() {
    let h = harness().await;
    h.state.lock().unwrap().max_active = Some(2);
    set_eligible(&h.state, &[("A", 2), ("B", 1)]);

    h.manager.discovery_cycle().await;
    assert!(wait_until(|| h.transport.connect_count("A") == 1, 1_000).await);
    assert!(wait_until(|| h.transport.connect_count("B") == 1, 1_000).await);

    h.manager.shutdown().await;

    let state = h.state.lock().unwrap();
    assert!(state.releases.contains(&"A".to_string()));
    assert!(state.releases.contains(&"B".to_string()));
    assert!(state.disconnected_count("A") >= 1);
    assert!(state.disconnected_count("B") >= 1);
}

impl Harness {
    fn manager_runtime_gone(&self, session_id: &str) -> bool {
        !self.manager.governs(session_id)
    }
}
