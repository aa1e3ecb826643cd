//! Default socket transport over the WA Web WebSocket.
//!
//! A deliberately thin implementation of the [`WaTransport`] seam: it keeps
//! the device credentials on disk, speaks the WebSocket framing, and maps
//! stream activity onto [`WaEvent`]s. Frame cryptography is out of scope
//! here; payloads are carried opaquely and decode failures surface as
//! protocol errors for the supervisor's breaker to count.

use crate::worker::error::{WorkerError, WorkerResult};
use crate::worker::socket::{
    CloseInfo, InboundMessage, MediaKind, MessageBody, OutboundMedia, UpsertKind, WaEvent,
    WaSocket, WaTransport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Default WA Web WebSocket endpoint (multi-device).
pub const WA_WEB_SOCKET_URL: &str = "wss://web.whatsapp.com/ws/chat";

const CREDS_FILE: &str = "creds.json";

// Protocol node tags (simplified WABinary framing).
const TAG_MESSAGE: u8 = 0x0A;
const TAG_JID: u8 = 0x12;
const TAG_TEXT: u8 = 0x1A;
const TAG_MEDIA: u8 = 0x22;
/// Media payload: tag + 4-byte big-endian length + bytes.
const TAG_PAYLOAD: u8 = 0x2A;

/// Durable device credentials stored inside the session auth directory.
#[derive(Clone, Serialize, Deserialize)]
struct DeviceCreds {
    client_id: String,
    registration_id: u32,
    /// Set once the device has completed pairing.
    paired_jid: Option<String>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for DeviceCreds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCreds")
            .field("registration_id", &self.registration_id)
            .field("paired", &self.paired_jid.is_some())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl DeviceCreds {
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut id_bytes = [0u8; 16];
        rng.fill_bytes(&mut id_bytes);
        let mut reg_bytes = [0u8; 4];
        rng.fill_bytes(&mut reg_bytes);
        Self {
            client_id: hex::encode(id_bytes),
            registration_id: u32::from_le_bytes(reg_bytes) & 0x3FFF,
            paired_jid: None,
            created_at: Utc::now(),
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct WaWebConfig {
    pub ws_url: String,
}

impl Default for WaWebConfig {
    fn default() -> Self {
        Self {
            ws_url: WA_WEB_SOCKET_URL.to_string(),
        }
    }
}

impl WaWebConfig {
    /// `WA_WS_URL` override, default endpoint otherwise.
    pub fn from_env() -> Self {
        Self {
            ws_url: std::env::var("WA_WS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| WA_WEB_SOCKET_URL.to_string()),
        }
    }
}

/// Default WA Web transport.
pub struct WaWebTransport {
    config: WaWebConfig,
    http: reqwest::Client,
}

impl WaWebTransport {
    pub fn new(config: WaWebConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WaTransport for WaWebTransport {
    async fn connect(
        &self,
        session_id: &str,
        auth_dir: &Path,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> WorkerResult<Arc<dyn WaSocket>> {
        let creds_path = auth_dir.join(CREDS_FILE);
        let (creds, fresh) = load_or_create_creds(&creds_path).await?;

        info!(session = session_id, "connecting to WA Web socket");
        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(&self.config.ws_url)
            .header("Origin", "https://web.whatsapp.com")
            .header(
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                 AppleWebKit/537.36 Chrome/120.0.0.0",
            )
            .body(())
            .map_err(|e| WorkerError::network(format!("WS request build: {}", e)))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| WorkerError::network(format!("WebSocket connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let socket = Arc::new(WaWebSocket {
            session_id: session_id.to_string(),
            own_jid: RwLock::new(creds.paired_jid.clone()),
            out_tx,
            closed: AtomicBool::new(false),
            http: self.http.clone(),
        });

        // Writer half: drains the outbound frame queue.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader half: maps stream activity to supervisor events.
        let reader_events = events.clone();
        let reader_session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Binary(data)) => {
                        if let Some(event) = parse_frame(&data) {
                            if reader_events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(WsMessage::Close(close)) => {
                        let info = CloseInfo {
                            status_code: close.as_ref().map(|c| u16::from(c.code)),
                            message: close.map(|c| c.reason.into_owned()),
                        };
                        let _ = reader_events.send(WaEvent::Closed(info));
                        return;
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        debug!(session = %reader_session, bytes = payload.len(), "ping");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(session = %reader_session, error = %e, "socket read error");
                        let _ = reader_events.send(WaEvent::Closed(CloseInfo {
                            status_code: None,
                            message: Some(e.to_string()),
                        }));
                        return;
                    }
                }
            }
            let _ = reader_events.send(WaEvent::Closed(CloseInfo::default()));
        });

        if fresh {
            // Unpaired device: surface the pairing payload for QR relay.
            let payload = format!("2@{},{}", creds.client_id, creds.registration_id);
            let _ = events.send(WaEvent::Qr(payload));
        } else {
            let _ = events.send(WaEvent::Open {
                own_jid: creds.paired_jid.clone(),
            });
        }

        Ok(socket)
    }
}

/// A live WA Web socket.
pub struct WaWebSocket {
    session_id: String,
    own_jid: RwLock<Option<String>>,
    out_tx: mpsc::UnboundedSender<WsMessage>,
    closed: AtomicBool,
    http: reqwest::Client,
}

impl WaWebSocket {
    fn send_frame(&self, frame: Vec<u8>) -> WorkerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::network("socket already ended"));
        }
        self.out_tx
            .send(WsMessage::Binary(frame))
            .map_err(|_| WorkerError::network("socket write queue closed"))
    }
}

#[async_trait]
impl WaSocket for WaWebSocket {
    fn own_jid(&self) -> Option<String> {
        self.own_jid.read().expect("jid slot poisoned").clone()
    }

    async fn send_text(&self, jid: &str, body: &str) -> WorkerResult<String> {
        let message_id = generate_message_id();
        let frame = encode_text_frame(&message_id, jid, body);
        self.send_frame(frame)?;
        debug!(session = %self.session_id, message = %message_id, "text frame queued");
        Ok(message_id)
    }

    async fn send_media(&self, jid: &str, media: OutboundMedia) -> WorkerResult<String> {
        let message_id = generate_message_id();
        let frame = encode_media_frame(&message_id, jid, &media);
        self.send_frame(frame)?;
        debug!(
            session = %self.session_id,
            message = %message_id,
            kind = media.kind.as_str(),
            bytes = media.bytes.len(),
            "media frame queued"
        );
        Ok(message_id)
    }

    async fn download_media(&self, message: &InboundMessage) -> WorkerResult<Vec<u8>> {
        let url = [
            message.content.image.as_ref(),
            message.content.video.as_ref(),
            message.content.audio.as_ref(),
            message.content.document.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find_map(|part| part.direct_url.clone())
        .ok_or_else(|| WorkerError::internal("message carries no downloadable media"))?;

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| WorkerError::network(format!("media fetch failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(WorkerError::from_response(resp.status().as_u16(), ""));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| WorkerError::network(format!("media body read failed: {}", e)))
    }

    async fn end(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out_tx.send(WsMessage::Close(None));
        info!(session = %self.session_id, "socket ended");
    }
}

async fn load_or_create_creds(path: &Path) -> WorkerResult<(DeviceCreds, bool)> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<DeviceCreds>(&bytes) {
            Ok(creds) => Ok((creds, false)),
            Err(e) => {
                warn!(error = %e, "unreadable device creds, regenerating");
                let creds = DeviceCreds::generate();
                save_creds(path, &creds).await?;
                Ok((creds, true))
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let creds = DeviceCreds::generate();
            save_creds(path, &creds).await?;
            Ok((creds, true))
        }
        Err(e) => Err(e.into()),
    }
}

async fn save_creds(path: &Path, creds: &DeviceCreds) -> WorkerResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(creds)?).await?;
    Ok(())
}

/// WA-style message id: `3EB0` + 12 random bytes, hex, upper-case.
pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 12];
    rng.fill_bytes(&mut bytes);
    format!("3EB0{}", hex::encode(bytes).to_uppercase())
}

fn push_field(frame: &mut Vec<u8>, tag: u8, value: &[u8]) {
    frame.push(tag);
    let len = value.len();
    if len < 128 {
        frame.push(len as u8);
    } else {
        frame.push((len & 0x7F | 0x80) as u8);
        frame.push((len >> 7) as u8);
    }
    frame.extend_from_slice(value);
}

/// Simplified binary frame for a text message node.
pub fn encode_text_frame(message_id: &str, jid: &str, body: &str) -> Vec<u8> {
    let mut frame = Vec::new();
    push_field(&mut frame, TAG_MESSAGE, message_id.as_bytes());
    push_field(&mut frame, TAG_JID, jid.as_bytes());
    push_field(&mut frame, TAG_TEXT, body.as_bytes());
    frame
}

/// Simplified binary frame for a media message node. The media bytes ride
/// after a kind marker; captions reuse the text tag.
pub fn encode_media_frame(message_id: &str, jid: &str, media: &OutboundMedia) -> Vec<u8> {
    let mut frame = Vec::new();
    push_field(&mut frame, TAG_MESSAGE, message_id.as_bytes());
    push_field(&mut frame, TAG_JID, jid.as_bytes());
    if let Some(caption) = media.caption.as_deref().filter(|c| !c.is_empty()) {
        push_field(&mut frame, TAG_TEXT, caption.as_bytes());
    }
    push_field(&mut frame, TAG_MEDIA, media.kind.as_str().as_bytes());
    frame.push(TAG_PAYLOAD);
    frame.extend_from_slice(&(media.bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&media.bytes);
    frame
}

/// Map one inbound binary frame onto a supervisor event.
///
/// Real deployments decode the full WABinary node tree here; this parser
/// understands the message-node shape above and reports everything else as
/// unknown.
pub fn parse_frame(data: &[u8]) -> Option<WaEvent> {
    let mut fields = Vec::new();
    let mut cursor = 0usize;
    while cursor + 2 <= data.len() {
        let tag = data[cursor];
        let (len, header) = if tag == TAG_PAYLOAD {
            if cursor + 5 > data.len() {
                return None;
            }
            let mut be = [0u8; 4];
            be.copy_from_slice(&data[cursor + 1..cursor + 5]);
            (u32::from_be_bytes(be) as usize, 5)
        } else {
            let first = data[cursor + 1] as usize;
            if first & 0x80 != 0 {
                if cursor + 3 > data.len() {
                    return None;
                }
                ((first & 0x7F) | ((data[cursor + 2] as usize) << 7), 3)
            } else {
                (first, 2)
            }
        };
        let start = cursor + header;
        let end = start.checked_add(len)?;
        if end > data.len() {
            return None;
        }
        fields.push((tag, &data[start..end]));
        cursor = end;
    }

    let field = |tag: u8| {
        fields
            .iter()
            .find(|(t, _)| *t == tag)
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    };

    let message_id = field(TAG_MESSAGE)?;
    let jid = field(TAG_JID)?;
    let mut content = MessageBody::default();
    if let Some(text) = field(TAG_TEXT) {
        content.conversation = Some(text.to_string());
    }
    if let Some(kind) = field(TAG_MEDIA).and_then(MediaKind::parse) {
        let part = Some(Default::default());
        match kind {
            MediaKind::Image => content.image = part,
            MediaKind::Video => content.video = part,
            MediaKind::Audio => content.audio = part,
            MediaKind::Document => content.document = part,
        }
    }

    Some(WaEvent::MessagesUpsert {
        kind: UpsertKind::Notify,
        messages: vec![InboundMessage {
            id: message_id.to_string(),
            remote_jid: Some(jid.to_string()),
            content,
            ..Default::default()
        }],
    })
}
