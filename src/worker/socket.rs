//! Client-library seam: traits and events the supervisor drives sessions
//! through.
//!
//! The underlying WhatsApp client is an external collaborator; everything
//! the supervisor needs from it is expressed here. [`WaTransport`] creates
//! sockets bound to a session's auth directory, a connected [`WaSocket`]
//! sends messages and downloads media, and the socket reports its lifecycle
//! on an event channel as [`WaEvent`]s.

use crate::worker::error::WorkerResult;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Creates sockets for sessions. One implementation per client library.
#[async_trait]
pub trait WaTransport: Send + Sync {
    /// Open a socket for `session_id` using the durable auth material under
    /// `auth_dir`. Lifecycle and message events are delivered on `events`
    /// until the socket closes.
    async fn connect(
        &self,
        session_id: &str,
        auth_dir: &Path,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> WorkerResult<Arc<dyn WaSocket>>;
}

/// A live client socket for one session.
#[async_trait]
pub trait WaSocket: Send + Sync {
    /// The authenticated account jid, once known.
    fn own_jid(&self) -> Option<String>;

    /// Send a text message; returns the wire message id.
    async fn send_text(&self, jid: &str, body: &str) -> WorkerResult<String>;

    /// Send a media message; returns the wire message id.
    async fn send_media(&self, jid: &str, media: OutboundMedia) -> WorkerResult<String>;

    /// Download the payload of an inbound media message.
    async fn download_media(&self, message: &InboundMessage) -> WorkerResult<Vec<u8>>;

    /// Close the socket. Triggers a final [`WaEvent::Closed`].
    async fn end(&self);
}

/// Events a socket reports while connected.
#[derive(Debug)]
pub enum WaEvent {
    /// A raw pairing payload to render and relay. Never logged verbatim.
    Qr(String),
    /// The connection reached the open state.
    Open { own_jid: Option<String> },
    /// The connection closed; the runner decides what happens next.
    Closed(CloseInfo),
    /// New or appended messages.
    MessagesUpsert {
        kind: UpsertKind,
        messages: Vec<InboundMessage>,
    },
    /// A non-fatal protocol error (decrypt failures feed the breaker).
    ProtocolError(crate::worker::error::WorkerError),
}

/// Why a connection closed.
#[derive(Debug, Clone, Default)]
pub struct CloseInfo {
    /// Stream status code when the library reports one (e.g. 515, 401).
    pub status_code: Option<u16>,
    /// Error text when the library reports one.
    pub message: Option<String>,
}

/// Upsert notification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
    Other,
}

impl UpsertKind {
    /// Only notify/append upserts are relayed inbound.
    pub fn is_relayed(&self) -> bool {
        matches!(self, UpsertKind::Notify | UpsertKind::Append)
    }
}

/// One inbound message as surfaced by the client library.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub id: String,
    /// Chat jid the message belongs to.
    pub remote_jid: Option<String>,
    /// Phone-jid alternate for `@lid` chats, when the library knows it.
    pub remote_jid_alt: Option<String>,
    pub from_me: bool,
    /// Sender within a group chat.
    pub participant: Option<String>,
    /// Sender phone jid, when the library knows it.
    pub sender_pn: Option<String>,
    pub push_name: Option<String>,
    pub content: MessageBody,
}

/// The content slots a message may carry, mirroring the wire shape.
#[derive(Debug, Clone, Default)]
pub struct MessageBody {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image: Option<MediaPart>,
    pub video: Option<MediaPart>,
    pub audio: Option<MediaPart>,
    pub document: Option<MediaPart>,
}

/// A media slot within a message.
#[derive(Debug, Clone, Default)]
pub struct MediaPart {
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    /// Opaque download reference understood by the transport.
    pub direct_url: Option<String>,
}

/// Media classes the worker sends and relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "document" => Some(MediaKind::Document),
            _ => None,
        }
    }

    /// File extension used when neither mime type nor file name gives one.
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Image => "jpg",
            MediaKind::Video => "mp4",
            MediaKind::Audio => "ogg",
            MediaKind::Document => "bin",
        }
    }
}

/// An outbound media payload handed to the socket.
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    /// Push-to-talk flag for audio.
    pub ptt: bool,
}
