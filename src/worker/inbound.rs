//! Inbound message relay.
//!
//! Handles `messages.upsert` batches from the socket: learns LID/PN pairs,
//! extracts text or media content, uploads media to the control plane, and
//! posts the normalized inbound payload. Media bytes and their base64 form
//! never reach the logs.

use crate::worker::alias::{is_group_jid, is_pn_jid, IdentityAliasStore};
use crate::worker::contacts::ContactCache;
use crate::worker::edge::EdgeClient;
use crate::worker::socket::{
    InboundMessage, MediaKind, MediaPart, UpsertKind, WaSocket,
};
use crate::worker::types::{InboundPayload, UploadMediaRequest};
use base64::Engine;
use tracing::{debug, warn};

const FILE_NAME_CAP: usize = 120;

/// Everything one relay pass needs.
pub struct RelayDeps<'a> {
    pub edge: &'a EdgeClient,
    pub alias: &'a IdentityAliasStore,
    pub contacts: &'a ContactCache,
    pub session_id: &'a str,
    pub socket: &'a dyn WaSocket,
}

/// Extracted content of one message, in slot-priority order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedContent {
    pub media: Option<MediaKind>,
    pub body: String,
}

/// Relay a `messages.upsert` batch.
pub async fn handle_upsert(deps: &RelayDeps<'_>, kind: UpsertKind, messages: &[InboundMessage]) {
    if !kind.is_relayed() {
        return;
    }
    for message in messages {
        handle_message(deps, message).await;
    }
}

/// Relay a single message; failures skip the message without propagating.
pub async fn handle_message(deps: &RelayDeps<'_>, message: &InboundMessage) {
    let Some(chat_id) = message.remote_jid.as_deref() else {
        return;
    };

    learn_alias_pairs(deps.alias, message).await;

    let fallback_pn = message
        .remote_jid_alt
        .as_deref()
        .filter(|jid| is_pn_jid(jid));
    let chat_id_norm = deps.alias.resolve_canonical(chat_id, fallback_pn).await;
    let is_group = is_group_jid(chat_id);

    let own_jid = deps
        .socket
        .own_jid()
        .unwrap_or_else(|| format!("{}@s.whatsapp.net", deps.session_id));
    let sender_jid_raw = if is_group {
        message
            .participant
            .clone()
            .unwrap_or_else(|| chat_id.to_string())
    } else if message.from_me {
        own_jid.clone()
    } else {
        chat_id.to_string()
    };
    let sender_pn = message
        .sender_pn
        .clone()
        .filter(|jid| is_pn_jid(jid));
    let contact_jid = if message.from_me {
        chat_id.to_string()
    } else {
        sender_pn.clone().unwrap_or_else(|| sender_jid_raw.clone())
    };

    let extracted = extract_content(message);
    let media_part = media_part_of(message, extracted.media);
    if extracted.body.is_empty() && extracted.media.is_none() {
        return;
    }

    let mut media_url = None;
    let mut mime_type = None;
    let mut file_name = None;
    let mut file_size = None;
    if let Some(kind) = extracted.media {
        let bytes = match deps.socket.download_media(message).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session = deps.session_id, message = %message.id, error = %e, "media download failed, skipping message");
                return;
            }
        };
        let part = media_part.unwrap_or_default();
        let mime = part
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let name = upload_file_name(&message.id, part.file_name.as_deref(), &mime, kind);

        let request = UploadMediaRequest {
            instance_id: deps.session_id,
            message_id: &message.id,
            mime_type: &mime,
            file_name: &name,
            bytes_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        match deps.edge.upload_media(&request).await {
            Ok(url) => {
                file_size = Some(bytes.len() as u64);
                mime_type = Some(mime);
                file_name = Some(name);
                media_url = Some(url);
            }
            Err(e) => {
                warn!(session = deps.session_id, message = %message.id, error = %e, "media upload failed, skipping message");
                return;
            }
        }
    }

    let sender_contact_id = if message.from_me {
        None
    } else {
        deps.contacts
            .resolve(&contact_jid, message.push_name.as_deref())
            .await
    };

    let (from, to) = if message.from_me {
        (own_jid.clone(), chat_id_norm.clone())
    } else {
        (chat_id_norm.clone(), own_jid.clone())
    };

    let payload = InboundPayload {
        instance_id: deps.session_id.to_string(),
        from,
        to,
        body: extracted.body,
        wa_message_id: message.id.clone(),
        from_me: message.from_me,
        chat_id_norm,
        sender_jid_raw,
        sender_pn,
        sender_contact_id,
        push_name: message.push_name.clone(),
        media_type: extracted.media.map(|k| k.as_str().to_string()),
        media_url,
        mime_type,
        file_name,
        file_size,
    };

    if let Err(e) = deps.edge.post_inbound(&payload).await {
        warn!(session = deps.session_id, message = %message.id, error = %e, "inbound post failed");
    } else {
        debug!(session = deps.session_id, message = %message.id, "inbound relayed");
    }
}

/// Record LID/PN pairs visible on the message key and its alternates.
async fn learn_alias_pairs(alias: &IdentityAliasStore, message: &InboundMessage) {
    let candidates = [
        (message.remote_jid.as_deref(), message.remote_jid_alt.as_deref()),
        (message.participant.as_deref(), message.sender_pn.as_deref()),
    ];
    for (a, b) in candidates {
        let (Some(a), Some(b)) = (a, b) else { continue };
        let pair = if a.ends_with("@lid") && is_pn_jid(b) {
            Some((a, b))
        } else if b.ends_with("@lid") && is_pn_jid(a) {
            Some((b, a))
        } else {
            None
        };
        if let Some((lid, pn)) = pair {
            if let Err(e) = alias.remember_pair(lid, pn).await {
                warn!(error = %e, "alias pair persist failed");
            }
        }
    }
}

/// Extract body and media class in slot-priority order: conversation,
/// extended text, image, video, audio, document.
pub fn extract_content(message: &InboundMessage) -> ExtractedContent {
    let content = &message.content;
    if let Some(text) = content.conversation.as_deref().filter(|t| !t.is_empty()) {
        return ExtractedContent {
            media: None,
            body: text.to_string(),
        };
    }
    if let Some(text) = content.extended_text.as_deref().filter(|t| !t.is_empty()) {
        return ExtractedContent {
            media: None,
            body: text.to_string(),
        };
    }
    if let Some(image) = &content.image {
        return ExtractedContent {
            media: Some(MediaKind::Image),
            body: image.caption.clone().unwrap_or_default(),
        };
    }
    if let Some(video) = &content.video {
        return ExtractedContent {
            media: Some(MediaKind::Video),
            body: video.caption.clone().unwrap_or_default(),
        };
    }
    if content.audio.is_some() {
        return ExtractedContent {
            media: Some(MediaKind::Audio),
            body: String::new(),
        };
    }
    if let Some(document) = &content.document {
        return ExtractedContent {
            media: Some(MediaKind::Document),
            body: document.caption.clone().unwrap_or_default(),
        };
    }
    ExtractedContent::default()
}

fn media_part_of(message: &InboundMessage, kind: Option<MediaKind>) -> Option<MediaPart> {
    let content = &message.content;
    match kind? {
        MediaKind::Image => content.image.clone(),
        MediaKind::Video => content.video.clone(),
        MediaKind::Audio => content.audio.clone(),
        MediaKind::Document => content.document.clone(),
    }
}

/// File name used on upload: the sanitized original when present, else a
/// name derived from the message id and the inferred extension.
pub fn upload_file_name(
    message_id: &str,
    original: Option<&str>,
    mime: &str,
    kind: MediaKind,
) -> String {
    if let Some(name) = original.filter(|n| !n.trim().is_empty()) {
        return sanitize_file_name(name);
    }
    let ext = infer_extension(Some(mime), original, kind);
    sanitize_file_name(&format!("{}.{}", message_id, ext))
}

/// `[^a-zA-Z0-9._-] → _`, capped at 120 chars.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(FILE_NAME_CAP);
    out
}

/// Extension inference: mime map, then the original file name, then the
/// media-type default.
pub fn infer_extension(mime: Option<&str>, file_name: Option<&str>, kind: MediaKind) -> String {
    if let Some(ext) = mime.and_then(extension_from_mime) {
        return ext.to_string();
    }
    if let Some(ext) = file_name
        .and_then(|n| n.rsplit_once('.').map(|(_, e)| e))
        .filter(|e| !e.is_empty() && e.len() <= 5)
    {
        return ext.to_ascii_lowercase();
    }
    kind.default_extension().to_string()
}

fn extension_from_mime(mime: &str) -> Option<&'static str> {
    // Parameters like "; codecs=opus" do not affect the mapping.
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    match essence {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "video/mp4" => Some("mp4"),
        "video/3gpp" => Some("3gp"),
        "audio/ogg" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/amr" => Some("amr"),
        "application/pdf" => Some("pdf"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}
