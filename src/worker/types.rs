//! Shared types for the session worker.
//!
//! Models cover the control-plane wire records (settings, eligibility,
//! queued messages, locks, inbound payloads), per-session runtime state, and
//! the send-debug record attached to every delivery confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════
//  Session status & connection state
// ═══════════════════════════════════════════════════════════════════════

/// Status values the control plane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Disconnected => "DISCONNECTED",
        }
    }
}

/// Per-session connection state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    WipedPendingRestart,
}

// ═══════════════════════════════════════════════════════════════════════
//  Control-plane wire records
// ═══════════════════════════════════════════════════════════════════════

/// `GET /worker-settings` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub max_active_instances: Option<i64>,
}

/// One entry of `GET /eligible-instances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibleInstance {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibleInstances {
    #[serde(default)]
    pub instances: Vec<EligibleInstance>,
}

/// One record of `GET /queued-messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuedMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl QueuedMessage {
    /// A record must carry an id, a destination, and either a body or a
    /// media URL to be sendable.
    pub fn is_well_formed(&self) -> bool {
        !self.id.trim().is_empty()
            && !self.to.trim().is_empty()
            && (self.body.as_deref().is_some_and(|b| !b.is_empty())
                || self.media_url.as_deref().is_some_and(|u| !u.is_empty()))
    }
}

/// Lock request body for acquire / renew / release.
#[derive(Debug, Clone, Serialize)]
pub struct LockRequest<'a> {
    #[serde(rename = "instanceId")]
    pub instance_id: &'a str,
    pub instance_owner: &'a str,
    pub ttl_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<&'a str>,
}

/// Lock response for acquire / renew.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockResponse {
    #[serde(default)]
    pub acquired: bool,
    #[serde(default)]
    pub instance_owner: Option<String>,
    #[serde(default)]
    pub lock_token: Option<String>,
}

/// `POST /contacts/resolve` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveContactResponse {
    #[serde(default)]
    pub contact_id: Option<String>,
}

/// `GET /contacts/primary-jid` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimaryJidResponse {
    #[serde(default)]
    pub jid_pn: Option<String>,
}

/// `POST /upload-media` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadMediaResponse {
    #[serde(default)]
    pub media_url: Option<String>,
}

/// `POST /upload-media` request.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMediaRequest<'a> {
    #[serde(rename = "instanceId")]
    pub instance_id: &'a str,
    #[serde(rename = "messageId")]
    pub message_id: &'a str,
    pub mime_type: &'a str,
    pub file_name: &'a str,
    pub bytes_base64: String,
}

/// `POST /inbound` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundPayload {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub from: String,
    pub to: String,
    /// Empty string when the message carries only media.
    pub body: String,
    pub wa_message_id: String,
    pub from_me: bool,
    pub chat_id_norm: String,
    pub sender_jid_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_contact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Send-debug record
// ═══════════════════════════════════════════════════════════════════════

/// Diagnostic record attached to every mark-sent / mark-failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDebug {
    /// Correlation id for tracing one queue record across retries.
    pub correlation_id: String,
    pub to_original: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_normalized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_jid: Option<String>,
    pub attempts: u32,
    pub session_refreshes: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendDebug {
    pub fn new(to_original: &str) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            to_original: to_original.to_string(),
            to_normalized: None,
            canonical_jid: None,
            attempts: 0,
            session_refreshes: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
