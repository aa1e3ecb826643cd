//! Outbound message queue drain.
//!
//! One ticker per open session polls the control plane for queued
//! messages, normalizes destinations, sends each record through the
//! socket (with a session-refresh retry for transient decrypt failures),
//! and confirms the outcome with mark-sent / mark-failed. A per-session
//! processing flag forbids overlapping ticks; per-message failures never
//! stop the drain.

use crate::worker::alias::{is_pn_jid, IdentityAliasStore};
use crate::worker::config::{WorkerConfig, SESSION_REFRESH_BACKOFF_MS};
use crate::worker::connection::SessionRuntime;
use crate::worker::edge::EdgeClient;
use crate::worker::error::{WorkerErrorKind, WorkerResult};
use crate::worker::socket::{MediaKind, OutboundMedia, WaSocket};
use crate::worker::types::{QueuedMessage, SendDebug};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn group_shape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+-\d+$").expect("static regex"))
}

/// Spawn the queue ticker for an open session. The task exits when the
/// runtime is dropped or the handle is aborted on close.
pub(crate) fn spawn_for(
    runtime: &Arc<SessionRuntime>,
    socket: Arc<dyn WaSocket>,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(runtime);
    tokio::spawn(async move {
        let poll = match weak.upgrade() {
            Some(rt) => rt.cfg.queue_poll,
            None => return,
        };
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let processing = AtomicBool::new(false);

        loop {
            ticker.tick().await;
            let Some(runtime) = weak.upgrade() else { break };
            if !runtime.is_open() {
                continue;
            }
            if processing.swap(true, Ordering::SeqCst) {
                continue;
            }
            run_tick(
                &runtime.cfg,
                &runtime.edge,
                &runtime.alias,
                &runtime.id,
                socket.as_ref(),
            )
            .await;
            processing.store(false, Ordering::SeqCst);
        }
    })
}

/// One queue pass: fetch and process every pending record.
pub async fn run_tick(
    cfg: &WorkerConfig,
    edge: &EdgeClient,
    alias: &IdentityAliasStore,
    session_id: &str,
    socket: &dyn WaSocket,
) {
    let queued = match edge.list_queued(session_id).await {
        Ok(queued) => queued,
        Err(e) => {
            warn!(session = session_id, error = %e, "queued-messages fetch failed");
            return;
        }
    };
    if queued.is_empty() {
        return;
    }
    debug!(session = session_id, count = queued.len(), "draining outbound queue");

    for message in &queued {
        process_message(cfg, edge, alias, session_id, socket, message).await;
    }
}

/// Process a single queued record end to end.
pub async fn process_message(
    cfg: &WorkerConfig,
    edge: &EdgeClient,
    alias: &IdentityAliasStore,
    session_id: &str,
    socket: &dyn WaSocket,
    message: &QueuedMessage,
) {
    let mut send_debug = SendDebug::new(&message.to);

    if !message.is_well_formed() {
        send_debug.finish();
        if message.id.trim().is_empty() {
            warn!(session = session_id, "queued record without id, skipping");
        } else {
            edge.mark_failed(&message.id, "malformed-message", &send_debug)
                .await;
        }
        return;
    }

    let destination = match resolve_destination(edge, session_id, &message.to).await {
        Ok(dest) => dest,
        Err(reason) => {
            send_debug.finish();
            send_debug.error = Some(reason.clone());
            edge.mark_failed(&message.id, &reason, &send_debug).await;
            return;
        }
    };
    send_debug.to_normalized = Some(destination.clone());

    match send_with_recovery(
        cfg,
        edge,
        alias,
        session_id,
        socket,
        message,
        &destination,
        &mut send_debug,
    )
    .await
    {
        Ok(wa_message_id) => {
            send_debug.finish();
            if let Err(e) = edge
                .mark_sent(&message.id, &wa_message_id, &send_debug)
                .await
            {
                warn!(session = session_id, message = %message.id, error = %e, "mark-sent failed");
            }
        }
        Err(e) => {
            send_debug.error = Some(e.to_string());
            send_debug.finish();
            edge.mark_failed(&message.id, &e.to_string(), &send_debug)
                .await;
        }
    }
}

/// Normalize a queued `to` field into a sendable jid.
///
/// `@lid` destinations are mapped to their primary phone jid via the
/// control plane; everything else is shaped locally.
pub async fn resolve_destination(
    edge: &EdgeClient,
    session_id: &str,
    to: &str,
) -> Result<String, String> {
    let to = to.trim();
    if to.ends_with("@lid") {
        return match edge.primary_jid(session_id, to).await {
            Ok(Some(pn)) if is_pn_jid(&pn) => Ok(pn),
            Ok(_) => Err("lid_without_mapping".to_string()),
            Err(e) => Err(format!("primary_jid_lookup_failed: {}", e)),
        };
    }
    Ok(normalize_shape(to))
}

/// Pure destination shaping. Idempotent.
pub fn normalize_shape(to: &str) -> String {
    if to.contains("@g.us") || to.contains("@s.whatsapp.net") {
        to.to_string()
    } else if !to.is_empty() && to.bytes().all(|b| b.is_ascii_digit()) {
        format!("{}@s.whatsapp.net", to)
    } else if group_shape_re().is_match(to) {
        format!("{}@g.us", to)
    } else {
        to.to_string()
    }
}

/// Send with session-recovery retries.
///
/// Transient "no matching sessions found" failures trigger a control-plane
/// session refresh followed by a short sleep, up to the configured attempt
/// cap. Any other error exits immediately.
#[allow(clippy::too_many_arguments)]
pub async fn send_with_recovery(
    cfg: &WorkerConfig,
    edge: &EdgeClient,
    alias: &IdentityAliasStore,
    session_id: &str,
    socket: &dyn WaSocket,
    message: &QueuedMessage,
    destination: &str,
    send_debug: &mut SendDebug,
) -> WorkerResult<String> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        send_debug.attempts = attempt;

        // Aliasing can be learned mid-retry, so canonicalize every attempt.
        let canonical = alias.resolve_canonical(destination, None).await;
        send_debug.canonical_jid = Some(canonical.clone());

        match send_by_type(edge, socket, &canonical, message).await {
            Ok(wa_message_id) => return Ok(wa_message_id),
            Err(e)
                if e.kind == WorkerErrorKind::SignalNoSession
                    && attempt <= cfg.decrypt_retry_max_attempts =>
            {
                send_debug.session_refreshes += 1;
                if let Err(re) = edge
                    .refresh_session(session_id, &canonical, "no_matching_sessions")
                    .await
                {
                    warn!(session = session_id, error = %re, "session refresh failed");
                }
                let idx = (attempt as usize - 1).min(SESSION_REFRESH_BACKOFF_MS.len() - 1);
                tokio::time::sleep(std::time::Duration::from_millis(
                    SESSION_REFRESH_BACKOFF_MS[idx],
                ))
                .await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Dispatch one record to the socket by media type.
pub async fn send_by_type(
    edge: &EdgeClient,
    socket: &dyn WaSocket,
    jid: &str,
    message: &QueuedMessage,
) -> WorkerResult<String> {
    let Some(media_url) = message.media_url.as_deref().filter(|u| !u.is_empty()) else {
        return socket
            .send_text(jid, message.body.as_deref().unwrap_or_default())
            .await;
    };

    let bytes = edge.download_url(media_url).await?;
    let kind = message
        .media_type
        .as_deref()
        .and_then(MediaKind::parse)
        .unwrap_or(MediaKind::Document);

    let media = match kind {
        MediaKind::Image | MediaKind::Video => OutboundMedia {
            kind,
            bytes,
            mime_type: message.mime_type.clone(),
            file_name: None,
            caption: message.body.clone(),
            ptt: false,
        },
        MediaKind::Audio => OutboundMedia {
            kind,
            bytes,
            mime_type: Some(
                message
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "audio/ogg".to_string()),
            ),
            file_name: None,
            caption: None,
            ptt: false,
        },
        MediaKind::Document => OutboundMedia {
            kind,
            bytes,
            mime_type: Some(
                message
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            ),
            file_name: Some(
                message
                    .file_name
                    .clone()
                    .unwrap_or_else(|| format!("document-{}", message.id)),
            ),
            caption: message.body.clone(),
            ptt: false,
        },
    };
    socket.send_media(jid, media).await
}
