//! Typed HTTP client for the control plane.
//!
//! Thin, stateless wrapper over `reqwest` with bearer authentication, a
//! per-request timeout, and status-aware error typing. Duplicate-key
//! conflicts on contact resolution are classified so callers can treat
//! them as benign.

use crate::worker::config::WorkerConfig;
use crate::worker::error::{WorkerError, WorkerResult};
use crate::worker::types::*;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Lock operations mapped to `POST /instance-lock/{op}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Acquire,
    Renew,
    Release,
}

impl LockOp {
    fn path(&self) -> &'static str {
        match self {
            LockOp::Acquire => "instance-lock/acquire",
            LockOp::Renew => "instance-lock/renew",
            LockOp::Release => "instance-lock/release",
        }
    }
}

/// Low-level HTTP client for the control plane.
#[derive(Debug, Clone)]
pub struct EdgeClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl EdgeClient {
    /// Create a new client from configuration.
    pub fn new(config: &WorkerConfig) -> WorkerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkerError::network(format!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.edge_base_url.clone(),
            secret: config.worker_secret.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    // ─── HTTP primitives ─────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> WorkerResult<T> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.secret)
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::read_json(resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> WorkerResult<T> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.secret)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::read_json(resp).await
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> WorkerResult<T> {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            if body.is_empty() {
                // Some endpoints answer 2xx with no body.
                return serde_json::from_str("{}")
                    .or_else(|_| serde_json::from_str("null"))
                    .map_err(Into::into);
            }
            return serde_json::from_str(&body).map_err(Into::into);
        }
        Err(WorkerError::from_response(status, &body))
    }

    /// Plain unauthenticated GET for externally hosted media bytes.
    pub async fn download_url(&self, url: &str) -> WorkerResult<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(WorkerError::from_response(status, ""));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| WorkerError::network(format!("media download failed: {}", e)))
    }

    // ─── Discovery ───────────────────────────────────────────────────

    /// `GET /worker-settings`. Returns `None` on any failure; discovery
    /// falls back to the configured cap.
    pub async fn get_settings(&self) -> Option<WorkerSettings> {
        match self.get_json::<WorkerSettings>("worker-settings", &[]).await {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(error = %e, "worker-settings fetch failed");
                None
            }
        }
    }

    /// `GET /eligible-instances`.
    pub async fn list_eligible(
        &self,
        enabled: bool,
        limit: usize,
        order: &str,
    ) -> WorkerResult<Vec<EligibleInstance>> {
        let resp: EligibleInstances = self
            .get_json(
                "eligible-instances",
                &[
                    ("enabled", enabled.to_string()),
                    ("limit", limit.to_string()),
                    ("order", order.to_string()),
                ],
            )
            .await?;
        Ok(resp.instances)
    }

    // ─── Status ──────────────────────────────────────────────────────

    /// `POST /update-status`. Fire-and-forget; failures are logged only.
    pub async fn update_status(
        &self,
        instance_id: &str,
        status: SessionStatus,
        qr_code: Option<&str>,
    ) {
        let body = json!({
            "instanceId": instance_id,
            "status": status.as_str(),
            "qr_code": qr_code,
        });
        if let Err(e) = self.post_json::<serde_json::Value>("update-status", &body).await {
            debug!(session = instance_id, error = %e, "status update failed");
        }
    }

    // ─── Outbound queue ──────────────────────────────────────────────

    /// `GET /queued-messages?instanceId=…`.
    pub async fn list_queued(&self, instance_id: &str) -> WorkerResult<Vec<QueuedMessage>> {
        self.get_json(
            "queued-messages",
            &[("instanceId", instance_id.to_string())],
        )
        .await
    }

    /// `POST /mark-sent`.
    pub async fn mark_sent(
        &self,
        message_id: &str,
        wa_message_id: &str,
        send_debug: &SendDebug,
    ) -> WorkerResult<()> {
        let body = json!({
            "messageId": message_id,
            "wa_message_id": wa_message_id,
            "send_debug": send_debug,
        });
        self.post_json::<serde_json::Value>("mark-sent", &body)
            .await
            .map(|_| ())
    }

    /// `POST /mark-failed`. Best-effort: a failure here is logged and
    /// never interrupts the queue drain.
    pub async fn mark_failed(&self, message_id: &str, error_text: &str, send_debug: &SendDebug) {
        let body = json!({
            "messageId": message_id,
            "error": error_text,
            "send_debug": send_debug,
        });
        if let Err(e) = self.post_json::<serde_json::Value>("mark-failed", &body).await {
            warn!(message = message_id, error = %e, "mark-failed post failed");
        }
    }

    // ─── Inbound ─────────────────────────────────────────────────────

    /// `POST /inbound`.
    pub async fn post_inbound(&self, payload: &InboundPayload) -> WorkerResult<()> {
        let body = serde_json::to_value(payload)?;
        self.post_json::<serde_json::Value>("inbound", &body)
            .await
            .map(|_| ())
    }

    // ─── Contacts ────────────────────────────────────────────────────

    /// `POST /contacts/resolve`.
    pub async fn resolve_contact(
        &self,
        instance_id: &str,
        jid: &str,
        jid_type: &str,
        push_name: Option<&str>,
    ) -> WorkerResult<Option<String>> {
        let body = json!({
            "instanceId": instance_id,
            "jid": jid,
            "jid_type": jid_type,
            "push_name": push_name,
        });
        let resp: ResolveContactResponse = self.post_json("contacts/resolve", &body).await?;
        Ok(resp.contact_id)
    }

    /// `GET /contacts/primary-jid`.
    pub async fn primary_jid(
        &self,
        instance_id: &str,
        jid: &str,
    ) -> WorkerResult<Option<String>> {
        let resp: PrimaryJidResponse = self
            .get_json(
                "contacts/primary-jid",
                &[
                    ("instanceId", instance_id.to_string()),
                    ("jid", jid.to_string()),
                ],
            )
            .await?;
        Ok(resp.jid_pn)
    }

    // ─── Media ───────────────────────────────────────────────────────

    /// `POST /upload-media`. Returns the hosted media URL.
    pub async fn upload_media(&self, req: &UploadMediaRequest<'_>) -> WorkerResult<String> {
        let body = serde_json::to_value(req)?;
        let resp: UploadMediaResponse = self.post_json("upload-media", &body).await?;
        resp.media_url
            .ok_or_else(|| WorkerError::internal("upload-media response missing media_url"))
    }

    // ─── Sessions ────────────────────────────────────────────────────

    /// `POST /sessions/refresh`.
    pub async fn refresh_session(
        &self,
        instance_id: &str,
        jid: &str,
        trigger: &str,
    ) -> WorkerResult<()> {
        let body = json!({
            "instanceId": instance_id,
            "jid": jid,
            "trigger": trigger,
        });
        self.post_json::<serde_json::Value>("sessions/refresh", &body)
            .await
            .map(|_| ())
    }

    // ─── Locks ───────────────────────────────────────────────────────

    /// `POST /instance-lock/{acquire,renew,release}`.
    pub async fn lock(&self, op: LockOp, req: &LockRequest<'_>) -> WorkerResult<LockResponse> {
        let body = serde_json::to_value(req)?;
        self.post_json(op.path(), &body).await
    }
}

fn map_reqwest_error(e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::timeout("timeout")
    } else {
        WorkerError::network(e.to_string())
    }
}
