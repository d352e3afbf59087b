//! Upload Engine: moves exactly one evidence item's bytes to remote object
//! storage using a short-lived signed credential obtained from the backend.
//! The client never holds long-lived storage secrets.
//!
//! Transport failures are returned as structured `UploadResult`s rather than
//! errors, so callers can make retry/give-up decisions without
//! exception-style control flow. Retry policy lives in `upload_with_retry`
//! and in the queue coordinator, never inside the transport calls.

use crate::config::Config;
use crate::model::{FieldDiff, TipoMultimedia};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Request body for `POST /cloudinary/sign`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub draft_uuid: String,
    pub file_type: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

impl SignRequest {
    /// Signing request for a deterministic evidence slot. The public id pins
    /// the remote object key, so re-uploads overwrite instead of duplicating.
    pub fn for_slot(situacion_id: &str, tipo: TipoMultimedia, public_id: &str) -> Self {
        Self {
            draft_uuid: situacion_id.to_string(),
            file_type: tipo.resource_type().to_string(),
            resource_type: tipo.resource_type().to_string(),
            folder: None,
            public_id: Some(public_id.to_string()),
            tags: Some(format!("situacion,{situacion_id}")),
        }
    }
}

/// Short-lived signed upload credential, as returned by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUploadParams {
    pub signature: String,
    pub timestamp: i64,
    pub api_key: String,
    pub cloud_name: String,
    pub folder: String,
    pub public_id: String,
    pub upload_url: String,
}

/// Outcome of a single upload. `success == false` carries the reason; this
/// never aborts the caller.
#[derive(Debug, Clone, Default)]
pub struct UploadResult {
    pub success: bool,
    pub public_id: Option<String>,
    pub secure_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bytes: Option<i64>,
    pub error: Option<String>,
}

impl UploadResult {
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// One entry of the batch-reference commit payload.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivoRef {
    pub url: String,
    pub public_id: String,
    pub tipo: TipoMultimedia,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orden: Option<u8>,
    pub infografia_numero: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infografia_titulo: Option<String>,
}

/// Conflict body of a 409 from the batch-reference endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConflictoResponse {
    #[serde(default)]
    pub situacion_existente: serde_json::Value,
    #[serde(default)]
    pub diferencias: Vec<FieldDiff>,
    #[serde(default)]
    pub conflicto_id: Option<i64>,
}

#[derive(Debug, Error)]
pub enum PushError {
    /// The server holds divergent concurrent state; requires human
    /// resolution, never auto-resolved.
    #[error("server reported divergent state for the situation")]
    Conflict(ConflictoResponse),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Typed observer for fractional progress, composable with a future
/// multi-item upload design.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, current: usize, total: usize);
}

/// Default sink that drops progress events.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&self, _current: usize, _total: usize) {}
}

/// Remote media operations consumed by the pipeline and the sync queue.
/// Implemented by `BackendClient` in production and by recording mocks in
/// tests.
#[async_trait]
pub trait RemoteMediaService: Send + Sync {
    /// Readiness probe: is the signing service configured on the backend?
    async fn check_status(&self) -> Result<bool>;

    async fn sign_upload(&self, req: &SignRequest) -> Result<SignedUploadParams>;

    /// Direct multipart upload to the signed `upload_url`. Missing local
    /// files, network failures and non-2xx responses all come back as a
    /// failed `UploadResult`.
    async fn upload_to_remote(
        &self,
        local_uri: &str,
        params: &SignedUploadParams,
        tipo: TipoMultimedia,
    ) -> UploadResult;

    /// Bulk reference commit: one round trip for all of a situation's files.
    /// Idempotent per (situacion, public_id) pair server-side.
    async fn push_batch_references(
        &self,
        situacion_id: &str,
        archivos: &[ArchivoRef],
    ) -> Result<(), PushError>;
}

/// Bounded retry tuning for one evidence item.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff: initial * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(10);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Sign-then-upload with bounded retry. Used by the Sync Queue for each file
/// of a queue item; the per-round retry here is independent of the queue's
/// round counter.
pub async fn upload_with_retry(
    svc: &dyn RemoteMediaService,
    req: &SignRequest,
    local_uri: &str,
    tipo: TipoMultimedia,
    retry: &RetryConfig,
) -> UploadResult {
    let mut last_error = String::from("upload failed");
    for attempt in 0..retry.max_attempts {
        match svc.sign_upload(req).await {
            Ok(params) => {
                let result = svc.upload_to_remote(local_uri, &params, tipo).await;
                if result.success {
                    return result;
                }
                last_error = result.error.unwrap_or(last_error);
            }
            Err(err) => last_error = format!("signing failed: {err:#}"),
        }
        warn!(attempt, uri = local_uri, error = %last_error, "upload attempt failed");
        if attempt + 1 < retry.max_attempts {
            tokio::time::sleep(retry.delay_for(attempt)).await;
        }
    }
    UploadResult::fail(last_error)
}

/// MIME type inferred from the file extension; the media store names files
/// conventionally on both platforms.
pub fn mime_for_uri(uri: &str) -> &'static str {
    let ext = uri.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize)]
struct CloudinaryUploadResponse {
    public_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    width: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
    #[serde(default)]
    bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    configured: bool,
}

/// Production implementation backed by the REST API plus direct uploads to
/// the object-storage provider.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    token: String,
    max_video_bytes: u64,
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    pub fn new(
        base_url: &str,
        token: String,
        timeout: Duration,
        max_video_bytes: u64,
    ) -> Result<Self> {
        // A trailing slash keeps Url::join from eating the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).context("invalid backend base URL")?;
        let http = Client::builder()
            .user_agent("brigada-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            max_video_bytes,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.backend.base_url,
            cfg.backend.token.clone(),
            Duration::from_secs(cfg.backend.timeout_seconds),
            cfg.upload.max_video_bytes,
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {path}"))
    }
}

#[async_trait]
impl RemoteMediaService for BackendClient {
    async fn check_status(&self) -> Result<bool> {
        let res = self
            .http
            .get(self.endpoint("cloudinary/status")?)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach signing status endpoint")?;
        if !res.status().is_success() {
            return Ok(false);
        }
        let status: StatusResponse = res
            .json()
            .await
            .context("failed to parse signing status response")?;
        Ok(status.configured)
    }

    async fn sign_upload(&self, req: &SignRequest) -> Result<SignedUploadParams> {
        let res = self
            .http
            .post(self.endpoint("cloudinary/sign")?)
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await
            .context("failed to reach signing endpoint")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("signing error {}: {}", status, body));
        }
        res.json()
            .await
            .context("failed to parse signed upload params")
    }

    async fn upload_to_remote(
        &self,
        local_uri: &str,
        params: &SignedUploadParams,
        tipo: TipoMultimedia,
    ) -> UploadResult {
        let path = local_uri.strip_prefix("file://").unwrap_or(local_uri);
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(err) => return UploadResult::fail(format!("local file not found: {err}")),
        };
        if tipo == TipoMultimedia::Video && bytes.len() as u64 > self.max_video_bytes {
            return UploadResult::fail(format!(
                "video exceeds the {} byte limit",
                self.max_video_bytes
            ));
        }

        let file_name = path.rsplit('/').next().unwrap_or("upload").to_string();
        let part = match multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for_uri(local_uri))
        {
            Ok(p) => p,
            Err(err) => return UploadResult::fail(format!("invalid mime type: {err}")),
        };
        let form = multipart::Form::new()
            .part("file", part)
            .text("api_key", params.api_key.clone())
            .text("timestamp", params.timestamp.to_string())
            .text("signature", params.signature.clone())
            .text("folder", params.folder.clone())
            .text("public_id", params.public_id.clone());

        let res = match self.http.post(&params.upload_url).multipart(form).send().await {
            Ok(r) => r,
            Err(err) => return UploadResult::fail(format!("network error: {err}")),
        };
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return UploadResult::fail(format!("remote storage error {status}: {body}"));
        }
        match res.json::<CloudinaryUploadResponse>().await {
            Ok(body) => {
                info!(public_id = %body.public_id, "upload complete");
                UploadResult {
                    success: true,
                    secure_url: body.secure_url.or(body.url),
                    public_id: Some(body.public_id),
                    width: body.width,
                    height: body.height,
                    bytes: body.bytes,
                    error: None,
                }
            }
            Err(err) => UploadResult::fail(format!("failed to parse upload response: {err}")),
        }
    }

    async fn push_batch_references(
        &self,
        situacion_id: &str,
        archivos: &[ArchivoRef],
    ) -> Result<(), PushError> {
        let endpoint = self.endpoint(&format!("multimedia/situacion/{situacion_id}/batch"))?;
        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "archivos": archivos }))
            .send()
            .await
            .context("failed to reach batch reference endpoint")?;

        if res.status() == StatusCode::CONFLICT {
            let body: ConflictoResponse = res.json().await.unwrap_or_default();
            warn!(situacion = situacion_id, "batch commit reported a conflict");
            return Err(PushError::Conflict(body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(PushError::Transport(anyhow!(
                "batch reference error {}: {}",
                status,
                body
            )));
        }
        info!(situacion = situacion_id, files = archivos.len(), "references committed");
        Ok(())
    }
}
