//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{DraftStatus, MultimediaRef, TipoMultimedia, TipoSituacion, UploadStatus};
use chrono::{DateTime, Utc};

/// A tracked evidence record: one captured photo or video, keyed to the
/// owning situation and its slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Evidencia {
    pub id: i64,
    pub situacion_id: String,
    pub infografia_numero: u32,
    pub tipo: TipoMultimedia,
    /// 1..=3 for photos; `None` for the video slot.
    pub orden: Option<u8>,
    pub local_uri: String,
    /// Deterministic remote object key for this slot.
    pub public_id: String,
    pub estado_upload: UploadStatus,
    /// Times an uploader claimed this item: one per sync round or
    /// opportunistic attempt. Transport retries within a claim are not
    /// counted; round-level give-up lives in the sync queue's own counter.
    pub upload_attempts: i32,
    pub cloudinary_public_id: Option<String>,
    pub cloudinary_url: Option<String>,
    pub error_message: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duracion_segundos: Option<i64>,
    pub size_bytes: Option<i64>,
    pub latitud: Option<f64>,
    pub longitud: Option<f64>,
}

/// Insert payload for a freshly captured evidence item.
#[derive(Debug, Clone)]
pub struct NewEvidencia {
    pub situacion_id: String,
    pub infografia_numero: u32,
    pub tipo: TipoMultimedia,
    pub orden: Option<u8>,
    pub local_uri: String,
    pub public_id: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duracion_segundos: Option<i64>,
    pub size_bytes: Option<i64>,
    pub latitud: Option<f64>,
    pub longitud: Option<f64>,
}

/// One unit of pending synchronization work: a situation plus the subset of
/// its multimedia that has not been committed remotely yet.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    pub id: i64,
    pub situacion_id: String,
    pub multimedia: Vec<MultimediaRef>,
    pub retries: u32,
}

/// Counters the UI queries so the operator can see what is still only local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    pub has_draft: bool,
    pub pending_evidencias: i64,
    pub error_evidencias: i64,
    pub queue_len: i64,
}

/// Draft summary for the capture screens.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftInfo {
    pub tipo: TipoSituacion,
    pub estado: DraftStatus,
    pub created_at: DateTime<Utc>,
    pub minutos_transcurridos: i64,
}
