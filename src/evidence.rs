//! Evidence Capture Pipeline: turns a raw captured file into a tracked
//! evidence record and attempts one opportunistic upload when the link and
//! the signing service are both available. Everything left PENDING or ERROR
//! is picked up later by the sync queue.

use crate::db::{self, Evidencia, NewEvidencia, Pool};
use crate::error::SyncError;
use crate::model::{generate_public_id, MultimediaRef, UploadStatus};
use crate::net::ConnectivityMonitor;
use crate::upload::{RemoteMediaService, SignRequest};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Best-effort capture metadata; dimensions and duration come from the
/// camera layer when it has them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureMeta {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duracion_segundos: Option<i64>,
}

pub struct EvidencePipeline {
    pool: Pool,
    svc: Arc<dyn RemoteMediaService>,
    net: ConnectivityMonitor,
}

impl EvidencePipeline {
    pub fn new(pool: Pool, svc: Arc<dyn RemoteMediaService>, net: ConnectivityMonitor) -> Self {
        Self { pool, svc, net }
    }

    /// Register a captured file for the given situation slot.
    ///
    /// Persists a PENDING evidence record (replacing any previous occupant of
    /// the slot), mirrors the reference into the active draft, and — when the
    /// device is online and the signing service reports ready — immediately
    /// uploads this single item. Failures of the opportunistic upload leave
    /// the record in ERROR for the queue; they are not surfaced as errors.
    #[instrument(skip_all, fields(situacion = situacion_id))]
    pub async fn process_media(
        &self,
        situacion_id: &str,
        media: MultimediaRef,
        meta: CaptureMeta,
    ) -> Result<Evidencia, SyncError> {
        // Slot validation happens before any state mutation.
        let public_id =
            generate_public_id(situacion_id, media.infografia_numero, media.tipo, media.orden)?;

        let path = media.uri.strip_prefix("file://").unwrap_or(&media.uri);
        let size_bytes = match tokio::fs::metadata(path).await {
            Ok(m) => Some(m.len() as i64),
            Err(err) => {
                // The OS media store owns the bytes; a stat failure here is
                // not fatal to tracking the reference.
                debug!(uri = %media.uri, %err, "could not stat captured file");
                None
            }
        };

        let evidencia = db::upsert_evidencia(
            &self.pool,
            NewEvidencia {
                situacion_id: situacion_id.to_string(),
                infografia_numero: media.infografia_numero,
                tipo: media.tipo,
                orden: media.orden,
                local_uri: media.uri.clone(),
                public_id: public_id.clone(),
                width: meta.width,
                height: meta.height,
                duracion_segundos: meta.duracion_segundos,
                size_bytes,
                latitud: media.latitud,
                longitud: media.longitud,
            },
        )
        .await?;

        // Mirror the reference into the active draft so its multimedia array
        // matches the evidence store. A capture without a matching draft is
        // tolerated; the evidencias table stays the source of truth.
        match db::get_draft(&self.pool).await? {
            Some(draft) if draft.id == situacion_id => {
                db::add_multimedia_to_draft(&self.pool, media.clone()).await?;
            }
            _ => {}
        }

        if !self.net.is_online() {
            info!(public_id = %public_id, "offline; evidence left pending");
            return Ok(evidencia);
        }
        match self.svc.check_status().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("signing service not configured; deferring to queue");
                return Ok(evidencia);
            }
            Err(err) => {
                debug!(%err, "signing status probe failed; deferring to queue");
                return Ok(evidencia);
            }
        }

        self.opportunistic_upload(&evidencia).await?;
        Ok(db::get_evidencia_by_public_id(&self.pool, &public_id)
            .await?
            .unwrap_or(evidencia))
    }

    /// One immediate upload attempt for a just-captured item. Retry policy
    /// belongs to the queue, not here.
    async fn opportunistic_upload(&self, evidencia: &Evidencia) -> Result<(), SyncError> {
        if evidencia.estado_upload == UploadStatus::Uploaded {
            return Ok(());
        }
        db::mark_uploading(&self.pool, evidencia.id).await?;

        let req = SignRequest::for_slot(
            &evidencia.situacion_id,
            evidencia.tipo,
            &evidencia.public_id,
        );
        let params = match self.svc.sign_upload(&req).await {
            Ok(p) => p,
            Err(err) => {
                warn!(public_id = %evidencia.public_id, %err, "signing failed");
                db::mark_upload_error(&self.pool, evidencia.id, &format!("signing failed: {err:#}"))
                    .await?;
                return Ok(());
            }
        };
        let result = self
            .svc
            .upload_to_remote(&evidencia.local_uri, &params, evidencia.tipo)
            .await;
        if result.success {
            let remote_id = result.public_id.as_deref().unwrap_or(&evidencia.public_id);
            let url = result.secure_url.as_deref().unwrap_or_default();
            db::mark_uploaded(&self.pool, evidencia.id, remote_id, url).await?;
            info!(public_id = %evidencia.public_id, "opportunistic upload succeeded");
        } else {
            let reason = result.error.unwrap_or_else(|| "upload failed".into());
            warn!(public_id = %evidencia.public_id, %reason, "opportunistic upload failed");
            db::mark_upload_error(&self.pool, evidencia.id, &reason).await?;
        }
        Ok(())
    }
}
