//! Sync Queue Coordinator: the only component that decides when and in what
//! order pending work is sent, and that reconciles local state with the
//! backend's acknowledgment.
//!
//! Processing is strictly sequential: one drain cycle at a time, one
//! situation at a time, one file at a time. Constrained mobile uplinks get a
//! single in-flight upload; parallelism would have to be reintroduced behind
//! the same guard if that tradeoff ever changes.

use crate::db::{self, Pool, SyncQueueItem, SyncStats};
use crate::error::SyncError;
use crate::model::{generate_public_id, DraftStatus, MultimediaRef, UploadStatus};
use crate::net::ConnectivityMonitor;
use crate::upload::{
    upload_with_retry, ArchivoRef, NoopProgress, ProgressSink, PushError, RemoteMediaService,
    RetryConfig, SignRequest,
};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Queue rounds before an item is abandoned.
const DEFAULT_MAX_RETRY_ROUNDS: u32 = 3;
/// Pause between queue items within one drain pass.
const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// What a drain pass did, for operator-level visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// True when the pass did not run: another cycle was active or the
    /// signing service was not ready.
    pub skipped: bool,
    pub items_completed: u32,
    pub items_dropped: u32,
    pub files_uploaded: u32,
    pub files_failed: u32,
}

pub struct SyncCoordinator {
    pool: Pool,
    svc: Arc<dyn RemoteMediaService>,
    retry: RetryConfig,
    pacing: Duration,
    max_retry_rounds: u32,
    progress: Arc<dyn ProgressSink>,
    syncing: AtomicBool,
}

/// Resets the syncing flag even if a drain errors out mid-cycle.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    pub fn new(pool: Pool, svc: Arc<dyn RemoteMediaService>) -> Self {
        Self {
            pool,
            svc,
            retry: RetryConfig::default(),
            pacing: DEFAULT_PACING,
            max_retry_rounds: DEFAULT_MAX_RETRY_ROUNDS,
            progress: Arc::new(NoopProgress),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_max_retry_rounds(mut self, rounds: u32) -> Self {
        self.max_retry_rounds = rounds;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Counters for the status bar: the operator must always be able to see
    /// what is saved locally but not yet centrally.
    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        db::stats(&self.pool).await
    }

    /// Queue the active draft's multimedia for synchronization. The draft
    /// must already be PENDIENTE (marked complete by the user).
    #[instrument(skip_all)]
    pub async fn enqueue_draft(&self) -> Result<SyncQueueItem, SyncError> {
        let draft = db::get_draft(&self.pool).await?.ok_or(SyncError::NoDraft)?;
        if draft.estado != DraftStatus::Pendiente {
            return Err(SyncError::InvalidTransition {
                from: draft.estado,
                to: DraftStatus::Enviando,
            });
        }
        db::enqueue_sync(&self.pool, &draft.id, &draft.multimedia).await
    }

    /// Manual retry: re-queue every not-yet-uploaded evidence item of a
    /// situation, including items previously abandoned after give-up.
    #[instrument(skip_all)]
    pub async fn retry_situacion(&self, situacion_id: &str) -> Result<SyncQueueItem, SyncError> {
        let refs: Vec<MultimediaRef> = db::list_evidencias(&self.pool, situacion_id)
            .await?
            .into_iter()
            .filter(|e| e.estado_upload != UploadStatus::Uploaded)
            .map(|e| MultimediaRef {
                tipo: e.tipo,
                orden: e.orden,
                infografia_numero: e.infografia_numero,
                infografia_titulo: None,
                uri: e.local_uri,
                latitud: e.latitud,
                longitud: e.longitud,
                duracion_segundos: e.duracion_segundos.map(|d| d as u32),
            })
            .collect();
        db::enqueue_sync(&self.pool, situacion_id, &refs).await
    }

    /// Run one drain pass over the persisted queue.
    ///
    /// Mutual exclusion: if a cycle is already active this is a no-op. The
    /// readiness probe failing defers the whole pass silently; offline
    /// periods simply never trigger this method.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress; skipping");
            return Ok(DrainOutcome {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = SyncingGuard(&self.syncing);

        match self.svc.check_status().await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                debug!("signing service not ready; deferring drain");
                return Ok(DrainOutcome {
                    skipped: true,
                    ..Default::default()
                });
            }
        }

        let mut outcome = DrainOutcome::default();
        loop {
            let Some(item) = db::front_queue(&self.pool).await? else {
                break;
            };
            let finished = self.process_item(&item, &mut outcome).await?;
            if !finished {
                // Item stays at the head for the next cycle.
                break;
            }
            if db::queue_len(&self.pool).await? > 0 {
                // Pace the next situation; a just-recovered link is fragile.
                tokio::time::sleep(self.pacing).await;
            }
        }
        info!(
            completed = outcome.items_completed,
            dropped = outcome.items_dropped,
            uploaded = outcome.files_uploaded,
            failed = outcome.files_failed,
            "drain pass finished"
        );
        Ok(outcome)
    }

    /// Process the head queue item. Returns true when the item left the
    /// queue (success, give-up or conflict) and draining may continue.
    async fn process_item(
        &self,
        item: &SyncQueueItem,
        outcome: &mut DrainOutcome,
    ) -> Result<bool> {
        info!(
            situacion = %item.situacion_id,
            files = item.multimedia.len(),
            round = item.retries + 1,
            "processing queue item"
        );

        // The sync engine owns the draft while its situation is in flight.
        if let Some(draft) = db::get_draft(&self.pool).await? {
            if draft.id == item.situacion_id && draft.estado == DraftStatus::Pendiente {
                db::update_status(&self.pool, DraftStatus::Enviando).await?;
            }
        }

        let total = item.multimedia.len();
        let mut archivos: Vec<ArchivoRef> = Vec::new();
        let mut failed: Vec<MultimediaRef> = Vec::new();

        for (index, mref) in item.multimedia.iter().enumerate() {
            self.progress.on_progress(index, total);
            let public_id = match generate_public_id(
                &item.situacion_id,
                mref.infografia_numero,
                mref.tipo,
                mref.orden,
            ) {
                Ok(p) => p,
                Err(err) => {
                    // Validated at capture; a bad slot here is a poisoned
                    // entry and retrying it would never succeed.
                    warn!(situacion = %item.situacion_id, %err, "dropping unsyncable ref");
                    continue;
                }
            };
            let Some(evidencia) = db::get_evidencia_by_public_id(&self.pool, &public_id).await?
            else {
                warn!(%public_id, "queued ref without evidence record; dropping");
                continue;
            };

            if evidencia.estado_upload == UploadStatus::Uploaded {
                archivos.push(archivo_for(&evidencia, mref));
                continue;
            }

            db::mark_uploading(&self.pool, evidencia.id).await?;
            let req = SignRequest::for_slot(&item.situacion_id, mref.tipo, &public_id);
            let result =
                upload_with_retry(&*self.svc, &req, &evidencia.local_uri, mref.tipo, &self.retry)
                    .await;

            if result.success {
                let remote_id = result.public_id.as_deref().unwrap_or(&public_id);
                let url = result.secure_url.clone().unwrap_or_default();
                db::mark_uploaded(&self.pool, evidencia.id, remote_id, &url).await?;
                outcome.files_uploaded += 1;
                archivos.push(ArchivoRef {
                    url,
                    public_id: remote_id.to_string(),
                    tipo: mref.tipo,
                    orden: mref.orden,
                    infografia_numero: mref.infografia_numero,
                    infografia_titulo: mref.infografia_titulo.clone(),
                });
            } else {
                let reason = result.error.unwrap_or_else(|| "upload failed".into());
                db::mark_upload_error(&self.pool, evidencia.id, &reason).await?;
                outcome.files_failed += 1;
                failed.push(mref.clone());
            }
        }
        self.progress.on_progress(total, total);

        // One round trip commits every uploaded reference of this situation.
        let mut batch_ok = true;
        if !archivos.is_empty() {
            match self
                .svc
                .push_batch_references(&item.situacion_id, &archivos)
                .await
            {
                Ok(()) => {}
                Err(PushError::Conflict(conflicto)) => {
                    if let Some(draft) = db::get_draft(&self.pool).await? {
                        if draft.id == item.situacion_id {
                            db::set_conflict(
                                &self.pool,
                                conflicto.situacion_existente,
                                conflicto.diferencias,
                                conflicto.conflicto_id,
                            )
                            .await?;
                        }
                    }
                    // Human resolution re-queues the situation; keeping the
                    // item would just burn retry rounds against a 409.
                    db::remove_queue_item(&self.pool, item.id).await?;
                    outcome.items_dropped += 1;
                    return Ok(true);
                }
                Err(PushError::Transport(err)) => {
                    warn!(situacion = %item.situacion_id, %err, "batch commit failed");
                    batch_ok = false;
                }
            }
        }

        // Rounds end by settling against the row's live contents: refs
        // enqueued or re-captured while this round ran stay queued.
        let all_ok = failed.is_empty() && batch_ok;
        if all_ok {
            let removed =
                db::settle_queue_item(&self.pool, item.id, &item.multimedia, &[], 0).await?;
            outcome.items_completed += 1;
            // Successful remote submission deletes the draft, unless fresh
            // refs arrived mid-round and the situation still has work queued.
            if removed {
                if let Some(draft) = db::get_draft(&self.pool).await? {
                    if draft.id == item.situacion_id && draft.estado == DraftStatus::Enviando {
                        db::delete_draft(&self.pool).await?;
                        info!(situacion = %item.situacion_id, "draft submitted and deleted");
                    }
                }
            }
            return Ok(true);
        }

        let retries = item.retries + 1;
        if retries >= self.max_retry_rounds {
            // Give up silently at the protocol level; the evidence rows stay
            // ERROR and the operator can trigger a manual retry. Refs that
            // arrived mid-round restart with a clean counter.
            warn!(
                situacion = %item.situacion_id,
                rounds = retries,
                "abandoning queue item after repeated failures"
            );
            db::settle_queue_item(&self.pool, item.id, &item.multimedia, &[], 0).await?;
            outcome.items_dropped += 1;
            return Ok(true);
        }

        // Shrink to the still-unsent subset. When the uploads succeeded but
        // the batch commit failed, every ref stays queued: the remote write
        // is idempotent and already-uploaded files are skipped next round.
        let remaining: Vec<MultimediaRef> = if batch_ok {
            failed
        } else {
            item.multimedia.clone()
        };
        let removed =
            db::settle_queue_item(&self.pool, item.id, &item.multimedia, &remaining, retries)
                .await?;
        Ok(removed)
    }

    /// Background task reacting to connectivity transitions: drains once if
    /// we start online, then on every offline -> online edge.
    pub fn spawn_on_reconnect(self: Arc<Self>, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let mut rx = monitor.subscribe();
        tokio::spawn(async move {
            let mut was_online = *rx.borrow();
            if was_online {
                if let Err(err) = self.drain().await {
                    error!(?err, "initial drain failed");
                }
            }
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                if online && !was_online {
                    info!("connectivity restored; draining sync queue");
                    if let Err(err) = self.drain().await {
                        error!(?err, "drain failed");
                    }
                }
                was_online = online;
            }
        })
    }
}

fn archivo_for(evidencia: &db::Evidencia, mref: &MultimediaRef) -> ArchivoRef {
    ArchivoRef {
        url: evidencia.cloudinary_url.clone().unwrap_or_default(),
        public_id: evidencia
            .cloudinary_public_id
            .clone()
            .unwrap_or_else(|| evidencia.public_id.clone()),
        tipo: evidencia.tipo,
        orden: evidencia.orden,
        infografia_numero: evidencia.infografia_numero,
        infografia_titulo: mref.infografia_titulo.clone(),
    }
}
