use super::model::{DraftInfo, Evidencia, NewEvidencia, SyncQueueItem, SyncStats};
use crate::error::SyncError;
use crate::model::{
    Conflicto, DraftSituacion, DraftStatus, FieldDiff, MultimediaRef, TipoMultimedia, UploadStatus,
};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument};

pub type Pool = SqlitePool;

const DRAFT_KEY: &str = "situacion_pendiente";

pub async fn init_pool(database_url: &str) -> Result<Pool, SyncError> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus full sync: drafts must survive crashes mid-shift.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{expanded}?{q}"),
        None => format!("sqlite://{expanded}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<(), SyncError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| SyncError::Storage(e.into()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Draft (singleton)
// ---------------------------------------------------------------------------

pub async fn has_draft(pool: &Pool) -> Result<bool, SyncError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM draft_actual WHERE clave = ?")
        .bind(DRAFT_KEY)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn get_draft(pool: &Pool) -> Result<Option<DraftSituacion>, SyncError> {
    let payload: Option<String> =
        sqlx::query_scalar("SELECT payload FROM draft_actual WHERE clave = ?")
            .bind(DRAFT_KEY)
            .fetch_optional(pool)
            .await?;
    match payload {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Upsert the singleton draft. Rejects creating a second distinct draft while
/// one is active; every stored state is non-terminal, so any existing draft
/// with a different id blocks the write.
#[instrument(skip_all)]
pub async fn save_draft(pool: &Pool, draft: &DraftSituacion) -> Result<DraftSituacion, SyncError> {
    let mut tx = pool.begin().await?;
    let existing: Option<String> =
        sqlx::query_scalar("SELECT situacion_id FROM draft_actual WHERE clave = ?")
            .bind(DRAFT_KEY)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some(existing) = existing {
        if existing != draft.id {
            return Err(SyncError::ConflictingDraft { existing });
        }
    }

    let mut draft = draft.clone();
    draft.updated_at = Utc::now();
    let payload = serde_json::to_string(&draft)?;
    sqlx::query(
        "INSERT INTO draft_actual (clave, situacion_id, estado, payload, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (clave) DO UPDATE SET \
           situacion_id = excluded.situacion_id, \
           estado = excluded.estado, \
           payload = excluded.payload, \
           updated_at = excluded.updated_at",
    )
    .bind(DRAFT_KEY)
    .bind(&draft.id)
    .bind(draft.estado.as_str())
    .bind(&payload)
    .bind(draft.created_at.to_rfc3339())
    .bind(draft.updated_at.to_rfc3339())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    info!(id = %draft.id, estado = %draft.estado, "draft saved");
    Ok(draft)
}

/// Apply a mutation to the existing draft and persist the result. Fails with
/// `NoDraft` when none exists. The read-modify-write runs inside one
/// transaction so concurrent mutations (UI edits vs. the drain task) cannot
/// lose updates.
#[instrument(skip_all)]
pub async fn update_draft<F>(pool: &Pool, mutate: F) -> Result<DraftSituacion, SyncError>
where
    F: FnOnce(&mut DraftSituacion),
{
    let mut tx = pool.begin().await?;
    let payload: Option<String> =
        sqlx::query_scalar("SELECT payload FROM draft_actual WHERE clave = ?")
            .bind(DRAFT_KEY)
            .fetch_optional(&mut *tx)
            .await?;
    let mut draft: DraftSituacion =
        serde_json::from_str(&payload.ok_or(SyncError::NoDraft)?)?;
    mutate(&mut draft);
    draft.updated_at = Utc::now();
    let payload = serde_json::to_string(&draft)?;
    sqlx::query(
        "UPDATE draft_actual SET situacion_id = ?, estado = ?, payload = ?, updated_at = ? \
         WHERE clave = ?",
    )
    .bind(&draft.id)
    .bind(draft.estado.as_str())
    .bind(&payload)
    .bind(draft.updated_at.to_rfc3339())
    .bind(DRAFT_KEY)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(draft)
}

/// Validated status transition. `CONFLICTO -> PENDIENTE` must carry a
/// resolution outcome and is rejected here; use `resolve_conflict`.
#[instrument(skip_all)]
pub async fn update_status(pool: &Pool, estado: DraftStatus) -> Result<DraftSituacion, SyncError> {
    let draft = get_draft(pool).await?.ok_or(SyncError::NoDraft)?;
    if draft.estado == DraftStatus::Conflicto && estado == DraftStatus::Pendiente {
        return Err(SyncError::ResolutionRequired);
    }
    if !draft.estado.can_transition(estado) {
        return Err(SyncError::InvalidTransition {
            from: draft.estado,
            to: estado,
        });
    }
    update_draft(pool, |d| d.estado = estado).await
}

/// Idempotent: deleting a missing draft is a no-op.
#[instrument(skip_all)]
pub async fn delete_draft(pool: &Pool) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM draft_actual WHERE clave = ?")
        .bind(DRAFT_KEY)
        .execute(pool)
        .await?;
    Ok(())
}

/// Route a server-reported divergence into CONFLICTO with its diff payload.
#[instrument(skip_all)]
pub async fn set_conflict(
    pool: &Pool,
    datos_servidor: serde_json::Value,
    diferencias: Vec<FieldDiff>,
    conflicto_id: Option<i64>,
) -> Result<DraftSituacion, SyncError> {
    let draft = get_draft(pool).await?.ok_or(SyncError::NoDraft)?;
    if !draft.estado.can_transition(DraftStatus::Conflicto) {
        return Err(SyncError::InvalidTransition {
            from: draft.estado,
            to: DraftStatus::Conflicto,
        });
    }
    update_draft(pool, |d| {
        d.estado = DraftStatus::Conflicto;
        d.conflicto = Some(Conflicto {
            datos_servidor,
            diferencias,
            conflicto_id,
        });
    })
    .await
}

/// Escalate a conflict to the central operations desk.
#[instrument(skip_all)]
pub async fn set_wait_cop(pool: &Pool, conflicto_id: i64) -> Result<DraftSituacion, SyncError> {
    let draft = get_draft(pool).await?.ok_or(SyncError::NoDraft)?;
    if !draft.estado.can_transition(DraftStatus::WaitCop) {
        return Err(SyncError::InvalidTransition {
            from: draft.estado,
            to: DraftStatus::WaitCop,
        });
    }
    update_draft(pool, |d| {
        d.estado = DraftStatus::WaitCop;
        if let Some(c) = d.conflicto.as_mut() {
            c.conflicto_id = Some(conflicto_id);
        }
    })
    .await
}

/// Resolution outcome: the user (or the COP) decided to keep the local data.
/// Clears the conflict payload and re-queues the draft as PENDIENTE.
#[instrument(skip_all)]
pub async fn resolve_conflict(pool: &Pool) -> Result<DraftSituacion, SyncError> {
    let draft = get_draft(pool).await?.ok_or(SyncError::NoDraft)?;
    if !matches!(draft.estado, DraftStatus::Conflicto | DraftStatus::WaitCop) {
        return Err(SyncError::InvalidTransition {
            from: draft.estado,
            to: DraftStatus::Pendiente,
        });
    }
    update_draft(pool, |d| {
        d.estado = DraftStatus::Pendiente;
        d.conflicto = None;
    })
    .await
}

/// Attach a multimedia reference to the draft. A reference for an occupied
/// slot replaces the previous occupant; photo slots outside 1..=3 are
/// rejected before any mutation.
#[instrument(skip_all)]
pub async fn add_multimedia_to_draft(
    pool: &Pool,
    media: MultimediaRef,
) -> Result<DraftSituacion, SyncError> {
    if media.tipo == TipoMultimedia::Foto {
        let orden = media.orden.unwrap_or(0);
        if !(1..=3).contains(&orden) {
            return Err(SyncError::InvalidSlot(orden));
        }
    }
    update_draft(pool, |d| {
        let key = media.slot_key();
        match d.multimedia.iter_mut().find(|m| m.slot_key() == key) {
            Some(slot) => *slot = media,
            None => d.multimedia.push(media),
        }
    })
    .await
}

/// Drop a reference by local URI, deleting its evidence record with it so
/// the backlog counters and retry paths never see the discarded capture
/// again. Slots keep their orden; removal never reassigns the remaining
/// evidence.
#[instrument(skip_all)]
pub async fn remove_multimedia_from_draft(pool: &Pool, uri: &str) -> Result<(), SyncError> {
    let Some(draft) = get_draft(pool).await? else {
        return Ok(());
    };
    sqlx::query("DELETE FROM evidencias WHERE situacion_id = ? AND local_uri = ?")
        .bind(&draft.id)
        .bind(uri)
        .execute(pool)
        .await?;
    update_draft(pool, |d| d.multimedia.retain(|m| m.uri != uri)).await?;
    Ok(())
}

/// Draft summary for the capture screens.
pub async fn get_draft_info(pool: &Pool) -> Result<Option<DraftInfo>, SyncError> {
    let Some(draft) = get_draft(pool).await? else {
        return Ok(None);
    };
    let minutos = (Utc::now() - draft.created_at).num_minutes();
    Ok(Some(DraftInfo {
        tipo: draft.tipo_situacion,
        estado: draft.estado,
        created_at: draft.created_at,
        minutos_transcurridos: minutos,
    }))
}

// ---------------------------------------------------------------------------
// Evidencias
// ---------------------------------------------------------------------------

fn row_to_evidencia(row: &sqlx::sqlite::SqliteRow) -> Result<Evidencia, SyncError> {
    let tipo_str: String = row.get("tipo");
    let tipo = TipoMultimedia::parse_str(&tipo_str)
        .ok_or_else(|| SyncError::Corrupt(format!("unknown tipo '{tipo_str}'")))?;
    let estado_str: String = row.get("estado_upload");
    let estado_upload = UploadStatus::parse_str(&estado_str)
        .ok_or_else(|| SyncError::Corrupt(format!("unknown estado_upload '{estado_str}'")))?;
    let orden: i64 = row.get("orden");

    Ok(Evidencia {
        id: row.get("id"),
        situacion_id: row.get("situacion_id"),
        infografia_numero: row.get::<i64, _>("infografia_numero") as u32,
        tipo,
        orden: if orden == 0 { None } else { Some(orden as u8) },
        local_uri: row.get("local_uri"),
        public_id: row.get("public_id"),
        estado_upload,
        upload_attempts: row.get("upload_attempts"),
        cloudinary_public_id: row.get("cloudinary_public_id"),
        cloudinary_url: row.get("cloudinary_url"),
        error_message: row.get("error_message"),
        width: row.get("width"),
        height: row.get("height"),
        duracion_segundos: row.get("duracion_segundos"),
        size_bytes: row.get("size_bytes"),
        latitud: row.get("latitud"),
        longitud: row.get("longitud"),
    })
}

/// Insert an evidence record, or replace the occupant of the same slot.
/// Replacement resets the upload state: the new bytes have never been sent.
#[instrument(skip_all)]
pub async fn upsert_evidencia(pool: &Pool, nueva: NewEvidencia) -> Result<Evidencia, SyncError> {
    let row = sqlx::query(
        "INSERT INTO evidencias \
           (situacion_id, infografia_numero, tipo, orden, local_uri, public_id, \
            estado_upload, upload_attempts, width, height, duracion_segundos, size_bytes, \
            latitud, longitud) \
         VALUES (?, ?, ?, ?, ?, ?, 'PENDING', 0, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (situacion_id, infografia_numero, tipo, orden) DO UPDATE SET \
           local_uri = excluded.local_uri, \
           public_id = excluded.public_id, \
           estado_upload = 'PENDING', \
           upload_attempts = 0, \
           cloudinary_public_id = NULL, \
           cloudinary_url = NULL, \
           error_message = NULL, \
           width = excluded.width, \
           height = excluded.height, \
           duracion_segundos = excluded.duracion_segundos, \
           size_bytes = excluded.size_bytes, \
           latitud = excluded.latitud, \
           longitud = excluded.longitud \
         RETURNING *",
    )
    .bind(&nueva.situacion_id)
    .bind(nueva.infografia_numero as i64)
    .bind(nueva.tipo.as_str())
    .bind(nueva.orden.unwrap_or(0) as i64)
    .bind(&nueva.local_uri)
    .bind(&nueva.public_id)
    .bind(nueva.width)
    .bind(nueva.height)
    .bind(nueva.duracion_segundos)
    .bind(nueva.size_bytes)
    .bind(nueva.latitud)
    .bind(nueva.longitud)
    .fetch_one(pool)
    .await?;
    row_to_evidencia(&row)
}

pub async fn list_evidencias(pool: &Pool, situacion_id: &str) -> Result<Vec<Evidencia>, SyncError> {
    let rows = sqlx::query(
        "SELECT * FROM evidencias WHERE situacion_id = ? \
         ORDER BY infografia_numero, (CASE tipo WHEN 'FOTO' THEN 0 ELSE 1 END), orden",
    )
    .bind(situacion_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_evidencia).collect()
}

pub async fn get_evidencia_by_public_id(
    pool: &Pool,
    public_id: &str,
) -> Result<Option<Evidencia>, SyncError> {
    let row = sqlx::query("SELECT * FROM evidencias WHERE public_id = ?")
        .bind(public_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_evidencia).transpose()
}

/// Claim an evidence item for upload: UPLOADING, attempts incremented. One
/// claim per sync round or opportunistic attempt; transport retries inside
/// a claim do not bump the counter.
#[instrument(skip_all)]
pub async fn mark_uploading(pool: &Pool, id: i64) -> Result<(), SyncError> {
    sqlx::query(
        "UPDATE evidencias SET estado_upload = 'UPLOADING', \
         upload_attempts = upload_attempts + 1, error_message = NULL WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_uploaded(
    pool: &Pool,
    id: i64,
    cloudinary_public_id: &str,
    cloudinary_url: &str,
) -> Result<(), SyncError> {
    sqlx::query(
        "UPDATE evidencias SET estado_upload = 'UPLOADED', \
         cloudinary_public_id = ?, cloudinary_url = ?, error_message = NULL WHERE id = ?",
    )
    .bind(cloudinary_public_id)
    .bind(cloudinary_url)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_upload_error(pool: &Pool, id: i64, message: &str) -> Result<(), SyncError> {
    sqlx::query("UPDATE evidencias SET estado_upload = 'ERROR', error_message = ? WHERE id = ?")
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Counters surfaced to the UI; operators must always be able to see what is
/// saved locally but not yet centrally.
pub async fn stats(pool: &Pool) -> Result<SyncStats, SyncError> {
    let has_draft = has_draft(pool).await?;
    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM evidencias WHERE estado_upload IN ('PENDING', 'UPLOADING')",
    )
    .fetch_one(pool)
    .await?;
    let errored: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM evidencias WHERE estado_upload = 'ERROR'")
            .fetch_one(pool)
            .await?;
    let queue_len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await?;
    Ok(SyncStats {
        has_draft,
        pending_evidencias: pending,
        error_evidencias: errored,
        queue_len,
    })
}

// ---------------------------------------------------------------------------
// Sync queue (FIFO)
// ---------------------------------------------------------------------------

fn row_to_queue_item(row: &sqlx::sqlite::SqliteRow) -> Result<SyncQueueItem, SyncError> {
    let multimedia_json: String = row.get("multimedia");
    Ok(SyncQueueItem {
        id: row.get("id"),
        situacion_id: row.get("situacion_id"),
        multimedia: serde_json::from_str(&multimedia_json)?,
        retries: row.get::<i64, _>("retries") as u32,
    })
}

/// Enqueue pending work for a situation. If the situation is already queued
/// the entry is merged in place (new refs replace same-slot refs), keeping
/// its FIFO position and retry count.
#[instrument(skip_all)]
pub async fn enqueue_sync(
    pool: &Pool,
    situacion_id: &str,
    refs: &[MultimediaRef],
) -> Result<SyncQueueItem, SyncError> {
    let mut tx = pool.begin().await?;
    let existing = sqlx::query("SELECT * FROM sync_queue WHERE situacion_id = ?")
        .bind(situacion_id)
        .fetch_optional(&mut *tx)
        .await?;

    let item = match existing {
        Some(row) => {
            let mut item = row_to_queue_item(&row)?;
            for nuevo in refs {
                let key = nuevo.slot_key();
                match item.multimedia.iter_mut().find(|m| m.slot_key() == key) {
                    Some(slot) => *slot = nuevo.clone(),
                    None => item.multimedia.push(nuevo.clone()),
                }
            }
            sqlx::query("UPDATE sync_queue SET multimedia = ? WHERE id = ?")
                .bind(serde_json::to_string(&item.multimedia)?)
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
            item
        }
        None => {
            let row = sqlx::query(
                "INSERT INTO sync_queue (situacion_id, multimedia, retries) VALUES (?, ?, 0) \
                 RETURNING *",
            )
            .bind(situacion_id)
            .bind(serde_json::to_string(refs)?)
            .fetch_one(&mut *tx)
            .await?;
            row_to_queue_item(&row)?
        }
    };
    tx.commit().await?;
    info!(situacion = situacion_id, files = item.multimedia.len(), "sync queue updated");
    Ok(item)
}

pub async fn front_queue(pool: &Pool) -> Result<Option<SyncQueueItem>, SyncError> {
    let row = sqlx::query("SELECT * FROM sync_queue ORDER BY id ASC LIMIT 1")
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_queue_item).transpose()
}

/// Settle a queue item at the end of a sync round, merging against the
/// row's current contents inside one transaction. `snapshot` is the ref set
/// the round worked from; `remaining` the subset still unsent. Refs that
/// were enqueued or re-captured while the round was in flight are not in
/// the snapshot (or differ from it) and survive untouched, so a concurrent
/// `enqueue_sync` is never clobbered. Returns true when nothing remains and
/// the row was deleted; otherwise the row keeps its id and FIFO position.
#[instrument(skip_all)]
pub async fn settle_queue_item(
    pool: &Pool,
    id: i64,
    snapshot: &[MultimediaRef],
    remaining: &[MultimediaRef],
    retries: u32,
) -> Result<bool, SyncError> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query("SELECT * FROM sync_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        tx.commit().await?;
        return Ok(true);
    };
    let current = row_to_queue_item(&row)?;

    let mut merged: Vec<MultimediaRef> = Vec::new();
    for cur in current.multimedia {
        match snapshot.iter().find(|s| s.slot_key() == cur.slot_key()) {
            // Slot enqueued during the round: never attempted, keep it.
            None => merged.push(cur),
            // Slot re-captured during the round: the new bytes win.
            Some(snap) if *snap != cur => merged.push(cur),
            Some(_) => {
                if let Some(rem) = remaining.iter().find(|r| r.slot_key() == cur.slot_key()) {
                    merged.push(rem.clone());
                }
            }
        }
    }

    let removed = merged.is_empty();
    if removed {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    } else {
        sqlx::query("UPDATE sync_queue SET multimedia = ?, retries = ? WHERE id = ?")
            .bind(serde_json::to_string(&merged)?)
            .bind(retries as i64)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(removed)
}

#[instrument(skip_all)]
pub async fn remove_queue_item(pool: &Pool, id: i64) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM sync_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn queue_len(pool: &Pool) -> Result<i64, SyncError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
