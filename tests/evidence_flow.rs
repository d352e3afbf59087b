//! Evidence capture pipeline behavior against a recording backend.

mod common;

use brigada_sync::db;
use brigada_sync::evidence::{CaptureMeta, EvidencePipeline};
use brigada_sync::model::UploadStatus;
use brigada_sync::net::ConnectivityMonitor;
use brigada_sync::SyncError;
use common::{foto_ref, make_draft, setup_pool, video_ref, RecordingBackend};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const SID: &str = "20260121-1-030-70-86-50-4";

#[tokio::test]
async fn offline_capture_stays_pending() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    let net = ConnectivityMonitor::new(false);
    let pipeline = EvidencePipeline::new(pool.clone(), backend.clone(), net);

    let ev = pipeline
        .process_media(SID, foto_ref(1, "file:///dcim/a.jpg"), CaptureMeta::default())
        .await
        .unwrap();

    assert_eq!(ev.estado_upload, UploadStatus::Pending);
    assert_eq!(ev.public_id, format!("{SID}_I1_F1"));
    assert!(backend.sign_calls.lock().unwrap().is_empty());
    assert!(backend.uploaded_public_ids().is_empty());
}

#[tokio::test]
async fn online_capture_uploads_immediately() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    let net = ConnectivityMonitor::new(true);
    let pipeline = EvidencePipeline::new(pool.clone(), backend.clone(), net);

    let ev = pipeline
        .process_media(SID, video_ref("file:///dcim/clip.mp4"), CaptureMeta::default())
        .await
        .unwrap();

    assert_eq!(ev.estado_upload, UploadStatus::Uploaded);
    assert_eq!(ev.upload_attempts, 1);
    assert_eq!(
        ev.cloudinary_url.as_deref(),
        Some(format!("https://cdn.test/{SID}_I1_V").as_str())
    );
    assert_eq!(backend.uploaded_public_ids(), vec![format!("{SID}_I1_V")]);
}

#[tokio::test]
async fn capture_defers_without_signing_service() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    backend.configured.store(false, Ordering::SeqCst);
    let net = ConnectivityMonitor::new(true);
    let pipeline = EvidencePipeline::new(pool.clone(), backend.clone(), net);

    let ev = pipeline
        .process_media(SID, foto_ref(2, "file:///dcim/b.jpg"), CaptureMeta::default())
        .await
        .unwrap();

    assert_eq!(ev.estado_upload, UploadStatus::Pending);
    assert!(backend.uploaded_public_ids().is_empty());
}

#[tokio::test]
async fn failed_opportunistic_upload_is_absorbed() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    backend.script_upload_failures(1);
    let net = ConnectivityMonitor::new(true);
    let pipeline = EvidencePipeline::new(pool.clone(), backend.clone(), net);

    // Capture itself must succeed even though the upload attempt fails.
    let ev = pipeline
        .process_media(SID, foto_ref(1, "file:///dcim/a.jpg"), CaptureMeta::default())
        .await
        .unwrap();

    assert_eq!(ev.estado_upload, UploadStatus::Error);
    assert_eq!(ev.error_message.as_deref(), Some("scripted network error"));
}

#[tokio::test]
async fn recapture_replaces_slot_and_resets_state() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    let net = ConnectivityMonitor::new(false);
    let pipeline = EvidencePipeline::new(pool.clone(), backend.clone(), net);

    let first = pipeline
        .process_media(SID, foto_ref(1, "file:///dcim/a.jpg"), CaptureMeta::default())
        .await
        .unwrap();
    let second = pipeline
        .process_media(SID, foto_ref(1, "file:///dcim/a-retake.jpg"), CaptureMeta::default())
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.public_id, first.public_id);
    assert_eq!(second.local_uri, "file:///dcim/a-retake.jpg");
    assert_eq!(second.estado_upload, UploadStatus::Pending);
    assert_eq!(db::list_evidencias(&pool, SID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn second_video_replaces_not_appends() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    let net = ConnectivityMonitor::new(false);
    let pipeline = EvidencePipeline::new(pool.clone(), backend, net);

    let first = pipeline
        .process_media(SID, video_ref("file:///dcim/clip1.mp4"), CaptureMeta::default())
        .await
        .unwrap();
    let second = pipeline
        .process_media(SID, video_ref("file:///dcim/clip2.mp4"), CaptureMeta::default())
        .await
        .unwrap();

    // One video slot per context: same row, same key, new bytes.
    assert_eq!(second.id, first.id);
    assert_eq!(second.public_id, format!("{SID}_I1_V"));
    assert_eq!(second.local_uri, "file:///dcim/clip2.mp4");
    assert_eq!(db::list_evidencias(&pool, SID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_photo_slot_is_rejected_before_mutation() {
    let pool = setup_pool().await;
    let backend = Arc::new(RecordingBackend::default());
    let net = ConnectivityMonitor::new(false);
    let pipeline = EvidencePipeline::new(pool.clone(), backend, net);

    let err = pipeline
        .process_media(SID, foto_ref(4, "file:///dcim/d.jpg"), CaptureMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidSlot(4)));
    assert!(db::list_evidencias(&pool, SID).await.unwrap().is_empty());
}

#[tokio::test]
async fn capture_mirrors_into_active_draft() {
    let pool = setup_pool().await;
    db::save_draft(&pool, &make_draft(SID)).await.unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let net = ConnectivityMonitor::new(false);
    let pipeline = EvidencePipeline::new(pool.clone(), backend, net);

    pipeline
        .process_media(SID, foto_ref(1, "file:///dcim/a.jpg"), CaptureMeta::default())
        .await
        .unwrap();
    pipeline
        .process_media(SID, video_ref("file:///dcim/clip.mp4"), CaptureMeta::default())
        .await
        .unwrap();
    // A capture for some other situation must not leak into the draft.
    pipeline
        .process_media("otra-situacion_I1", foto_ref(1, "file:///dcim/x.jpg"), CaptureMeta::default())
        .await
        .unwrap();

    let draft = db::get_draft(&pool).await.unwrap().unwrap();
    assert_eq!(draft.multimedia.len(), 2);
    assert_eq!(draft.multimedia[0].uri, "file:///dcim/a.jpg");
}
