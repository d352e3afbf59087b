//! Shared test fixtures: an in-memory pool and a recording backend mock.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use brigada_sync::db::Pool;
use brigada_sync::model::{
    DraftSituacion, DraftStatus, MultimediaRef, TipoMultimedia, TipoSituacion,
};
use brigada_sync::upload::{
    ArchivoRef, ConflictoResponse, PushError, RemoteMediaService, SignRequest, SignedUploadParams,
    UploadResult,
};
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub async fn setup_pool() -> Pool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn make_draft(id: &str) -> DraftSituacion {
    DraftSituacion {
        id: id.to_string(),
        num_situacion_salida: 4,
        fecha: NaiveDate::from_ymd_opt(2026, 1, 21).unwrap(),
        sede_id: 1,
        unidad_id: 30,
        unidad_codigo: "030".into(),
        salida_id: 12,
        tipo_situacion: TipoSituacion::AsistenciaVehicular,
        tipo_situacion_id: 70,
        ruta_id: 86,
        ruta_nombre: None,
        km: 50.0,
        sentido: "NORTE".into(),
        latitud: 14.6,
        longitud: -90.5,
        ubicacion_manual: false,
        descripcion: None,
        observaciones: None,
        multimedia: vec![],
        estado: DraftStatus::Draft,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        conflicto: None,
        extras: serde_json::Map::new(),
    }
}

pub fn foto_ref(orden: u8, uri: &str) -> MultimediaRef {
    MultimediaRef {
        tipo: TipoMultimedia::Foto,
        orden: Some(orden),
        infografia_numero: 1,
        infografia_titulo: None,
        uri: uri.to_string(),
        latitud: None,
        longitud: None,
        duracion_segundos: None,
    }
}

pub fn video_ref(uri: &str) -> MultimediaRef {
    MultimediaRef {
        tipo: TipoMultimedia::Video,
        orden: None,
        infografia_numero: 1,
        infografia_titulo: None,
        uri: uri.to_string(),
        latitud: None,
        longitud: None,
        duracion_segundos: Some(12),
    }
}

/// Scripted outcome for one batch-reference call.
pub enum PushScript {
    Ok,
    Conflict(ConflictoResponse),
    Transport,
}

/// Records every remote interaction and replays scripted outcomes; defaults
/// to success when the scripts run out.
pub struct RecordingBackend {
    pub configured: AtomicBool,
    pub sign_calls: Mutex<Vec<String>>,
    pub upload_calls: Mutex<Vec<String>>,
    pub upload_scripts: Mutex<VecDeque<UploadResult>>,
    pub batches: Mutex<Vec<(String, Vec<ArchivoRef>)>>,
    pub push_scripts: Mutex<VecDeque<PushScript>>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self {
            configured: AtomicBool::new(true),
            sign_calls: Mutex::new(vec![]),
            upload_calls: Mutex::new(vec![]),
            upload_scripts: Mutex::new(VecDeque::new()),
            batches: Mutex::new(vec![]),
            push_scripts: Mutex::new(VecDeque::new()),
        }
    }
}

impl RecordingBackend {
    pub fn script_upload_failures(&self, n: usize) {
        let mut scripts = self.upload_scripts.lock().unwrap();
        for _ in 0..n {
            scripts.push_back(UploadResult::fail("scripted network error"));
        }
    }

    pub fn script_upload_success(&self) {
        let mut scripts = self.upload_scripts.lock().unwrap();
        scripts.push_back(UploadResult {
            success: true,
            ..Default::default()
        });
    }

    pub fn script_push(&self, script: PushScript) {
        self.push_scripts.lock().unwrap().push_back(script);
    }

    pub fn uploaded_public_ids(&self) -> Vec<String> {
        self.upload_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteMediaService for RecordingBackend {
    async fn check_status(&self) -> anyhow::Result<bool> {
        Ok(self.configured.load(Ordering::SeqCst))
    }

    async fn sign_upload(&self, req: &SignRequest) -> anyhow::Result<SignedUploadParams> {
        let public_id = req.public_id.clone().unwrap_or_default();
        self.sign_calls.lock().unwrap().push(public_id.clone());
        Ok(SignedUploadParams {
            signature: "sig".into(),
            timestamp: 1_700_000_000,
            api_key: "key".into(),
            cloud_name: "demo".into(),
            folder: "situaciones".into(),
            public_id,
            upload_url: "https://upload.test/auto".into(),
        })
    }

    async fn upload_to_remote(
        &self,
        _local_uri: &str,
        params: &SignedUploadParams,
        _tipo: TipoMultimedia,
    ) -> UploadResult {
        self.upload_calls
            .lock()
            .unwrap()
            .push(params.public_id.clone());
        let scripted = self.upload_scripts.lock().unwrap().pop_front();
        match scripted {
            Some(mut result) => {
                if result.success && result.public_id.is_none() {
                    result.public_id = Some(params.public_id.clone());
                    result.secure_url = Some(format!("https://cdn.test/{}", params.public_id));
                }
                result
            }
            None => UploadResult {
                success: true,
                public_id: Some(params.public_id.clone()),
                secure_url: Some(format!("https://cdn.test/{}", params.public_id)),
                ..Default::default()
            },
        }
    }

    async fn push_batch_references(
        &self,
        situacion_id: &str,
        archivos: &[ArchivoRef],
    ) -> Result<(), PushError> {
        self.batches
            .lock()
            .unwrap()
            .push((situacion_id.to_string(), archivos.to_vec()));
        match self.push_scripts.lock().unwrap().pop_front() {
            None | Some(PushScript::Ok) => Ok(()),
            Some(PushScript::Conflict(c)) => Err(PushError::Conflict(c)),
            Some(PushScript::Transport) => {
                Err(PushError::Transport(anyhow::anyhow!("scripted outage")))
            }
        }
    }
}
