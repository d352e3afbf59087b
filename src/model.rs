//! Domain model: situation drafts, evidence records and their state machines.
//!
//! Status fields are closed enums with explicit transition validation; the
//! string forms stored on disk and sent over the wire are the uppercase
//! Spanish operational vocabulary used by the backend.

use crate::error::SyncError;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported situation report types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TipoSituacion {
    Patrullaje,
    HechoTransito,
    AsistenciaVehicular,
    Emergencia,
    RegulacionTrafico,
    ParadaEstrategica,
    CambioRuta,
    Comida,
    Descanso,
    Otros,
}

/// Draft lifecycle states. Successful submission deletes the draft; deletion
/// is the implicit terminal state and is not stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    Draft,
    Pendiente,
    Enviando,
    Conflicto,
    WaitCop,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "DRAFT",
            DraftStatus::Pendiente => "PENDIENTE",
            DraftStatus::Enviando => "ENVIANDO",
            DraftStatus::Conflicto => "CONFLICTO",
            DraftStatus::WaitCop => "WAIT_COP",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(DraftStatus::Draft),
            "PENDIENTE" => Some(DraftStatus::Pendiente),
            "ENVIANDO" => Some(DraftStatus::Enviando),
            "CONFLICTO" => Some(DraftStatus::Conflicto),
            "WAIT_COP" => Some(DraftStatus::WaitCop),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal edge of the draft state machine.
    ///
    /// CONFLICTO -> PENDIENTE is a legal edge but only through the explicit
    /// resolution path; a bare status write must go through
    /// `resolve_conflict` instead.
    pub fn can_transition(&self, to: DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (self, to),
            (Draft, Pendiente)
                | (Pendiente, Enviando)
                | (Enviando, Conflicto)
                | (Conflicto, Pendiente)
                | (Conflicto, WaitCop)
                | (WaitCop, Pendiente)
        )
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TipoMultimedia {
    Foto,
    Video,
}

impl TipoMultimedia {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipoMultimedia::Foto => "FOTO",
            TipoMultimedia::Video => "VIDEO",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "FOTO" => Some(TipoMultimedia::Foto),
            "VIDEO" => Some(TipoMultimedia::Video),
            _ => None,
        }
    }

    /// Resource type expected by the signing endpoint.
    pub fn resource_type(&self) -> &'static str {
        match self {
            TipoMultimedia::Foto => "image",
            TipoMultimedia::Video => "video",
        }
    }
}

/// Per-evidence upload state, independent of the draft state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Error,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Uploaded => "UPLOADED",
            UploadStatus::Error => "ERROR",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(UploadStatus::Pending),
            "UPLOADING" => Some(UploadStatus::Uploading),
            "UPLOADED" => Some(UploadStatus::Uploaded),
            "ERROR" => Some(UploadStatus::Error),
            _ => None,
        }
    }
}

/// Reference to a captured photo or video, embedded in the draft. The bytes
/// stay in the OS media store; this holds the local URI plus slot identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultimediaRef {
    pub tipo: TipoMultimedia,
    /// 1..=3 for photos, absent for the single video slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orden: Option<u8>,
    #[serde(default = "default_infografia")]
    pub infografia_numero: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infografia_titulo: Option<String>,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitud: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitud: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duracion_segundos: Option<u32>,
}

fn default_infografia() -> u32 {
    1
}

impl MultimediaRef {
    /// Slot identity: two refs with the same key occupy the same slot and
    /// the later one replaces the earlier.
    pub fn slot_key(&self) -> (u32, TipoMultimedia, u8) {
        (self.infografia_numero, self.tipo, self.orden.unwrap_or(0))
    }
}

/// One field-level divergence reported by the server on a 409.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDiff {
    pub campo: String,
    pub local: serde_json::Value,
    pub servidor: serde_json::Value,
}

/// Conflict payload attached to a draft in CONFLICTO / WAIT_COP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflicto {
    pub datos_servidor: serde_json::Value,
    pub diferencias: Vec<FieldDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicto_id: Option<i64>,
}

/// The single in-flight situation report. Scalar context fields are typed;
/// type-specific form payload (vehicles, people, authorities, weather, ...)
/// rides along as opaque JSON so this subsystem never has to understand it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftSituacion {
    /// Deterministic composite id: YYYYMMDD-SEDE-UNIDAD-TIPO-RUTA-KM-NUM.
    pub id: String,
    pub num_situacion_salida: u32,
    pub fecha: NaiveDate,
    pub sede_id: i64,
    pub unidad_id: i64,
    pub unidad_codigo: String,
    pub salida_id: i64,

    pub tipo_situacion: TipoSituacion,
    pub tipo_situacion_id: i64,

    pub ruta_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ruta_nombre: Option<String>,
    pub km: f64,
    pub sentido: String,
    pub latitud: f64,
    pub longitud: f64,
    #[serde(default)]
    pub ubicacion_manual: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub descripcion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observaciones: Option<String>,

    #[serde(default)]
    pub multimedia: Vec<MultimediaRef>,

    pub estado: DraftStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicto: Option<Conflicto>,

    /// Type-specific form fields, carried verbatim.
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// Inputs for the deterministic situation id.
#[derive(Debug, Clone, PartialEq)]
pub struct SituacionIdParams {
    pub fecha: NaiveDate,
    pub sede_id: i64,
    /// Unit code kept verbatim, no padding: "030", "1131", "M007".
    pub unidad_codigo: String,
    pub tipo_situacion_id: i64,
    pub ruta_id: i64,
    pub km: f64,
    /// Sequence within this salida, not within the day.
    pub num_situacion_salida: u32,
}

/// Generate the deterministic situation id. Pure function: identical inputs
/// always yield the identical id, which is what makes duplicate detection
/// and idempotent re-submission work. No padding on any field; km keeps only
/// its integer part.
pub fn generate_situacion_id(p: &SituacionIdParams) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}-{}",
        p.fecha.format("%Y%m%d"),
        p.sede_id,
        p.unidad_codigo,
        p.tipo_situacion_id,
        p.ruta_id,
        p.km.floor() as i64,
        p.num_situacion_salida
    )
}

static SITUACION_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{8})-(\d+)-([A-Z]?\d+)-(\d+)-(\d+)-(\d+)-(\d+)$").expect("valid id regex")
});

pub fn is_valid_situacion_id(id: &str) -> bool {
    SITUACION_ID_RE.is_match(id)
}

/// Parse a situation id back into its components. Returns `None` for ids
/// that do not match the composite format.
pub fn parse_situacion_id(id: &str) -> Option<SituacionIdParams> {
    let caps = SITUACION_ID_RE.captures(id)?;
    let fecha = NaiveDate::parse_from_str(&caps[1], "%Y%m%d").ok()?;
    Some(SituacionIdParams {
        fecha,
        sede_id: caps[2].parse().ok()?,
        unidad_codigo: caps[3].to_string(),
        tipo_situacion_id: caps[4].parse().ok()?,
        ruta_id: caps[5].parse().ok()?,
        km: caps[6].parse::<i64>().ok()? as f64,
        num_situacion_salida: caps[7].parse().ok()?,
    })
}

/// Deterministic remote object key for an evidence slot:
/// `{situacionId}_I{infografia}_F{orden}` for photos,
/// `{situacionId}_I{infografia}_V` for the video. The same logical slot
/// always maps to the same key, so a retried upload overwrites instead of
/// duplicating.
pub fn generate_public_id(
    situacion_id: &str,
    infografia_numero: u32,
    tipo: TipoMultimedia,
    orden: Option<u8>,
) -> Result<String, SyncError> {
    match tipo {
        TipoMultimedia::Foto => {
            let orden = orden.unwrap_or(0);
            if !(1..=3).contains(&orden) {
                return Err(SyncError::InvalidSlot(orden));
            }
            Ok(format!("{situacion_id}_I{infografia_numero}_F{orden}"))
        }
        TipoMultimedia::Video => Ok(format!("{situacion_id}_I{infografia_numero}_V")),
    }
}

static PUBLIC_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)_I(\d+)_(?:F([1-3])|V)$").expect("valid public id regex"));

static EXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(?i:jpg|jpeg|png|mp4|mov)$").expect("valid ext regex"));

/// Components recovered from a deterministic public id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPublicId {
    pub situacion_id: String,
    pub infografia_numero: u32,
    pub tipo: TipoMultimedia,
    pub orden: Option<u8>,
}

pub fn parse_public_id(name: &str) -> Option<ParsedPublicId> {
    // Tolerate a trailing file extension.
    let bare = EXT_RE.replace(name, "");
    let caps = PUBLIC_ID_RE.captures(&bare)?;
    let orden = caps.get(3).and_then(|m| m.as_str().parse::<u8>().ok());
    Some(ParsedPublicId {
        situacion_id: caps[1].to_string(),
        infografia_numero: caps[2].parse().ok()?,
        tipo: if orden.is_some() {
            TipoMultimedia::Foto
        } else {
            TipoMultimedia::Video
        },
        orden,
    })
}
