//! Error taxonomy for the offline sync subsystem.
//!
//! Validation and storage errors propagate synchronously to the caller;
//! transport failures are captured into per-item upload state and never
//! surface as panics or aborts of a drain cycle.

use crate::model::DraftStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local storage I/O failed. Fatal to the attempted operation; the UI
    /// layer decides whether to alert the user. Not retried at this layer.
    #[error("local storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored record no longer parses (unknown enum string, bad JSON).
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A different draft is already active and not yet terminal.
    #[error("a draft is already active: {existing}")]
    ConflictingDraft { existing: String },

    #[error("no active draft")]
    NoDraft,

    /// Photo slot outside the fixed 3-photo layout.
    #[error("photo slot must be between 1 and 3, got {0}")]
    InvalidSlot(u8),

    #[error("invalid draft transition {from} -> {to}")]
    InvalidTransition { from: DraftStatus, to: DraftStatus },

    /// Leaving CONFLICTO requires an explicit resolution outcome; a bare
    /// status write back to PENDIENTE is rejected.
    #[error("conflict resolution outcome required before returning to PENDIENTE")]
    ResolutionRequired,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
