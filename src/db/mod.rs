//! Persistence module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed entities and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `brigada_sync::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use model::{DraftInfo, Evidencia, NewEvidencia, SyncQueueItem, SyncStats};
pub use repo::*;
