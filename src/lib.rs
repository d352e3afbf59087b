//! Offline-first draft and multimedia synchronization for roadside
//! assistance brigades.
//!
//! Brigade units work along highways where connectivity comes and goes.
//! This crate keeps exactly one situation report draft alive at a time,
//! tracks every captured photo and video as an evidence record with a
//! deterministic remote key, and drains a persisted FIFO queue of pending
//! situations whenever the link returns. Nothing is lost to a dead zone:
//! everything not yet acknowledged by the backend survives restarts in
//! SQLite.
//!
//! The main entry points are:
//! - [`db`] for the draft singleton, evidence records and the sync queue
//! - [`evidence::EvidencePipeline`] for registering captures
//! - [`sync::SyncCoordinator`] for queue draining and retry policy
//! - [`net::ConnectivityMonitor`] for feeding reachability transitions
//! - [`upload::BackendClient`] for the production REST + object-storage
//!   transport

pub mod config;
pub mod db;
pub mod error;
pub mod evidence;
pub mod model;
pub mod net;
pub mod sync;
pub mod telemetry;
pub mod upload;

pub use error::{Result, SyncError};
