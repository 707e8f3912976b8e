//! Live change propagation for shared document vaults.
//!
//! Raw storage changes flow through an ingest pool, a search-index updater
//! and a per-vault coalescer into a broadcast hub that pushes batched
//! `bulk_update` events to connected viewers. Viewers reconcile those
//! updates into a partially loaded tree.

pub mod cache;
pub mod cmd;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod extract;
pub mod hub;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod types;
pub mod viewer;

pub use error::{Error, Result};
