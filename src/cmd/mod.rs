//! CLI command implementations for vaultsync.

pub mod config;
pub mod watch;
