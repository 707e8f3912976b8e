//! Configuration for pipeline tuning, session backpressure and viewer
//! reconnects.
//!
//! Values are layered with figment: built-in defaults, then the global
//! `~/.vaultsync/config.toml`, then a vault-root `.vaultsync.toml`, then
//! `VAULTSYNC_*` environment variables. The resulting [`Config`] is handed to
//! each component at construction; nothing reads configuration globally.

use std::{
   fs,
   path::{Path, PathBuf},
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const MAX_INGEST_WORKERS_CAP: usize = 256;
pub const MAX_INGEST_QUEUE_CAP: usize = 1_000_000;
pub const MAX_DELTAS_PER_MESSAGE_CAP: usize = 10_000;
pub const MAX_SESSION_QUEUE_CAP: usize = 4096;
pub const MAX_CACHE_CAPACITY_CAP: u64 = 10_000_000;

/// Tunables for every stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub ingest_workers:        usize,
   pub ingest_queue_capacity: usize,

   pub index_batch_size:    usize,
   pub index_flush_ms:      u64,
   pub index_retry_base_ms: u64,
   pub index_retry_max_ms:  u64,

   pub coalesce_max_pending:   usize,
   pub coalesce_window_ms:     u64,
   pub coalesce_hard_cap_ms:   u64,
   pub max_deltas_per_message: usize,

   pub session_queue_depth:      usize,
   pub session_write_timeout_ms: u64,
   pub session_max_timeouts:     u32,
   pub ping_interval_secs:       u64,

   pub cache_ttl_secs: u64,
   pub cache_capacity: u64,

   pub reconnect_max_attempts: u32,
   pub reconnect_delay_ms:     u64,

   pub max_extract_bytes: u64,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         ingest_workers: 10,
         ingest_queue_capacity: 1000,
         index_batch_size: 50,
         index_flush_ms: 500,
         index_retry_base_ms: 250,
         index_retry_max_ms: 10_000,
         coalesce_max_pending: 5,
         coalesce_window_ms: 1000,
         coalesce_hard_cap_ms: 5000,
         max_deltas_per_message: 100,
         session_queue_depth: 10,
         session_write_timeout_ms: 100,
         session_max_timeouts: 1,
         ping_interval_secs: 30,
         cache_ttl_secs: 300,
         cache_capacity: 1000,
         reconnect_max_attempts: 5,
         reconnect_delay_ms: 3000,
         max_extract_bytes: 8 * 1024 * 1024,
      }
   }
}

impl Config {
   /// Loads defaults, the global config file and the environment.
   pub fn load() -> Result<Self> {
      Self::load_with_root(None)
   }

   /// Like [`Config::load`], additionally merging `<root>/.vaultsync.toml`.
   pub fn load_with_root(root: Option<&Path>) -> Result<Self> {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));

      if let Some(path) = global_config_path() {
         figment = figment.merge(Toml::file(path));
      }
      if let Some(root) = root {
         let repo_path = root_config_path(root);
         if repo_path.exists() {
            figment = figment.merge(Toml::file(repo_path));
         }
      }

      Self::extract(figment.merge(Env::prefixed("VAULTSYNC_").lowercase(true)))
   }

   /// Loads from a single TOML file layered over the defaults.
   pub fn from_file(path: &Path) -> Result<Self> {
      Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path)))
   }

   fn extract(figment: Figment) -> Result<Self> {
      let cfg: Self = figment.extract().map_err(ConfigError::from)?;
      cfg.validate()?;
      Ok(cfg)
   }

   /// Rejects values that would stall or unbound the pipeline.
   pub fn validate(&self) -> Result<()> {
      let positive: [(&str, u64); 12] = [
         ("ingest_workers", self.ingest_workers as u64),
         ("ingest_queue_capacity", self.ingest_queue_capacity as u64),
         ("index_batch_size", self.index_batch_size as u64),
         ("index_flush_ms", self.index_flush_ms),
         ("coalesce_max_pending", self.coalesce_max_pending as u64),
         ("coalesce_window_ms", self.coalesce_window_ms),
         ("max_deltas_per_message", self.max_deltas_per_message as u64),
         ("session_queue_depth", self.session_queue_depth as u64),
         ("session_write_timeout_ms", self.session_write_timeout_ms),
         ("session_max_timeouts", self.session_max_timeouts as u64),
         ("ping_interval_secs", self.ping_interval_secs),
         ("cache_capacity", self.cache_capacity),
      ];
      for (name, value) in positive {
         if value == 0 {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")).into());
         }
      }

      let capped: [(&str, u64, u64); 5] = [
         ("ingest_workers", self.ingest_workers as u64, MAX_INGEST_WORKERS_CAP as u64),
         (
            "ingest_queue_capacity",
            self.ingest_queue_capacity as u64,
            MAX_INGEST_QUEUE_CAP as u64,
         ),
         (
            "max_deltas_per_message",
            self.max_deltas_per_message as u64,
            MAX_DELTAS_PER_MESSAGE_CAP as u64,
         ),
         ("session_queue_depth", self.session_queue_depth as u64, MAX_SESSION_QUEUE_CAP as u64),
         ("cache_capacity", self.cache_capacity, MAX_CACHE_CAPACITY_CAP),
      ];
      for (name, value, cap) in capped {
         if value > cap {
            return Err(
               ConfigError::Invalid(format!("{name} {value} exceeds hard cap {cap}")).into(),
            );
         }
      }

      if self.coalesce_hard_cap_ms < self.coalesce_window_ms {
         return Err(
            ConfigError::Invalid(format!(
               "coalesce_hard_cap_ms {} is below coalesce_window_ms {}",
               self.coalesce_hard_cap_ms, self.coalesce_window_ms
            ))
            .into(),
         );
      }
      Ok(())
   }

   pub const fn index_flush_interval(&self) -> Duration {
      Duration::from_millis(self.index_flush_ms)
   }

   pub const fn coalesce_window(&self) -> Duration {
      Duration::from_millis(self.coalesce_window_ms)
   }

   pub const fn coalesce_hard_cap(&self) -> Duration {
      Duration::from_millis(self.coalesce_hard_cap_ms)
   }

   pub const fn session_write_timeout(&self) -> Duration {
      Duration::from_millis(self.session_write_timeout_ms)
   }

   pub const fn ping_interval(&self) -> Duration {
      Duration::from_secs(self.ping_interval_secs)
   }

   pub const fn cache_ttl(&self) -> Duration {
      Duration::from_secs(self.cache_ttl_secs)
   }

   pub const fn reconnect_delay(&self) -> Duration {
      Duration::from_millis(self.reconnect_delay_ms)
   }

   /// Backoff before retrying an index commit after `failures` consecutive
   /// failures: base doubled per failure, capped.
   pub fn index_retry_backoff(&self, failures: u32) -> Duration {
      let shift = failures.saturating_sub(1).min(16);
      let ms = self
         .index_retry_base_ms
         .saturating_mul(1u64 << shift)
         .min(self.index_retry_max_ms);
      Duration::from_millis(ms)
   }
}

/// Returns the base directory for vaultsync configuration.
pub fn base_dir() -> Option<PathBuf> {
   BaseDirs::new()
      .map(|d| d.home_dir().join(".vaultsync"))
      .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".vaultsync")))
}

fn global_config_path() -> Option<PathBuf> {
   base_dir()
      .map(|dir| dir.join("config.toml"))
      .filter(|p| p.exists())
}

pub fn root_config_path(root: &Path) -> PathBuf {
   root.join(".vaultsync.toml")
}

/// Writes the defaults to the global config path if nothing is there yet.
pub fn ensure_global_config() -> Result<PathBuf> {
   let dir = base_dir().ok_or(ConfigError::GetUserDirectories)?;
   let path = dir.join("config.toml");
   if !path.exists() {
      fs::create_dir_all(&dir)?;
      fs::write(&path, toml::to_string_pretty(&Config::default())?)?;
   }
   Ok(path)
}
