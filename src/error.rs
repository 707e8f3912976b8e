use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

/// Main error type for vaultsync.
///
/// Most pipeline failures are absorbed where they happen (a dropped event, a
/// retried index commit, an evicted session); this type covers the failures
/// that do surface to a caller: configuration, storage access, transport and
/// lifecycle misuse.
#[derive(Debug, Error)]
pub enum Error {
   /// Shared error (moka).
   #[error(transparent)]
   Shared(#[from] Arc<Self>),

   /// I/O error occurred during file or network operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML serialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::ser::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Search index commit failed.
   #[error("index error: {0}")]
   Index(#[from] IndexError),

   /// Metadata extraction failed.
   #[error("extract error: {0}")]
   Extract(#[from] ExtractError),

   /// Push transport error occurred.
   #[error("transport error: {0}")]
   Transport(#[from] TransportError),

   /// Failed to start or drive the filesystem watcher.
   #[error("watch error: {0}")]
   Watch(#[from] notify::Error),

   /// No pipeline is running for the requested vault.
   #[error("unknown vault: {0}")]
   UnknownVault(String),

   /// The vault pipeline has been shut down and accepts no more events.
   #[error("vault {0} is shut down")]
   VaultClosed(String),

   /// A vault-relative path pointed outside the vault root.
   #[error("path outside vault root: {0}")]
   OutsideVault(String),

   /// A vault root could not be used.
   #[error("invalid vault root: {path}", path = _0.display())]
   InvalidRoot(PathBuf),

   /// The viewer gave up reconnecting.
   #[error("connection failed after {attempts} attempts")]
   ConnectionFailed { attempts: u32 },
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::Shared(inner) => inner.exit_code(),
         Self::Config(_) => 2,
         Self::InvalidRoot(_) | Self::UnknownVault(_) => 3,
         Self::ConnectionFailed { .. } => 10,
         _ => 1,
      }
   }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Config sources could not be merged or parsed.
   #[error("failed to load config: {0}")]
   Load(#[from] Box<figment::Error>),

   /// A value is zero where a positive value is required, or exceeds a cap.
   #[error("invalid config: {0}")]
   Invalid(String),

   /// Failed to retrieve user directories (e.g., home directory).
   #[error("failed to get user directories")]
   GetUserDirectories,
}

impl From<figment::Error> for ConfigError {
   fn from(e: figment::Error) -> Self {
      Self::Load(Box::new(e))
   }
}

impl From<figment::Error> for Error {
   fn from(e: figment::Error) -> Self {
      Self::Config(e.into())
   }
}

/// Errors reported by a search index backend.
#[derive(Debug, Error)]
pub enum IndexError {
   /// The backend rejected or failed the commit.
   #[error("commit of {ops} ops failed: {reason}")]
   Commit { ops: usize, reason: String },
}

/// Errors raised by a metadata extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
   /// The content is not valid UTF-8.
   #[error("{path} is not valid utf-8")]
   NotUtf8 { path: String },

   /// The content exceeds the extractor's size limit.
   #[error("{path} is too large ({size} bytes)")]
   TooLarge { path: String, size: u64 },

   /// The front-matter block is never closed.
   #[error("{path} has unterminated front matter")]
   UnterminatedFrontMatter { path: String },
}

/// Errors on the push channel between hub and viewer.
#[derive(Debug, Error)]
pub enum TransportError {
   /// The stream could not be opened.
   #[error("connect failed: {0}")]
   Connect(String),

   /// The other end has shut down.
   #[error("stream closed: {0}")]
   Closed(String),

   /// A frame could not be parsed as a named event.
   #[error("malformed frame: {0}")]
   Malformed(String),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
