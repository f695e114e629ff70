//! fimguard-core: storage, crypto and classification for the fimguard
//! file-integrity monitor.
//!
//! # Modules
//! - `hasher`: streaming BLAKE3 digests with bounded retry
//! - `record_store`: sealed path → digest records and reconciliation
//! - `audit_log`: sealed, rotating JSON Lines audit log
//! - `severity`: event kinds and the severity classifier
//! - `safe_mode`: persisted safe mode state (fails closed)
//! - `snapshot`: write-once incident snapshots
//! - `crypto`: HMAC-SHA256 tags and the sealed file framing
//! - `lock`: one owning process per data directory

pub mod atomic;
pub mod audit_log;
pub mod config;
pub mod counters;
pub mod crypto;
pub mod error;
pub mod hasher;
pub mod lock;
pub mod paths;
pub mod record_store;
pub mod safe_mode;
pub mod severity;
pub mod snapshot;

pub use config::{Config, WatchMode};
pub use error::{GuardError, Result, TamperTarget};
pub use severity::{EventKind, Severity};
