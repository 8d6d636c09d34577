#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Durable, append-only log of client operations.
//!
//! This crate holds the data model shared by every part of the sync engine
//! (operations, vector clocks, log entries, the state cache), the storage
//! contract with its in-memory and SQLite implementations, and the named
//! locks that serialize compaction, upload and download across processes.

pub mod config;
pub mod lock;
pub mod operation;
pub mod store;
pub mod time;
pub mod validate;
pub mod vector_clock;

pub use config::{ConfigError, OpLogConfig};
pub use lock::{
	LockError, LockGuard, LockService, LOCK_DOWNLOAD, LOCK_OP_LOG, LOCK_QUOTA_EXCEEDED, LOCK_UPLOAD,
};
pub use operation::{
	ApplicationStatus, ClientId, EntityChange, MultiEntityPayload, OpSource, OpType, Operation,
	OperationLogEntry, OperationPayload, StateCache, CURRENT_SCHEMA_VERSION,
};
pub use store::{memory::MemoryOpLogStore, sqlite::SqliteOpLogStore, OpLogStore, StoreError};
pub use time::{FakeTimeSource, SystemTimeSource, TimeSource};
pub use validate::{validate_operation, ValidationError, ValidationReport};
pub use vector_clock::{VectorClock, VectorClockComparison};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Lock(#[from] LockError),
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error(transparent)]
	Config(#[from] ConfigError),
}

impl Error {
	/// Whether the underlying failure is the storage backend running out of space.
	#[must_use]
	pub const fn is_quota_exceeded(&self) -> bool {
		matches!(self, Self::Store(StoreError::QuotaExceeded(_)))
	}
}
