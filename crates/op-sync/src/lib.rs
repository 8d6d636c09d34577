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

//! Replication of the operation log.
//!
//! Local writes enter through [`capture::OperationWriter`], leave through the
//! [`upload::UploadService`] (immediately via
//! [`immediate_upload::ImmediateUploadService`] or on the next full sync run by
//! the [`orchestrator::SyncOrchestrator`]) and remote operations come back in
//! through the [`download::DownloadService`]. The
//! [`compaction::CompactionService`] keeps the local log bounded.

use sp_op_log::{LockError, StoreError, ValidationError};

pub mod capture;
pub mod compaction;
pub mod context;
pub mod domain;
pub mod download;
pub mod encryption;
pub mod immediate_upload;
pub mod logging;
pub mod manifest;
pub mod notify;
pub mod orchestrator;
pub mod provider;
pub mod upload;

pub use context::{ClientIdCache, SyncContext};
pub use notify::{BroadcastNotifier, Notice, Notifier};
pub use provider::{FileSyncProvider, OperationSyncProvider, ProviderError, SyncProvider};

use domain::{DomainError, PartialApplyError};
use encryption::EncryptionError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Lock(#[from] LockError),
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error(transparent)]
	Provider(#[from] ProviderError),
	#[error(transparent)]
	Encryption(#[from] EncryptionError),
	#[error(transparent)]
	Domain(#[from] DomainError),
	#[error(transparent)]
	RemoteApply(#[from] PartialApplyError),
	#[error("failed to (de)serialize sync data: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("encrypted operations received but no encryption password is configured")]
	EncryptionPasswordRequired,
}

impl Error {
	#[must_use]
	pub const fn is_quota_exceeded(&self) -> bool {
		matches!(self, Self::Store(StoreError::QuotaExceeded(_)))
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
