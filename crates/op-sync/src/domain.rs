//! Narrow interfaces to the application that owns the synced state.

use sp_op_log::{ClientId, EntityChange, Operation};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("domain collaborator failed: {0}")]
pub struct DomainError(pub String);

/// Produces a snapshot of everything that is synced
#[async_trait]
pub trait StateSnapshotSource: Send + Sync {
	async fn get_all_sync_model_data(&self) -> Result<Value, DomainError>;
}

/// Per-entity changes computed while an action was reduced, keyed by the
/// action's correlation key
#[async_trait]
pub trait CaptureQueue: Send + Sync {
	/// Removes and returns the changes queued for `correlation_key`, empty when
	/// nothing was queued
	async fn dequeue(&self, correlation_key: &str) -> Vec<EntityChange>;
}

/// Bookkeeping kept for the previous sync format
#[async_trait]
pub trait LegacyMetaBridge: Send + Sync {
	async fn load_client_id(&self) -> Result<ClientId, DomainError>;

	async fn increment_vector_clock_for_local_change(
		&self,
		client_id: &ClientId,
	) -> Result<(), DomainError>;
}

/// A batch stopped at its first failing operation; everything before it was
/// applied
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("remote ops applied partially <applied={applied}>: {source}")]
pub struct PartialApplyError {
	pub applied: usize,
	#[source]
	pub source: DomainError,
}

impl From<DomainError> for PartialApplyError {
	fn from(source: DomainError) -> Self {
		Self { applied: 0, source }
	}
}

/// Resolves conflicts and applies remote operations to the application state
#[async_trait]
pub trait RemoteOpsProcessor: Send + Sync {
	/// Applies `ops` in order, stopping at the first one that fails
	async fn process_remote_ops(&self, ops: &[Operation]) -> Result<(), PartialApplyError>;
}

pub trait SyncGate: Send + Sync {
	fn is_online(&self) -> bool;

	/// True while remote operations are being applied to the local state
	fn is_applying_remote_ops(&self) -> bool;
}
