//! Storage contract of the operation log
//!
//! Stores assign `seq`, persist entries, the single [`StateCache`], the
//! current vector clock and the compaction counter. They never lock: every
//! mutating call is made by a caller already holding the right named lock.

use crate::{
	operation::{OpSource, Operation, OperationLogEntry, StateCache},
	vector_clock::VectorClock,
};

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("storage quota exceeded: {0}")]
	QuotaExceeded(String),
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("failed to (de)serialize stored data: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("corrupted log entry <seq={seq}>: {reason}")]
	Corrupted { seq: u64, reason: String },
	#[error("failed to prepare storage: {0}")]
	Io(#[from] std::io::Error),
}

impl StoreError {
	#[must_use]
	pub const fn is_quota_exceeded(&self) -> bool {
		matches!(self, Self::QuotaExceeded(_))
	}
}

/// Conjunction of conditions selecting log entries for deletion
///
/// Unset conditions match every entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFilter {
	pub synced_only: bool,
	pub applied_before: Option<i64>,
	pub max_seq: Option<u64>,
}

impl EntryFilter {
	#[must_use]
	pub fn matches(&self, entry: &OperationLogEntry) -> bool {
		(!self.synced_only || entry.synced_at.is_some())
			&& self
				.applied_before
				.map_or(true, |cutoff| entry.applied_at < cutoff)
			&& self.max_seq.map_or(true, |max| entry.seq <= max)
	}
}

#[async_trait]
pub trait OpLogStore: Send + Sync {
	/// Appends one entry and returns its store-assigned `seq`.
	///
	/// Remote entries are recorded as already synced.
	async fn append(&self, op: &Operation, source: OpSource) -> Result<u64, StoreError>;

	/// Appends a local entry and stores its vector clock as the current clock
	/// in one atomic step.
	async fn append_with_vector_clock_update(&self, op: &Operation) -> Result<u64, StoreError>;

	/// Atomically appends several entries, skipping ids already present.
	async fn append_batch(
		&self,
		ops: &[Operation],
		source: OpSource,
	) -> Result<Vec<u64>, StoreError>;

	/// Records remote operations before they are handed to the application,
	/// with [`crate::operation::ApplicationStatus::Pending`]. Ids already present are skipped.
	async fn append_pending_remote(&self, ops: &[Operation]) -> Result<Vec<u64>, StoreError>;

	/// Moves pending or failed remote entries to applied
	async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StoreError>;

	/// Counts a failed application attempt. Entries reaching `max_retries`
	/// are rejected for good instead.
	async fn mark_failed(&self, op_ids: &[Uuid], max_retries: Option<u32>)
		-> Result<(), StoreError>;

	/// Remote entries recorded but never handed over, in `seq` order
	async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError>;

	/// Remote entries that failed to apply and are not rejected, in `seq` order
	async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError>;

	/// Entries neither synced nor rejected, in `seq` order
	async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StoreError>;

	async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StoreError>;

	/// Pending or failed remote entries are taken out of the retry queue too
	async fn mark_rejected(&self, op_ids: &[Uuid]) -> Result<(), StoreError>;

	async fn get_applied_op_ids(&self) -> Result<HashSet<Uuid>, StoreError>;

	async fn get_op_by_id(&self, id: Uuid) -> Result<Option<OperationLogEntry>, StoreError>;

	/// Highest `seq` ever assigned, 0 for an empty log
	async fn get_last_seq(&self) -> Result<u64, StoreError>;

	async fn count(&self) -> Result<u64, StoreError>;

	async fn has_synced_ops(&self) -> Result<bool, StoreError>;

	async fn get_vector_clock(&self) -> Result<VectorClock, StoreError>;

	async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StoreError>;

	/// Folds the clocks of received operations into the current clock
	async fn merge_remote_op_clocks(&self, ops: &[Operation]) -> Result<(), StoreError>;

	async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StoreError>;

	async fn load_state_cache(&self) -> Result<Option<StateCache>, StoreError>;

	async fn get_compaction_counter(&self) -> Result<u64, StoreError>;

	/// Returns the counter after incrementing it
	async fn increment_compaction_counter(&self) -> Result<u64, StoreError>;

	async fn reset_compaction_counter(&self) -> Result<(), StoreError>;

	/// Returns how many entries were deleted
	async fn delete_ops_where(&self, filter: &EntryFilter) -> Result<u64, StoreError>;
}
