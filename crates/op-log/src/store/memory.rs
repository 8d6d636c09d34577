use super::{EntryFilter, OpLogStore, StoreError};
use crate::{
	operation::{ApplicationStatus, OpSource, Operation, OperationLogEntry, StateCache},
	time::{SystemTimeSource, TimeSource},
	vector_clock::VectorClock,
};

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
	entries: BTreeMap<u64, OperationLogEntry>,
	seq_by_id: HashMap<Uuid, u64>,
	last_seq: u64,
	state_cache: Option<StateCache>,
	vector_clock: VectorClock,
	compaction_counter: u64,
}

impl Inner {
	fn push(&mut self, op: &Operation, source: OpSource, now: i64) -> Option<u64> {
		let status = (source == OpSource::Remote).then_some(ApplicationStatus::Applied);
		self.push_with_status(op, source, status, now)
	}

	fn push_with_status(
		&mut self,
		op: &Operation,
		source: OpSource,
		application_status: Option<ApplicationStatus>,
		now: i64,
	) -> Option<u64> {
		if self.seq_by_id.contains_key(&op.id) {
			return None;
		}

		self.last_seq += 1;
		let seq = self.last_seq;
		self.seq_by_id.insert(op.id, seq);
		self.entries.insert(
			seq,
			OperationLogEntry {
				seq,
				op: op.clone(),
				applied_at: now,
				source,
				synced_at: (source == OpSource::Remote).then_some(now),
				rejected_at: None,
				application_status,
				retry_count: 0,
			},
		);

		Some(seq)
	}

	/// Like `push`, but a duplicate id yields the seq of the entry already stored
	fn push_or_existing(&mut self, op: &Operation, source: OpSource, now: i64) -> u64 {
		match self.push(op, source, now) {
			Some(seq) => seq,
			None => self.seq_by_id.get(&op.id).copied().unwrap_or_default(),
		}
	}
}

/// Volatile store, used for tests and for clients without durable storage
pub struct MemoryOpLogStore {
	inner: RwLock<Inner>,
	time: Arc<dyn TimeSource>,
}

impl Default for MemoryOpLogStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryOpLogStore {
	#[must_use]
	pub fn new() -> Self {
		Self::with_time_source(Arc::new(SystemTimeSource))
	}

	#[must_use]
	pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
		Self {
			inner: RwLock::default(),
			time,
		}
	}
}

#[async_trait]
impl OpLogStore for MemoryOpLogStore {
	async fn append(&self, op: &Operation, source: OpSource) -> Result<u64, StoreError> {
		let now = self.time.now_ms();
		Ok(self.inner.write().await.push_or_existing(op, source, now))
	}

	async fn append_with_vector_clock_update(&self, op: &Operation) -> Result<u64, StoreError> {
		let now = self.time.now_ms();
		let mut inner = self.inner.write().await;
		let seq = inner.push_or_existing(op, OpSource::Local, now);
		inner.vector_clock = op.vector_clock.clone();
		Ok(seq)
	}

	async fn append_batch(
		&self,
		ops: &[Operation],
		source: OpSource,
	) -> Result<Vec<u64>, StoreError> {
		let now = self.time.now_ms();
		let mut inner = self.inner.write().await;
		Ok(ops
			.iter()
			.filter_map(|op| inner.push(op, source, now))
			.collect())
	}

	async fn append_pending_remote(&self, ops: &[Operation]) -> Result<Vec<u64>, StoreError> {
		let now = self.time.now_ms();
		let mut inner = self.inner.write().await;
		Ok(ops
			.iter()
			.filter_map(|op| {
				inner.push_with_status(op, OpSource::Remote, Some(ApplicationStatus::Pending), now)
			})
			.collect())
	}

	async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		for seq in seqs {
			if let Some(entry) = inner.entries.get_mut(seq) {
				if matches!(
					entry.application_status,
					Some(ApplicationStatus::Pending | ApplicationStatus::Failed)
				) {
					entry.application_status = Some(ApplicationStatus::Applied);
				}
			}
		}
		Ok(())
	}

	async fn mark_failed(
		&self,
		op_ids: &[Uuid],
		max_retries: Option<u32>,
	) -> Result<(), StoreError> {
		let now = self.time.now_ms();
		let mut inner = self.inner.write().await;
		for id in op_ids {
			let Some(seq) = inner.seq_by_id.get(id).copied() else {
				continue;
			};
			if let Some(entry) = inner.entries.get_mut(&seq) {
				let attempts = entry.retry_count + 1;
				if max_retries.is_some_and(|max| attempts >= max) {
					entry.rejected_at.get_or_insert(now);
					entry.application_status = None;
				} else {
					entry.application_status = Some(ApplicationStatus::Failed);
					entry.retry_count = attempts;
				}
			}
		}
		Ok(())
	}

	async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.entries
			.values()
			.filter(|entry| entry.application_status == Some(ApplicationStatus::Pending))
			.cloned()
			.collect())
	}

	async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.entries
			.values()
			.filter(|entry| {
				entry.application_status == Some(ApplicationStatus::Failed)
					&& entry.rejected_at.is_none()
			})
			.cloned()
			.collect())
	}

	async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.entries
			.values()
			.filter(|entry| entry.is_pending())
			.cloned()
			.collect())
	}

	async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StoreError> {
		let now = self.time.now_ms();
		let mut inner = self.inner.write().await;
		for seq in seqs {
			if let Some(entry) = inner.entries.get_mut(seq) {
				entry.synced_at.get_or_insert(now);
			}
		}
		Ok(())
	}

	async fn mark_rejected(&self, op_ids: &[Uuid]) -> Result<(), StoreError> {
		let now = self.time.now_ms();
		let mut inner = self.inner.write().await;
		for id in op_ids {
			if let Some(seq) = inner.seq_by_id.get(id).copied() {
				if let Some(entry) = inner.entries.get_mut(&seq) {
					entry.rejected_at.get_or_insert(now);
					if entry.application_status != Some(ApplicationStatus::Applied) {
						entry.application_status = None;
					}
				}
			}
		}
		Ok(())
	}

	async fn get_applied_op_ids(&self) -> Result<HashSet<Uuid>, StoreError> {
		Ok(self.inner.read().await.seq_by_id.keys().copied().collect())
	}

	async fn get_op_by_id(&self, id: Uuid) -> Result<Option<OperationLogEntry>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.seq_by_id
			.get(&id)
			.and_then(|seq| inner.entries.get(seq))
			.cloned())
	}

	async fn get_last_seq(&self) -> Result<u64, StoreError> {
		Ok(self.inner.read().await.last_seq)
	}

	async fn count(&self) -> Result<u64, StoreError> {
		Ok(self.inner.read().await.entries.len() as u64)
	}

	async fn has_synced_ops(&self) -> Result<bool, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.entries
			.values()
			.any(|entry| entry.synced_at.is_some()))
	}

	async fn get_vector_clock(&self) -> Result<VectorClock, StoreError> {
		Ok(self.inner.read().await.vector_clock.clone())
	}

	async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StoreError> {
		self.inner.write().await.vector_clock = clock.clone();
		Ok(())
	}

	async fn merge_remote_op_clocks(&self, ops: &[Operation]) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		inner.vector_clock = ops
			.iter()
			.fold(inner.vector_clock.clone(), |clock, op| {
				clock.merge(&op.vector_clock)
			});
		Ok(())
	}

	async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StoreError> {
		self.inner.write().await.state_cache = Some(cache.clone());
		Ok(())
	}

	async fn load_state_cache(&self) -> Result<Option<StateCache>, StoreError> {
		Ok(self.inner.read().await.state_cache.clone())
	}

	async fn get_compaction_counter(&self) -> Result<u64, StoreError> {
		Ok(self.inner.read().await.compaction_counter)
	}

	async fn increment_compaction_counter(&self) -> Result<u64, StoreError> {
		let mut inner = self.inner.write().await;
		inner.compaction_counter += 1;
		Ok(inner.compaction_counter)
	}

	async fn reset_compaction_counter(&self) -> Result<(), StoreError> {
		self.inner.write().await.compaction_counter = 0;
		Ok(())
	}

	async fn delete_ops_where(&self, filter: &EntryFilter) -> Result<u64, StoreError> {
		let mut inner = self.inner.write().await;
		let doomed = inner
			.entries
			.values()
			.filter(|entry| filter.matches(entry))
			.map(|entry| (entry.seq, entry.op.id))
			.collect::<Vec<_>>();

		for (seq, id) in &doomed {
			inner.entries.remove(seq);
			inner.seq_by_id.remove(id);
		}

		Ok(doomed.len() as u64)
	}
}
