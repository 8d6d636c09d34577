//! Bounds the local log by folding it into a state snapshot.
//!
//! A compaction saves the current state as the [`StateCache`] and then drops
//! entries that are replicated, old enough and not newer than the snapshot.
//! Unsynced entries are never removed, however old they are.

use crate::{domain::StateSnapshotSource, notify::Notice, SyncContext};

use sp_op_log::{store::EntryFilter, StateCache, CURRENT_SCHEMA_VERSION, LOCK_OP_LOG};

use std::{
	sync::{
		atomic::{AtomicBool, AtomicU32, Ordering},
		Arc,
	},
	time::Duration,
};

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
	pub deleted: u64,
	pub last_seq: u64,
	pub duration: Duration,
	pub emergency: bool,
}

pub struct CompactionService {
	ctx: Arc<SyncContext>,
	snapshot: Arc<dyn StateSnapshotSource>,
	consecutive_failures: AtomicU32,
	scheduled: AtomicBool,
}

impl CompactionService {
	#[must_use]
	pub fn new(ctx: Arc<SyncContext>, snapshot: Arc<dyn StateSnapshotSource>) -> Self {
		Self {
			ctx,
			snapshot,
			consecutive_failures: AtomicU32::new(0),
			scheduled: AtomicBool::new(false),
		}
	}

	#[instrument(skip(self), err)]
	pub async fn compact(&self) -> Result<CompactionReport, crate::Error> {
		self.run(self.ctx.config.compaction_retention_ms, false).await
	}

	/// Compaction with the short retention window, used when storage is full.
	/// Never fails; returns whether it completed.
	pub async fn emergency_compact(&self) -> bool {
		match self
			.run(self.ctx.config.emergency_compaction_retention_ms, true)
			.await
		{
			Ok(report) => {
				info!(deleted = report.deleted, "Emergency compaction freed entries;");
				true
			}
			Err(e) => {
				error!(?e, "Emergency compaction failed;");
				false
			}
		}
	}

	/// Runs a regular compaction and tracks consecutive failures, telling the
	/// user once the configured limit is reached.
	pub async fn run_scheduled(&self) {
		match self.compact().await {
			Ok(_) => self.consecutive_failures.store(0, Ordering::Relaxed),
			Err(e) => {
				let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
				error!(?e, failures, "Scheduled compaction failed;");

				if failures >= self.ctx.config.max_compaction_failures {
					self.ctx.notifier.notify(Notice::CompactionFailing {
						consecutive_failures: failures,
					});
				}
			}
		}
	}

	/// Starts a scheduled compaction in the background, unless one is already pending
	pub fn spawn_scheduled(self: &Arc<Self>) {
		if self.scheduled.swap(true, Ordering::AcqRel) {
			debug!("Compaction already scheduled;");
			return;
		}

		let this = Arc::clone(self);
		tokio::spawn(async move {
			this.run_scheduled().await;
			this.scheduled.store(false, Ordering::Release);
		});
	}

	#[must_use]
	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures.load(Ordering::Relaxed)
	}

	async fn run(&self, retention_ms: u64, emergency: bool) -> Result<CompactionReport, crate::Error> {
		let SyncContext {
			store, locks, time, config, ..
		} = &*self.ctx;

		let _guard = locks.acquire(LOCK_OP_LOG).await?;
		let started_ms = time.now_ms();

		let state = self.snapshot.get_all_sync_model_data().await?;
		let vector_clock = store.get_vector_clock().await?;
		let last_seq = store.get_last_seq().await?;

		let last_applied_op_seq = store
			.load_state_cache()
			.await?
			.map_or(last_seq, |previous| previous.last_applied_op_seq.max(last_seq));

		let now = time.now_ms();
		store
			.save_state_cache(&StateCache {
				snapshot_entity_keys: extract_entity_keys(&state),
				state,
				last_applied_op_seq,
				vector_clock,
				compacted_at: now,
				schema_version: CURRENT_SCHEMA_VERSION,
			})
			.await?;
		store.reset_compaction_counter().await?;

		let retention = i64::try_from(retention_ms).unwrap_or(i64::MAX);
		let deleted = store
			.delete_ops_where(&EntryFilter {
				synced_only: true,
				applied_before: Some(now.saturating_sub(retention)),
				max_seq: Some(last_seq),
			})
			.await?;

		let duration_ms = u64::try_from(time.now_ms() - started_ms).unwrap_or_default();
		let duration = Duration::from_millis(duration_ms);

		if duration > config.slow_compaction_threshold() {
			warn!(
				duration_ms,
				deleted,
				emergency,
				"Slow compaction;"
			);
		} else {
			info!(deleted, last_seq, emergency, "Compaction completed;");
		}

		Ok(CompactionReport {
			deleted,
			last_seq,
			duration,
			emergency,
		})
	}
}

/// Lists `ENTITY_TYPE:id` for every entity found in a state snapshot.
///
/// Entity collections are objects with an `ids` array, or arrays of objects
/// with an `id`. Objects grouping collections (like archives) are walked into,
/// any other object is a singleton keyed by its own type.
#[must_use]
pub fn extract_entity_keys(state: &Value) -> Vec<String> {
	let mut keys = Vec::new();

	if let Value::Object(features) = state {
		for (name, feature) in features {
			collect_feature(name, feature, &mut keys);
		}
	}

	keys
}

fn collect_feature(name: &str, feature: &Value, keys: &mut Vec<String>) {
	match feature {
		Value::Object(map) => {
			if let Some(ids) = map.get("ids").and_then(Value::as_array) {
				let entity_type = entity_type_name(name);
				keys.extend(
					ids.iter()
						.filter_map(Value::as_str)
						.map(|id| format!("{entity_type}:{id}")),
				);
			} else if map.values().any(is_collection) {
				for (child, value) in map.iter().filter(|(_, value)| is_collection(value)) {
					collect_feature(child, value, keys);
				}
			} else {
				let entity_type = entity_type_name(name);
				keys.push(format!("{entity_type}:{entity_type}"));
			}
		}
		Value::Array(items) => {
			let entity_type = entity_type_name(name.strip_suffix('s').unwrap_or(name));
			keys.extend(
				items
					.iter()
					.filter_map(|item| item.get("id").and_then(Value::as_str))
					.map(|id| format!("{entity_type}:{id}")),
			);
		}
		_ => {}
	}
}

fn is_collection(value: &Value) -> bool {
	value
		.get("ids")
		.is_some_and(|ids| ids.is_array())
}

/// `globalConfig` -> `GLOBAL_CONFIG`
fn entity_type_name(feature: &str) -> String {
	let mut out = String::with_capacity(feature.len() + 4);
	for (idx, ch) in feature.chars().enumerate() {
		if ch.is_ascii_uppercase() && idx > 0 {
			out.push('_');
		}
		out.push(ch.to_ascii_uppercase());
	}
	out
}
