//! Turns local state-changing actions into persisted operations.

use crate::{
	compaction::CompactionService,
	domain::{CaptureQueue, SyncGate},
	immediate_upload::ImmediateUploadHandle,
	notify::Notice,
	Error, SyncContext,
};

use sp_op_log::{
	validate_operation, ClientId, EntityChange, MultiEntityPayload, OpType, Operation,
	OperationPayload, CURRENT_SCHEMA_VERSION, LOCK_OP_LOG, LOCK_QUOTA_EXCEEDED,
};

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, OnceLock,
};

use serde_json::Value;
use tokio::{
	sync::{mpsc, oneshot},
	task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Entity type of operations that replace the whole state
pub const FULL_STATE_ENTITY_TYPE: &str = "ALL";

/// A dispatched action that must be persisted as an operation
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentAction {
	pub action_type: String,
	pub entity_type: String,
	pub entity_id: Option<String>,
	pub entity_ids: Option<Vec<String>>,
	/// Type declared by the action, used when no entity changes were captured
	pub op_type: OpType,
	pub payload: Value,
	/// Replayed from a remote operation; never persisted again
	pub is_remote: bool,
}

impl PersistentAction {
	/// Key pairing this action with the entity changes computed for it
	#[must_use]
	pub fn correlation_key(&self) -> String {
		let payload_hash = blake3::hash(self.payload.to_string().as_bytes());
		format!(
			"{}:{}:{}:{}",
			self.action_type,
			self.entity_type,
			self.entity_id.as_deref().unwrap_or_default(),
			payload_hash.to_hex()
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
	Persisted { seq: u64, op_id: Uuid },
	/// Remote action or remote operations being applied
	Skipped,
	Invalid,
	Failed,
}

/// Aggregate type of a multi-entity operation: Delete beats Create beats Update.
/// The per-entity changes keep their own types.
#[must_use]
pub fn aggregate_op_type(declared: OpType, changes: &[EntityChange]) -> OpType {
	changes
		.iter()
		.map(|change| change.op_type)
		.max_by_key(|op_type| op_type.priority())
		.unwrap_or(declared)
}

/// Everything needed to build the operation, computed once per action so a
/// retry after quota recovery reuses the same entity changes
struct PreparedWrite {
	client_id: ClientId,
	action: PersistentAction,
	op_type: OpType,
	entity_ids: Option<Vec<String>>,
	changes: Vec<EntityChange>,
}

impl PreparedWrite {
	fn entity_ids(action: &PersistentAction, changes: &[EntityChange]) -> Option<Vec<String>> {
		let mut ids = Vec::<String>::new();
		for id in action
			.entity_id
			.iter()
			.chain(action.entity_ids.iter().flatten())
			.chain(changes.iter().map(|change| &change.entity_id))
		{
			if !ids.contains(id) {
				ids.push(id.clone());
			}
		}

		(!ids.is_empty()).then_some(ids)
	}
}

pub struct OperationWriter {
	ctx: Arc<SyncContext>,
	queue: Arc<dyn CaptureQueue>,
	gate: Arc<dyn SyncGate>,
	compaction: Arc<CompactionService>,
	immediate_upload: OnceLock<ImmediateUploadHandle>,
	handling_quota_exceeded: AtomicBool,
}

impl OperationWriter {
	#[must_use]
	pub fn new(
		ctx: Arc<SyncContext>,
		queue: Arc<dyn CaptureQueue>,
		gate: Arc<dyn SyncGate>,
		compaction: Arc<CompactionService>,
	) -> Self {
		Self {
			ctx,
			queue,
			gate,
			compaction,
			immediate_upload: OnceLock::new(),
			handling_quota_exceeded: AtomicBool::new(false),
		}
	}

	/// Successful writes will nudge this uploader. Only the first handle attached is kept.
	pub fn attach_immediate_upload(&self, handle: ImmediateUploadHandle) {
		if self.immediate_upload.set(handle).is_err() {
			warn!("Immediate upload already attached;");
		}
	}

	#[instrument(skip_all, fields(action_type = %action.action_type))]
	pub async fn write_operation(&self, action: PersistentAction) -> WriteOutcome {
		if action.is_remote || self.gate.is_applying_remote_ops() {
			return WriteOutcome::Skipped;
		}

		let client_id = match self.ctx.client_id.get().await {
			Ok(client_id) => client_id,
			Err(e) => {
				error!(?e, "Failed to load client id, cannot persist operation;");
				self.ctx.notifier.notify(Notice::PersistFailed {
					reason: e.to_string(),
				});
				return WriteOutcome::Failed;
			}
		};

		let changes = if action.op_type.is_full_state() {
			Vec::new()
		} else {
			self.queue.dequeue(&action.correlation_key()).await
		};

		let prepared = PreparedWrite {
			op_type: aggregate_op_type(action.op_type, &changes),
			entity_ids: PreparedWrite::entity_ids(&action, &changes),
			client_id,
			action,
			changes,
		};

		match self.persist(&prepared).await {
			Ok((seq, op_id)) => {
				self.after_persist(&prepared.client_id).await;
				WriteOutcome::Persisted { seq, op_id }
			}
			Err(e) => self.handle_failure(&prepared, e).await,
		}
	}

	/// Records a replacement of the whole state (import, backup restore or
	/// repair), uploaded later as a snapshot.
	pub async fn write_full_state_operation(&self, op_type: OpType, state: Value) -> WriteOutcome {
		if !op_type.is_full_state() {
			error!(%op_type, "Not a full-state operation type;");
			return WriteOutcome::Invalid;
		}

		self.write_operation(PersistentAction {
			action_type: format!("[Sync] {op_type}"),
			entity_type: FULL_STATE_ENTITY_TYPE.into(),
			entity_id: None,
			entity_ids: None,
			op_type,
			payload: state,
			is_remote: false,
		})
		.await
	}

	async fn persist(&self, prepared: &PreparedWrite) -> Result<(u64, Uuid), Error> {
		let SyncContext {
			store,
			locks,
			time,
			config,
			..
		} = &*self.ctx;

		let _guard = locks.acquire(LOCK_OP_LOG).await?;

		let vector_clock = store
			.get_vector_clock()
			.await?
			.increment(&prepared.client_id);

		let op = Operation {
			id: Uuid::now_v7(),
			client_id: prepared.client_id.clone(),
			action_type: prepared.action.action_type.clone(),
			op_type: prepared.op_type,
			entity_type: prepared.action.entity_type.clone(),
			entity_id: prepared.action.entity_id.clone(),
			entity_ids: prepared.entity_ids.clone(),
			payload: if prepared.op_type.is_full_state() {
				OperationPayload::FullState(prepared.action.payload.clone())
			} else {
				OperationPayload::MultiEntity(MultiEntityPayload {
					action_payload: prepared.action.payload.clone(),
					entity_changes: prepared.changes.clone(),
				})
			},
			vector_clock,
			timestamp: time.now_ms(),
			schema_version: CURRENT_SCHEMA_VERSION,
		};

		let report = validate_operation(&op, config)?;
		if !report.is_clean() {
			warn!(warnings = ?report.warnings, op_type = %op.op_type, "Operation payload warnings;");
		}

		let seq = store.append_with_vector_clock_update(&op).await?;
		debug!(seq, op_id = %op.id, op_type = %op.op_type, "Persisted operation;");

		Ok((seq, op.id))
	}

	async fn after_persist(&self, client_id: &ClientId) {
		if !self.ctx.is_sync_in_progress() {
			if let Err(e) = self
				.ctx
				.legacy
				.increment_vector_clock_for_local_change(client_id)
				.await
			{
				warn!(?e, "Failed to bump legacy vector clock;");
			}
		}

		match self.ctx.store.increment_compaction_counter().await {
			Ok(count) if count >= self.ctx.config.compaction_threshold => {
				info!(count, "Compaction threshold reached;");
				self.compaction.spawn_scheduled();
			}
			Ok(_) => {}
			Err(e) => warn!(?e, "Failed to bump compaction counter;"),
		}

		if let Some(upload) = self.immediate_upload.get() {
			upload.trigger();
		}
	}

	async fn handle_failure(&self, prepared: &PreparedWrite, e: Error) -> WriteOutcome {
		match e {
			Error::Validation(e) => {
				error!(
					?e,
					op_type = %prepared.op_type,
					entity_type = %prepared.action.entity_type,
					"Invalid operation payload;"
				);
				self.ctx.notifier.notify(Notice::InvalidOperationPayload {
					reason: e.to_string(),
				});
				WriteOutcome::Invalid
			}
			e if e.is_quota_exceeded() => {
				if self.handling_quota_exceeded.load(Ordering::Acquire) {
					error!("Storage quota exceeded while recovering from it, giving up;");
					self.ctx.notifier.notify(Notice::StorageQuotaExceeded);
					return WriteOutcome::Failed;
				}

				self.recover_from_quota_exceeded(prepared).await
			}
			e => {
				error!(?e, "Failed to persist operation;");
				self.ctx.notifier.notify(Notice::PersistFailed {
					reason: e.to_string(),
				});
				WriteOutcome::Failed
			}
		}
	}

	async fn recover_from_quota_exceeded(&self, prepared: &PreparedWrite) -> WriteOutcome {
		error!("Storage quota exceeded, attempting emergency compaction;");

		let _guard = match self.ctx.locks.acquire(LOCK_QUOTA_EXCEEDED).await {
			Ok(guard) => guard,
			Err(e) => {
				error!(?e, "Failed to acquire quota recovery lock;");
				self.ctx.notifier.notify(Notice::StorageQuotaExceeded);
				return WriteOutcome::Failed;
			}
		};

		if !self.compaction.emergency_compact().await {
			self.ctx.notifier.notify(Notice::StorageQuotaExceeded);
			return WriteOutcome::Failed;
		}

		self.handling_quota_exceeded.store(true, Ordering::Release);
		let retried = self.persist(prepared).await;
		self.handling_quota_exceeded.store(false, Ordering::Release);

		match retried {
			Ok((seq, op_id)) => {
				info!(seq, "Operation persisted after emergency compaction;");
				self.after_persist(&prepared.client_id).await;
				self.ctx.notifier.notify(Notice::StorageRecovered);
				WriteOutcome::Persisted { seq, op_id }
			}
			Err(e) => {
				error!(?e, "Retry after emergency compaction failed;");
				self.ctx.notifier.notify(Notice::StorageQuotaExceeded);
				WriteOutcome::Failed
			}
		}
	}
}

enum CaptureMessage {
	Action(PersistentAction, Option<oneshot::Sender<WriteOutcome>>),
	Stop,
}

/// Feeds actions to an [`OperationWriter`] one at a time, in arrival order
pub struct CaptureTask;

impl CaptureTask {
	#[must_use]
	pub fn spawn(writer: Arc<OperationWriter>, capacity: usize) -> CaptureHandle {
		let (tx, mut rx) = mpsc::channel(capacity);

		let task = tokio::spawn(async move {
			while let Some(msg) = rx.recv().await {
				match msg {
					CaptureMessage::Action(action, reply) => {
						let outcome = writer.write_operation(action).await;
						if let Some(reply) = reply {
							// The sender may have stopped waiting
							let _ = reply.send(outcome);
						}
					}
					CaptureMessage::Stop => break,
				}
			}

			debug!("Capture task stopped;");
		});

		CaptureHandle { tx, task }
	}
}

pub struct CaptureHandle {
	tx: mpsc::Sender<CaptureMessage>,
	task: JoinHandle<()>,
}

impl CaptureHandle {
	/// Queues an action, waiting for room when the channel is full
	pub async fn submit(&self, action: PersistentAction) -> bool {
		self.tx
			.send(CaptureMessage::Action(action, None))
			.await
			.is_ok()
	}

	/// Queues an action and waits until it has been written
	pub async fn submit_and_wait(&self, action: PersistentAction) -> Option<WriteOutcome> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.tx
			.send(CaptureMessage::Action(action, Some(reply_tx)))
			.await
			.ok()?;
		reply_rx.await.ok()
	}

	/// Writes everything queued before the call, then stops the task
	pub async fn stop(self) {
		if self.tx.send(CaptureMessage::Stop).await.is_ok() {
			if let Err(e) = self.task.await {
				error!(?e, "Capture task panicked;");
			}
		}
	}
}
