//! Pushes local writes to the server shortly after they happen, without
//! waiting for the next full sync.

use crate::{
	domain::SyncGate,
	notify::Notice,
	orchestrator::RemoteOpsApplier,
	provider::SyncProvider,
	upload::{UploadOptions, UploadService},
	SyncContext,
};

use sp_op_log::StoreError;

use std::sync::Arc;

use tokio::{
	sync::mpsc::{self, error::TrySendError},
	task::JoinHandle,
	time::timeout,
};
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
enum Message {
	Trigger,
	Stop,
}

/// Cheap to clone; every clone talks to the same background task
#[derive(Debug, Clone)]
pub struct ImmediateUploadHandle {
	tx: mpsc::Sender<Message>,
}

impl ImmediateUploadHandle {
	/// Asks for an upload soon. Never waits.
	pub fn trigger(&self) {
		match self.tx.try_send(Message::Trigger) {
			Ok(()) | Err(TrySendError::Full(_)) => {}
			Err(TrySendError::Closed(_)) => trace!("Immediate upload stopped, trigger dropped;"),
		}
	}

	pub async fn stop(&self) {
		if self.tx.send(Message::Stop).await.is_err() {
			trace!("Immediate upload already stopped;");
		}
	}
}

pub struct ImmediateUploadService {
	ctx: Arc<SyncContext>,
	provider: SyncProvider,
	upload: Arc<UploadService>,
	applier: Arc<RemoteOpsApplier>,
	gate: Arc<dyn SyncGate>,
}

impl ImmediateUploadService {
	#[must_use]
	pub fn new(
		ctx: Arc<SyncContext>,
		provider: SyncProvider,
		upload: Arc<UploadService>,
		applier: Arc<RemoteOpsApplier>,
		gate: Arc<dyn SyncGate>,
	) -> Self {
		Self {
			ctx,
			provider,
			upload,
			applier,
			gate,
		}
	}

	pub fn spawn(self) -> (ImmediateUploadHandle, JoinHandle<()>) {
		let (tx, rx) = mpsc::channel(8);
		let task = tokio::spawn(self.run(rx));
		(ImmediateUploadHandle { tx }, task)
	}

	async fn run(self, mut rx: mpsc::Receiver<Message>) {
		let debounce = self.ctx.config.immediate_upload_debounce();

		while let Some(Message::Trigger) = rx.recv().await {
			loop {
				match timeout(debounce, rx.recv()).await {
					Ok(Some(Message::Trigger)) => {}
					Ok(Some(Message::Stop) | None) => return,
					Err(_) => break,
				}
			}

			self.attempt().await;

			// Triggers from writes covered by the attempt that just ran
			loop {
				match rx.try_recv() {
					Ok(Message::Trigger) => {}
					Ok(Message::Stop) => return,
					Err(_) => break,
				}
			}
		}

		debug!("Immediate upload stopped;");
	}

	/// No snapshot and nothing ever written. Compaction keeps both, so an
	/// established client never looks fresh again.
	async fn is_wholly_fresh(&self) -> Result<bool, StoreError> {
		Ok(self.ctx.store.load_state_cache().await?.is_none()
			&& self.ctx.store.get_last_seq().await? == 0)
	}

	async fn attempt(&self) {
		if !self.gate.is_online() {
			trace!("Offline, skipping immediate upload;");
			return;
		}

		if self.ctx.is_sync_in_progress() {
			trace!("Full sync running, skipping immediate upload;");
			return;
		}

		if !self.provider.is_api() || !self.provider.is_ready().await {
			trace!("Provider can't take immediate uploads;");
			return;
		}

		// A wholly fresh client has to go through a full sync first
		match self.is_wholly_fresh().await {
			Ok(false) => {}
			Ok(true) => {
				debug!("Fresh client, leaving upload to the full sync;");
				return;
			}
			Err(e) => {
				warn!(?e, "Failed to check local history;");
				return;
			}
		}

		let result = match self
			.upload
			.upload_pending_ops(&self.provider, UploadOptions::default())
			.await
		{
			Ok(result) => result,
			Err(e) => {
				warn!(?e, "Immediate upload failed, leaving it to the next sync;");
				return;
			}
		};

		if result.uploaded_count == 0
			&& result.piggybacked_ops.is_empty()
			&& result.rejected_ops.is_empty()
		{
			return;
		}

		if let Err(e) = self.applier.finish_upload(&self.provider, &result).await {
			error!(?e, "Failed to settle immediate upload;");
			return;
		}

		debug!(
			uploaded = result.uploaded_count,
			piggybacked = result.piggybacked_ops.len(),
			"Immediate upload done;"
		);

		if result.uploaded_count > 0 && result.piggybacked_ops.is_empty() {
			self.ctx.notifier.notify(Notice::InSync);
		}
	}
}
