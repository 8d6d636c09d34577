//! Full sync runs: download, apply, upload.

use crate::{
	domain::RemoteOpsProcessor,
	download::{DownloadOptions, DownloadService},
	notify::Notice,
	provider::SyncProvider,
	upload::{PreUploadHook, RejectedOpsHandler, UploadOptions, UploadResult, UploadService},
	Error, SyncContext,
};

use sp_op_log::{Operation, OperationLogEntry, VectorClock, LOCK_OP_LOG};

use std::{
	collections::HashSet,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use tokio::{
	sync::mpsc,
	task::JoinHandle,
	time::timeout,
};
use tracing::{debug, error, info, instrument, trace, warn};

/// Hands remote operations to the application and records them in the log
pub struct RemoteOpsApplier {
	ctx: Arc<SyncContext>,
	processor: Arc<dyn RemoteOpsProcessor>,
	rejected: RejectedOpsHandler,
}

impl RemoteOpsApplier {
	#[must_use]
	pub fn new(ctx: Arc<SyncContext>, processor: Arc<dyn RemoteOpsProcessor>) -> Self {
		Self {
			rejected: RejectedOpsHandler::new(Arc::clone(&ctx)),
			ctx,
			processor,
		}
	}

	/// Applies the operations the log has never seen. Returns how many were
	/// applied.
	///
	/// Operations are recorded as pending before the application sees them, so
	/// a crash in between leaves them for [`Self::retry_remote_ops`]. When the
	/// application stops at a failing operation, that one and everything after
	/// it are marked failed.
	pub async fn apply(&self, ops: &[Operation]) -> Result<usize, Error> {
		if ops.is_empty() {
			return Ok(0);
		}

		let (fresh, seqs) = {
			let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;
			let known = self.ctx.store.get_applied_op_ids().await?;
			let mut seen = HashSet::with_capacity(ops.len());
			let fresh = ops
				.iter()
				.filter(|op| !known.contains(&op.id) && seen.insert(op.id))
				.cloned()
				.collect::<Vec<_>>();

			if fresh.is_empty() {
				debug!(received = ops.len(), "All remote operations already known;");
				return Ok(0);
			}

			let seqs = self.ctx.store.append_pending_remote(&fresh).await?;
			(fresh, seqs)
		};

		// The application writes to the log itself, so the lock is released
		// while it runs
		let outcome = self.processor.process_remote_ops(&fresh).await;
		let applied = match &outcome {
			Ok(()) => fresh.len(),
			Err(e) => e.applied.min(fresh.len()),
		};

		let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;
		self.ctx.store.mark_applied(&seqs[..applied.min(seqs.len())]).await?;
		self.ctx
			.store
			.merge_remote_op_clocks(&fresh[..applied])
			.await?;

		if let Err(e) = outcome {
			let failed = fresh[applied..].iter().map(|op| op.id).collect::<Vec<_>>();
			self.ctx.store.mark_failed(&failed, None).await?;
			error!(?e, applied, failed = failed.len(), "Failed to apply remote operations;");
			self.ctx.notifier.notify(Notice::RemoteApplyFailed {
				failed: failed.len(),
			});
			return Err(e.into());
		}

		debug!(received = ops.len(), applied, "Applied remote operations;");
		Ok(applied)
	}

	/// Hands leftover remote operations to the application again, one at a
	/// time: those a crash left pending and those that failed before.
	///
	/// Pending operations older than the configured expiry are rejected
	/// without another attempt, and failing ones are rejected once they used
	/// up their retries.
	#[instrument(skip_all, err)]
	pub async fn retry_remote_ops(&self) -> Result<RetryReport, Error> {
		let mut report = RetryReport::default();

		let candidates = {
			let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;
			let expires_before = self.ctx.time.now_ms()
				- i64::try_from(self.ctx.config.pending_remote_op_expiry_ms).unwrap_or(i64::MAX);

			let (expired, mut candidates): (Vec<OperationLogEntry>, Vec<_>) = self
				.ctx
				.store
				.get_pending_remote_ops()
				.await?
				.into_iter()
				.partition(|entry| entry.applied_at < expires_before);

			if !expired.is_empty() {
				let ids = expired.iter().map(|entry| entry.op.id).collect::<Vec<_>>();
				self.ctx.store.mark_rejected(&ids).await?;
				warn!(count = ids.len(), "Rejected expired pending remote operations;");
				report.expired = ids.len();
			}

			candidates.extend(self.ctx.store.get_failed_remote_ops().await?);
			candidates.sort_by_key(|entry| entry.seq);
			candidates
		};

		if candidates.is_empty() {
			return Ok(report);
		}

		let mut applied = Vec::with_capacity(candidates.len());
		let mut failing = Vec::new();
		for entry in candidates {
			match self
				.processor
				.process_remote_ops(std::slice::from_ref(&entry.op))
				.await
			{
				Ok(()) => applied.push(entry),
				Err(e) => {
					warn!(op_id = %entry.op.id, retries = entry.retry_count, ?e, "Remote operation still fails;");
					failing.push(entry.op.id);
				}
			}
		}

		let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;
		let seqs = applied.iter().map(|entry| entry.seq).collect::<Vec<_>>();
		let ops = applied.into_iter().map(|entry| entry.op).collect::<Vec<_>>();
		self.ctx.store.mark_applied(&seqs).await?;
		self.ctx.store.merge_remote_op_clocks(&ops).await?;
		self.ctx
			.store
			.mark_failed(&failing, Some(self.ctx.config.max_remote_apply_retries))
			.await?;

		report.applied = ops.len();
		report.still_failing = failing.len();
		info!(?report, "Retried remote operations;");

		Ok(report)
	}

	/// Settles an upload: piggybacked operations first, then the server
	/// position, then the rejections. Returns how many operations were marked
	/// rejected.
	pub async fn finish_upload(
		&self,
		provider: &SyncProvider,
		result: &UploadResult,
	) -> Result<usize, Error> {
		self.apply(&result.piggybacked_ops).await?;

		if let (SyncProvider::Api(api), Some(seq)) = (provider, result.latest_server_seq) {
			api.set_last_server_seq(seq).await?;
		}

		self.rejected.handle(&result.rejected_ops).await
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
	pub applied: usize,
	/// Failed again; rejected when out of retries
	pub still_failing: usize,
	/// Left pending for too long and rejected
	pub expired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
	pub downloaded: usize,
	pub download_complete: bool,
	pub failed_files: usize,
	pub needs_full_state_upload: bool,
	pub uploaded: usize,
	pub piggybacked: usize,
	pub rejected: usize,
}

/// Clears the in-progress flag however the run ends
struct InProgress<'a>(&'a SyncContext);

impl<'a> InProgress<'a> {
	fn start(ctx: &'a SyncContext) -> Self {
		ctx.set_sync_in_progress(true);
		Self(ctx)
	}
}

impl Drop for InProgress<'_> {
	fn drop(&mut self) {
		self.0.set_sync_in_progress(false);
	}
}

pub struct SyncOrchestrator {
	ctx: Arc<SyncContext>,
	download: DownloadService,
	upload: Arc<UploadService>,
	applier: Arc<RemoteOpsApplier>,
	pre_upload: Option<Arc<dyn PreUploadHook>>,
	retried_remote_ops: AtomicBool,
}

impl SyncOrchestrator {
	#[must_use]
	pub fn new(
		ctx: Arc<SyncContext>,
		upload: Arc<UploadService>,
		applier: Arc<RemoteOpsApplier>,
	) -> Self {
		Self {
			download: DownloadService::new(Arc::clone(&ctx)),
			ctx,
			upload,
			applier,
			pre_upload: None,
			retried_remote_ops: AtomicBool::new(false),
		}
	}

	#[must_use]
	pub fn with_pre_upload(mut self, hook: Arc<dyn PreUploadHook>) -> Self {
		self.pre_upload = Some(hook);
		self
	}

	#[instrument(skip_all, fields(api = provider.is_api()), err)]
	pub async fn sync(&self, provider: &SyncProvider) -> Result<SyncReport, Error> {
		let _in_progress = InProgress::start(&self.ctx);

		// Leftovers of the previous session go first, once per process
		if !self.retried_remote_ops.swap(true, Ordering::AcqRel) {
			self.applier.retry_remote_ops().await?;
		}

		let downloaded = self.download.download_remote_ops(provider).await?;
		self.applier.apply(&downloaded.new_ops).await?;

		if let (SyncProvider::Api(api), Some(seq)) = (provider, downloaded.latest_server_seq) {
			api.set_last_server_seq(seq).await?;
		}

		if downloaded.needs_full_state_upload {
			warn!("Remote side needs a full state upload before regular operations;");
		}

		let uploaded = self
			.upload
			.upload_pending_ops(
				provider,
				UploadOptions {
					pre_upload: self.pre_upload.clone(),
				},
			)
			.await?;
		let rejected = self.applier.finish_upload(provider, &uploaded).await?;

		let report = SyncReport {
			downloaded: downloaded.new_ops.len(),
			download_complete: downloaded.success,
			failed_files: downloaded.failed_file_count,
			needs_full_state_upload: downloaded.needs_full_state_upload,
			uploaded: uploaded.uploaded_count,
			piggybacked: uploaded.piggybacked_ops.len(),
			rejected,
		};
		info!(?report, "Sync finished;");

		Ok(report)
	}

	/// Downloads the whole remote history and rebuilds the local vector clock
	/// from every operation clock seen plus the snapshot clock, when the
	/// server reports one. Repairs a clock that lost entries.
	#[instrument(skip_all, fields(api = provider.is_api()), err)]
	pub async fn rebuild_vector_clock(&self, provider: &SyncProvider) -> Result<VectorClock, Error> {
		let _in_progress = InProgress::start(&self.ctx);

		let downloaded = self
			.download
			.download_remote_ops_with(
				provider,
				DownloadOptions {
					force_from_seq0: true,
				},
			)
			.await?;
		self.applier.apply(&downloaded.new_ops).await?;

		let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;
		let clock = downloaded
			.all_op_clocks
			.iter()
			.chain(downloaded.snapshot_vector_clock.as_ref())
			.fold(self.ctx.store.get_vector_clock().await?, |clock, other| {
				clock.merge(other)
			});
		self.ctx.store.set_vector_clock(&clock).await?;

		if let (SyncProvider::Api(api), Some(seq)) = (provider, downloaded.latest_server_seq) {
			api.set_last_server_seq(seq).await?;
		}

		info!(
			clocks = downloaded.all_op_clocks.len(),
			snapshot = downloaded.snapshot_vector_clock.is_some(),
			"Rebuilt vector clock;"
		);

		Ok(clock)
	}

	/// Starts syncing on inbound change events, one run per burst of events
	pub fn spawn_inbound(self: &Arc<Self>, provider: SyncProvider) -> InboundSyncHandle {
		let (tx, rx) = mpsc::channel(16);
		let focused = Arc::new(AtomicBool::new(true));

		let task = tokio::spawn(Arc::clone(self).run_inbound(provider, rx, Arc::clone(&focused)));

		InboundSyncHandle { tx, focused, task }
	}

	async fn run_inbound(
		self: Arc<Self>,
		provider: SyncProvider,
		mut rx: mpsc::Receiver<InboundMessage>,
		focused: Arc<AtomicBool>,
	) {
		while let Some(msg) = rx.recv().await {
			let InboundMessage::Change(event) = msg else {
				break;
			};
			trace!(?event, "Remote change;");

			// Every further event restarts the window
			loop {
				let window = self.ctx.config.inbound_debounce(focused.load(Ordering::Relaxed));
				match timeout(window, rx.recv()).await {
					Ok(Some(InboundMessage::Change(_))) => {}
					Ok(Some(InboundMessage::Stop) | None) => return,
					Err(_) => break,
				}
			}

			if let Err(e) = self.sync(&provider).await {
				error!(?e, "Sync after remote change failed;");
			}
		}

		debug!("Inbound sync loop stopped;");
	}
}

/// A change happened on the remote side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChangeEvent {
	/// Changed remote file, when the provider reports one
	pub path: Option<String>,
}

#[derive(Debug)]
enum InboundMessage {
	Change(RemoteChangeEvent),
	Stop,
}

pub struct InboundSyncHandle {
	tx: mpsc::Sender<InboundMessage>,
	focused: Arc<AtomicBool>,
	task: JoinHandle<()>,
}

impl InboundSyncHandle {
	pub async fn remote_changed(&self, event: RemoteChangeEvent) {
		if self.tx.send(InboundMessage::Change(event)).await.is_err() {
			warn!("Inbound sync loop is gone;");
		}
	}

	/// Focused windows react faster to remote changes
	pub fn set_focused(&self, focused: bool) {
		self.focused.store(focused, Ordering::Relaxed);
	}

	pub async fn stop(self) {
		if self.tx.send(InboundMessage::Stop).await.is_ok() {
			if let Err(e) = self.task.await {
				error!(?e, "Inbound sync loop panicked;");
			}
		}
	}
}
