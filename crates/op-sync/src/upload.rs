//! Sends pending local operations to the remote side.
//!
//! Regular operations go up in chunks, full-state operations one by one as
//! snapshots. Operations the server rejects are collected and handed back,
//! they are only marked rejected by [`RejectedOpsHandler`] once the caller
//! had a chance to process the remote operations that came back with them.

use crate::{
	domain::DomainError,
	encryption::{open_sync_ops, PayloadCipher},
	manifest::{self, encode_ops_file, ops_file_path},
	notify::Notice,
	provider::{
		FileSyncProvider, OperationSyncProvider, ProviderError, SnapshotReason, SnapshotUpload,
		SyncOperation, SyncProvider,
	},
	Error, SyncContext,
};

use sp_op_log::{Operation, OperationLogEntry, LOCK_OP_LOG, LOCK_UPLOAD};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// Phrases of errors worth retrying on the next sync
const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
	"network",
	"fetch failed",
	"failed to fetch",
	"connection",
	"econnrefused",
	"econnreset",
	"socket hang up",
	"timeout",
	"timed out",
	"busy",
	"retry",
	"try again",
	"rate limit",
	"too many requests",
	"temporarily unavailable",
	"service unavailable",
	"internal server error",
	"internal_error",
	"bad gateway",
	"gateway timeout",
	"500",
	"502",
	"503",
	"504",
];

/// Classifies a rejection message by the vocabulary of transient failures
#[must_use]
pub fn is_transient_error(message: &str) -> bool {
	let message = message.to_lowercase();
	TRANSIENT_ERROR_PATTERNS
		.iter()
		.any(|pattern| message.contains(pattern))
}

fn is_transient_provider_error(e: &ProviderError) -> bool {
	match e {
		ProviderError::Network(_) => true,
		ProviderError::Server { status, message } => {
			*status >= 500 || *status == 429 || is_transient_error(message)
		}
		ProviderError::NotFound(_) | ProviderError::Conflict(_) => false,
		ProviderError::Other(message) => is_transient_error(message),
	}
}

/// Runs under the upload lock right before pending operations are read, so
/// anything it writes goes out in the same upload.
#[async_trait]
pub trait PreUploadHook: Send + Sync {
	async fn before_upload(&self) -> Result<(), DomainError>;
}

#[derive(Clone, Default)]
pub struct UploadOptions {
	pub pre_upload: Option<Arc<dyn PreUploadHook>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOp {
	pub op_id: Uuid,
	pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadResult {
	pub uploaded_count: usize,
	/// Remote operations returned alongside the upload, not yet applied
	pub piggybacked_ops: Vec<Operation>,
	pub rejected_ops: Vec<RejectedOp>,
	pub rejected_count: usize,
	/// Server position to persist once the piggybacked operations are recorded.
	/// `None` for file providers.
	pub latest_server_seq: Option<u64>,
}

pub struct UploadService {
	ctx: Arc<SyncContext>,
}

impl UploadService {
	#[must_use]
	pub const fn new(ctx: Arc<SyncContext>) -> Self {
		Self { ctx }
	}

	#[instrument(skip_all, fields(api = provider.is_api()), err)]
	pub async fn upload_pending_ops(
		&self,
		provider: &SyncProvider,
		options: UploadOptions,
	) -> Result<UploadResult, Error> {
		let _guard = self.ctx.locks.acquire(LOCK_UPLOAD).await?;

		if let Some(hook) = &options.pre_upload {
			hook.before_upload().await?;
		}

		let pending = self.ctx.store.get_unsynced().await?;
		if pending.is_empty() {
			trace!("No pending operations to upload;");
			return Ok(UploadResult::default());
		}

		let cipher = provider
			.load_private_config()
			.await?
			.and_then(|config| config.active_key().map(PayloadCipher::new));

		match provider {
			SyncProvider::Api(api) => self.upload_to_api(api.as_ref(), pending, cipher).await,
			SyncProvider::File(files) => {
				self.upload_to_files(files.as_ref(), pending, cipher.as_ref())
					.await
			}
		}
	}

	async fn upload_to_api(
		&self,
		provider: &dyn OperationSyncProvider,
		pending: Vec<OperationLogEntry>,
		cipher: Option<PayloadCipher>,
	) -> Result<UploadResult, Error> {
		let client_id = self.ctx.client_id.get().await?;
		let stored_seq = provider.get_last_server_seq().await?;

		let mut tracker = ServerSeqTracker::new(stored_seq);
		let mut result = UploadResult::default();

		let (full_state, regular): (Vec<_>, Vec<_>) = pending
			.into_iter()
			.partition(|entry| entry.op.is_full_state());

		for entry in &full_state {
			if self
				.upload_snapshot(provider, entry, cipher.as_ref(), &mut tracker)
				.await?
			{
				result.uploaded_count += 1;
			}
		}

		for chunk in regular.chunks(self.ctx.config.upload_batch_size.max(1)) {
			let mut wire = chunk
				.iter()
				.map(|entry| SyncOperation::try_from(&entry.op))
				.collect::<Result<Vec<_>, _>>()?;
			if let Some(cipher) = &cipher {
				cipher.encrypt_ops(&mut wire)?;
			}

			let response = provider
				.upload_ops(&wire, &client_id, Some(tracker.current()))
				.await?;

			let seq_by_id = chunk
				.iter()
				.map(|entry| (entry.op.id, entry.seq))
				.collect::<HashMap<_, _>>();

			let mut accepted = Vec::with_capacity(chunk.len());
			for op_result in response.results {
				match seq_by_id.get(&op_result.op_id) {
					Some(seq) if op_result.accepted => accepted.push(*seq),
					Some(_) => result.rejected_ops.push(RejectedOp {
						op_id: op_result.op_id,
						error: op_result.error.unwrap_or_default(),
					}),
					None => warn!(op_id = %op_result.op_id, "Upload result for an unknown operation;"),
				}
			}

			if !accepted.is_empty() {
				self.ctx.store.mark_synced(&accepted).await?;
				result.uploaded_count += accepted.len();
			}

			let mut piggyback_complete = !response.has_more_piggyback;
			if let Some(new_ops) = response.new_ops.filter(|ops| !ops.is_empty()) {
				let count = new_ops.len();
				match open_sync_ops(
					new_ops.into_iter().map(|server_op| server_op.op).collect(),
					cipher.as_ref(),
				) {
					Ok(ops) => {
						debug!(count, "Received piggybacked operations;");
						result.piggybacked_ops.extend(ops);
					}
					Err(e) => {
						// Left for the next download to fetch again
						warn!(?e, count, "Dropping piggybacked operations;");
						self.notify_open_failure(&e);
						piggyback_complete = false;
					}
				}
			}

			if piggyback_complete {
				tracker.observe(response.latest_seq);
			} else {
				debug!(
					latest_seq = response.latest_seq,
					kept = tracker.current(),
					"More piggybacked operations pending, keeping server seq;"
				);
			}
		}

		result.rejected_count = result.rejected_ops.len();
		result.latest_server_seq = Some(tracker.current());

		if result.rejected_count > 0 {
			warn!(
				rejected = result.rejected_count,
				"Server rejected operations;"
			);
		}
		info!(
			uploaded = result.uploaded_count,
			piggybacked = result.piggybacked_ops.len(),
			"Uploaded pending operations;"
		);

		Ok(result)
	}

	/// Returns whether the snapshot was accepted
	async fn upload_snapshot(
		&self,
		provider: &dyn OperationSyncProvider,
		entry: &OperationLogEntry,
		cipher: Option<&PayloadCipher>,
		tracker: &mut ServerSeqTracker,
	) -> Result<bool, Error> {
		let op = &entry.op;
		let state = op.payload.to_wire_value()?;
		let (state, is_encrypted) = match cipher {
			Some(cipher) => (Value::String(cipher.encrypt_value(&state)?), true),
			None => (state, false),
		};

		let response = match provider
			.upload_snapshot(SnapshotUpload {
				state,
				client_id: op.client_id.clone(),
				reason: SnapshotReason::from(op.op_type),
				vector_clock: op.vector_clock.clone(),
				schema_version: op.schema_version,
				is_encrypted,
			})
			.await
		{
			Ok(response) => response,
			Err(e) if is_transient_provider_error(&e) => {
				warn!(?e, op_id = %op.id, "Snapshot upload failed, will retry;");
				return Ok(false);
			}
			Err(e) => return Err(e.into()),
		};

		if response.accepted {
			self.ctx.store.mark_synced(&[entry.seq]).await?;
			if let Some(server_seq) = response.server_seq {
				tracker.observe(server_seq);
			}
			info!(op_id = %op.id, op_type = %op.op_type, "Uploaded snapshot;");
			return Ok(true);
		}

		let message = response.error.unwrap_or_default();
		if is_transient_error(&message) {
			warn!(op_id = %op.id, %message, "Snapshot rejected transiently, will retry;");
		} else {
			error!(op_id = %op.id, %message, "Snapshot rejected;");
			let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;
			self.ctx.store.mark_rejected(&[op.id]).await?;
		}

		Ok(false)
	}

	async fn upload_to_files(
		&self,
		provider: &dyn FileSyncProvider,
		pending: Vec<OperationLogEntry>,
		cipher: Option<&PayloadCipher>,
	) -> Result<UploadResult, Error> {
		let mut remote_manifest = manifest::load_remote_manifest(provider).await?;
		let mut new_files = 0_usize;
		let mut result = UploadResult::default();

		let outcome = self
			.upload_op_files(
				provider,
				&pending,
				cipher,
				&mut remote_manifest,
				&mut new_files,
				&mut result,
			)
			.await;

		// Files uploaded before a failure still have to be listed
		if new_files > 0 {
			manifest::upload_remote_manifest(provider, &remote_manifest).await?;
		}
		outcome?;

		if new_files > 0
			&& (new_files >= self.ctx.config.remote_cleanup_new_files
				|| remote_manifest.operation_files.len()
					> self.ctx.config.remote_cleanup_manifest_files)
		{
			if let Err(e) = self.prune_remote_files(provider, &mut remote_manifest).await {
				warn!(?e, "Remote cleanup after upload failed;");
			}
		}

		info!(
			new_files,
			uploaded = result.uploaded_count,
			"Uploaded pending operation files;"
		);

		Ok(result)
	}

	async fn prune_remote_files(
		&self,
		provider: &dyn FileSyncProvider,
		remote_manifest: &mut manifest::OperationLogManifest,
	) -> Result<usize, ProviderError> {
		let retention = i64::try_from(self.ctx.config.remote_file_retention_ms).unwrap_or(i64::MAX);
		let cutoff = self.ctx.time.now_ms().saturating_sub(retention);
		manifest::cleanup_remote_files(provider, remote_manifest, cutoff).await
	}

	/// Deletes operation files past the remote retention. Operation servers
	/// manage their own storage, so API providers report 0.
	#[instrument(skip_all, fields(api = provider.is_api()), err)]
	pub async fn cleanup_remote_files(&self, provider: &SyncProvider) -> Result<usize, Error> {
		let SyncProvider::File(provider) = provider else {
			return Ok(0);
		};

		let _guard = self.ctx.locks.acquire(LOCK_UPLOAD).await?;
		let mut remote_manifest = manifest::load_remote_manifest(provider.as_ref()).await?;
		Ok(self
			.prune_remote_files(provider.as_ref(), &mut remote_manifest)
			.await?)
	}

	async fn upload_op_files(
		&self,
		provider: &dyn FileSyncProvider,
		pending: &[OperationLogEntry],
		cipher: Option<&PayloadCipher>,
		remote_manifest: &mut manifest::OperationLogManifest,
		new_files: &mut usize,
		result: &mut UploadResult,
	) -> Result<(), Error> {
		for chunk in pending.chunks(self.ctx.config.file_batch_size.max(1)) {
			let Some(first) = chunk.first() else {
				continue;
			};

			let path = ops_file_path(&first.op.client_id, first.op.timestamp);
			let seqs = chunk.iter().map(|entry| entry.seq).collect::<Vec<_>>();

			if remote_manifest.contains(&path) {
				debug!(%path, "Operation file already uploaded, skipping;");
				self.ctx.store.mark_synced(&seqs).await?;
				continue;
			}

			let mut wire = chunk
				.iter()
				.map(|entry| SyncOperation::try_from(&entry.op))
				.collect::<Result<Vec<_>, _>>()?;
			if let Some(cipher) = cipher {
				cipher.encrypt_ops(&mut wire)?;
			}

			provider
				.upload_file(&path, &encode_ops_file(&wire)?, None)
				.await?;
			remote_manifest.insert(path);
			*new_files += 1;

			self.ctx.store.mark_synced(&seqs).await?;
			result.uploaded_count += chunk.len();
		}

		Ok(())
	}

	fn notify_open_failure(&self, e: &Error) {
		match e {
			Error::EncryptionPasswordRequired => {
				self.ctx.notifier.notify(Notice::EncryptionPasswordRequired);
			}
			Error::Encryption(_) => self.ctx.notifier.notify(Notice::DecryptionFailed),
			_ => {}
		}
	}
}

/// Highest server sequence seen so far; never moves backwards
#[derive(Debug, Clone, Copy)]
struct ServerSeqTracker(u64);

impl ServerSeqTracker {
	const fn new(stored: u64) -> Self {
		Self(stored)
	}

	fn observe(&mut self, seq: u64) {
		self.0 = self.0.max(seq);
	}

	const fn current(self) -> u64 {
		self.0
	}
}

/// Marks operations the server refused, after the remote operations from the
/// same exchange were processed.
pub struct RejectedOpsHandler {
	ctx: Arc<SyncContext>,
}

impl RejectedOpsHandler {
	#[must_use]
	pub const fn new(ctx: Arc<SyncContext>) -> Self {
		Self { ctx }
	}

	/// Returns how many operations were marked rejected.
	///
	/// Transient failures and entries that got synced or rejected in the
	/// meantime are left alone.
	pub async fn handle(&self, rejected: &[RejectedOp]) -> Result<usize, Error> {
		if rejected.is_empty() {
			return Ok(0);
		}

		let _guard = self.ctx.locks.acquire(LOCK_OP_LOG).await?;

		let mut to_mark = Vec::with_capacity(rejected.len());
		for RejectedOp { op_id, error } in rejected {
			if is_transient_error(error) {
				warn!(%op_id, %error, "Transient rejection, will retry;");
				continue;
			}

			match self.ctx.store.get_op_by_id(*op_id).await? {
				Some(entry) if entry.is_pending() => {
					debug!(%op_id, %error, "Marking operation rejected;");
					to_mark.push(*op_id);
				}
				_ => trace!(%op_id, "Rejected operation already settled;"),
			}
		}

		if to_mark.is_empty() {
			return Ok(0);
		}

		self.ctx.store.mark_rejected(&to_mark).await?;
		info!(count = to_mark.len(), "Marked server-rejected operations;");

		if to_mark.len() >= self.ctx.config.rejected_ops_warning_threshold {
			self.ctx.notifier.notify(Notice::UploadOpsRejected {
				count: to_mark.len(),
			});
		}

		Ok(to_mark.len())
	}
}
