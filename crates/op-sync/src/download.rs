//! Fetches operations other clients produced since the last sync.

use crate::{
	encryption::{open_sync_ops, PayloadCipher},
	manifest::{self, decode_ops_file, is_ops_file, OPS_DIR},
	notify::Notice,
	provider::{
		DownloadOpsResponse, DownloadedFile, FileSyncProvider, OperationSyncProvider,
		ProviderError, SyncOperation, SyncProvider,
	},
	Error, SyncContext,
};

use sp_op_log::{Operation, VectorClock, VectorClockComparison, LOCK_DOWNLOAD};

use std::{
	collections::HashSet,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadResult {
	/// Operations not yet present locally, in server order
	pub new_ops: Vec<Operation>,
	/// False when the pass stopped early or failed; `new_ops` may then hold
	/// partial progress
	pub success: bool,
	pub failed_file_count: usize,
	/// The server lost our position and holds nothing, so it has to be seeded
	/// with a full state upload
	pub needs_full_state_upload: bool,
	/// Position to persist once `new_ops` are recorded. `None` for file
	/// providers and failed passes.
	pub latest_server_seq: Option<u64>,
	/// First snapshot clock the server reported during the pass
	pub snapshot_vector_clock: Option<VectorClock>,
	/// Clock of every operation read, known ones included. Only collected
	/// when downloading from the start.
	pub all_op_clocks: Vec<VectorClock>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
	/// Ignore the stored position and read the whole server log
	pub force_from_seq0: bool,
}

/// A wall clock that just woke up may still be catching up
const CLOCK_DRIFT_RECHECK_DELAY: Duration = Duration::from_secs(1);

impl DownloadResult {
	fn failed() -> Self {
		Self::default()
	}
}

/// Operations collected during one pass, deduplicated against the local log
struct Accumulator {
	applied: HashSet<Uuid>,
	seen: HashSet<Uuid>,
	ops: Vec<Operation>,
}

impl Accumulator {
	fn new(applied: HashSet<Uuid>) -> Self {
		Self {
			applied,
			seen: HashSet::new(),
			ops: Vec::new(),
		}
	}

	fn is_new(&mut self, id: Uuid) -> bool {
		!self.applied.contains(&id) && self.seen.insert(id)
	}

	fn reset(&mut self) {
		self.seen.clear();
		self.ops.clear();
	}
}

pub struct DownloadService {
	ctx: Arc<SyncContext>,
	warned_clock_drift: AtomicBool,
}

impl DownloadService {
	#[must_use]
	pub const fn new(ctx: Arc<SyncContext>) -> Self {
		Self {
			ctx,
			warned_clock_drift: AtomicBool::new(false),
		}
	}

	pub async fn download_remote_ops(&self, provider: &SyncProvider) -> Result<DownloadResult, Error> {
		self.download_remote_ops_with(provider, DownloadOptions::default())
			.await
	}

	#[instrument(skip_all, fields(api = provider.is_api(), force = options.force_from_seq0), err)]
	pub async fn download_remote_ops_with(
		&self,
		provider: &SyncProvider,
		options: DownloadOptions,
	) -> Result<DownloadResult, Error> {
		let _guard = self.ctx.locks.acquire(LOCK_DOWNLOAD).await?;

		let cipher = provider
			.load_private_config()
			.await?
			.and_then(|config| config.active_key().map(PayloadCipher::new));

		match provider {
			SyncProvider::Api(api) => {
				self.download_from_api(api.as_ref(), cipher.as_ref(), options)
					.await
			}
			SyncProvider::File(files) => {
				self.download_from_files(files.as_ref(), cipher.as_ref())
					.await
			}
		}
	}

	async fn download_from_api(
		&self,
		provider: &dyn OperationSyncProvider,
		cipher: Option<&PayloadCipher>,
		options: DownloadOptions,
	) -> Result<DownloadResult, Error> {
		let config = &self.ctx.config;
		let stored_seq = if options.force_from_seq0 {
			warn!("Downloading the whole server log to rebuild clock state;");
			0
		} else {
			provider.get_last_server_seq().await?
		};
		let mut acc = Accumulator::new(self.ctx.store.get_applied_op_ids().await?);
		let mut snapshot_vector_clock = None;
		let mut all_op_clocks = Vec::new();

		let mut since_seq = stored_seq;
		let mut latest_seq = stored_seq;
		let mut reset_for_gap = false;
		let mut complete = true;
		let mut iterations = 0_usize;

		loop {
			iterations += 1;
			if iterations > config.max_download_iterations {
				error!(
					max_iterations = config.max_download_iterations,
					since_seq,
					"Exceeded download iterations, server keeps reporting more;"
				);
				complete = false;
				break;
			}

			let response = provider
				.download_ops(since_seq, None, config.download_page_size)
				.await?;
			latest_seq = response.latest_seq;

			if snapshot_vector_clock.is_none() {
				if let Some(clock) = &response.snapshot_vector_clock {
					debug!(clients = clock.iter().count(), "Received snapshot vector clock;");
					snapshot_vector_clock = Some(clock.clone());
				}
			}

			if response.gap_detected && !reset_for_gap {
				warn!(
					since_seq,
					latest_seq = response.latest_seq,
					"Gap detected, downloading again from the start;"
				);
				since_seq = 0;
				reset_for_gap = true;
				acc.reset();
				all_op_clocks.clear();
				snapshot_vector_clock = None;
				continue;
			}

			if response.latest_seq < stored_seq {
				warn!(
					stored_seq,
					latest_seq = response.latest_seq,
					"Server sequence went backwards;"
				);
			}

			if response.ops.is_empty() {
				break;
			}

			if let Some(server_time) = response.server_time {
				self.check_clock_drift(server_time).await;
			}

			if options.force_from_seq0 {
				all_op_clocks.extend(
					response
						.ops
						.iter()
						.map(|server_op| server_op.op.vector_clock.clone()),
				);
			}

			let DownloadOpsResponse { ops, has_more, .. } = response;
			let mut page = Vec::with_capacity(ops.len());
			let mut capped = false;

			for server_op in ops {
				if acc.is_new(server_op.op.id) {
					if acc.ops.len() + page.len() >= config.max_download_ops_in_memory {
						capped = true;
						break;
					}
					page.push(server_op.op);
				}
				since_seq = server_op.server_seq;
			}

			match open_sync_ops(page, cipher) {
				Ok(ops) => acc.ops.extend(ops),
				Err(e) => return self.fail_open(e),
			}

			if capped {
				error!(
					limit = config.max_download_ops_in_memory,
					"Too many operations to download, stopping early;"
				);
				self.ctx.notifier.notify(Notice::TooManyOpsToDownload {
					limit: config.max_download_ops_in_memory,
				});
				complete = false;
				break;
			}

			if !has_more {
				break;
			}
		}

		let needs_full_state_upload = reset_for_gap && acc.ops.is_empty() && latest_seq == 0;
		if needs_full_state_upload {
			warn!("Gap on an empty server, a full state upload is needed;");
		}

		info!(
			count = acc.ops.len(),
			complete,
			"Downloaded remote operations;"
		);

		Ok(DownloadResult {
			new_ops: acc.ops,
			success: complete,
			failed_file_count: 0,
			needs_full_state_upload,
			// A partial pass only covers what was actually read
			latest_server_seq: Some(if complete { latest_seq } else { since_seq }),
			snapshot_vector_clock,
			all_op_clocks,
		})
	}

	async fn download_from_files(
		&self,
		provider: &dyn FileSyncProvider,
		cipher: Option<&PayloadCipher>,
	) -> Result<DownloadResult, Error> {
		let mut remote_manifest = manifest::load_remote_manifest(provider).await?;

		if remote_manifest.operation_files.is_empty() {
			debug!("Manifest is empty, listing operation files;");
			let mut discovered = match provider.list_files(OPS_DIR).await {
				Ok(files) => files
					.into_iter()
					.filter(|path| is_ops_file(path))
					.collect::<Vec<_>>(),
				Err(e) => {
					error!(?e, "Failed to list remote operation files;");
					return Ok(DownloadResult::failed());
				}
			};

			if !discovered.is_empty() {
				discovered.sort();
				remote_manifest.operation_files = discovered;
				if let Err(e) = manifest::upload_remote_manifest(provider, &remote_manifest).await {
					warn!(?e, "Failed to write rebuilt manifest;");
				}
			}
		}

		if remote_manifest.operation_files.is_empty() {
			trace!("No remote operation files;");
			return Ok(DownloadResult {
				success: true,
				..DownloadResult::default()
			});
		}

		let local_clock = self.ctx.store.get_vector_clock().await?;
		let mut acc = Accumulator::new(self.ctx.store.get_applied_op_ids().await?);
		let mut failed_files = 0_usize;

		for path in &remote_manifest.operation_files {
			let wire = match self.download_file_with_retry(provider, path).await {
				Ok(file) => match decode_ops_file(&file.data) {
					Ok(ops) => ops,
					Err(e) => {
						error!(?e, %path, "Malformed operation file;");
						failed_files += 1;
						continue;
					}
				},
				Err(e) => {
					error!(?e, %path, "Failed to download operation file;");
					failed_files += 1;
					continue;
				}
			};

			let fresh = wire
				.into_iter()
				.filter(|op| {
					// Already covered by the local clock, e.g. compacted away
					!matches!(
						op.vector_clock.compare(&local_clock),
						VectorClockComparison::LessThan | VectorClockComparison::Equal
					)
				})
				.filter(|op| acc.is_new(op.id))
				.collect::<Vec<SyncOperation>>();

			match open_sync_ops(fresh, cipher) {
				Ok(ops) => acc.ops.extend(ops),
				Err(e) => return self.fail_open(e),
			}
		}

		if failed_files > 0 {
			warn!(failed_files, "Some operation files could not be downloaded;");
			self.ctx.notifier.notify(Notice::IncompleteSync { failed_files });
		}

		info!(
			count = acc.ops.len(),
			files = remote_manifest.operation_files.len(),
			"Downloaded remote operation files;"
		);

		Ok(DownloadResult {
			new_ops: acc.ops,
			success: failed_files == 0,
			failed_file_count: failed_files,
			needs_full_state_upload: false,
			..DownloadResult::default()
		})
	}

	async fn download_file_with_retry(
		&self,
		provider: &dyn FileSyncProvider,
		path: &str,
	) -> Result<DownloadedFile, ProviderError> {
		let retries = self.ctx.config.file_download_retries;
		let mut delay = self.ctx.config.file_retry_base_delay();
		let mut attempt = 0;

		loop {
			match provider.download_file(path).await {
				Ok(file) => return Ok(file),
				Err(e @ ProviderError::NotFound(_)) => return Err(e),
				Err(e) if attempt < retries => {
					attempt += 1;
					debug!(?e, %path, attempt, ?delay, "Retrying operation file download;");
					tokio::time::sleep(delay).await;
					delay = delay.saturating_mul(2);
				}
				Err(e) => return Err(e),
			}
		}
	}

	fn fail_open(&self, e: Error) -> Result<DownloadResult, Error> {
		match e {
			Error::EncryptionPasswordRequired => {
				error!("Received encrypted operations but no password is configured;");
				self.ctx.notifier.notify(Notice::EncryptionPasswordRequired);
				Ok(DownloadResult::failed())
			}
			Error::Encryption(e) => {
				error!(?e, "Failed to decrypt remote operations;");
				self.ctx.notifier.notify(Notice::DecryptionFailed);
				Ok(DownloadResult::failed())
			}
			e => Err(e),
		}
	}

	/// Compares the local clock with the server's current time, warning once
	/// per service lifetime.
	///
	/// Only the server time is meaningful here: `received_at` of old operations
	/// says nothing about the clocks.
	async fn check_clock_drift(&self, server_time: i64) {
		if self.warned_clock_drift.load(Ordering::Relaxed) {
			return;
		}

		let threshold = i64::try_from(self.ctx.config.clock_drift_threshold_ms).unwrap_or(i64::MAX);
		if (self.ctx.time.now_ms() - server_time).abs() <= threshold {
			return;
		}

		tokio::time::sleep(CLOCK_DRIFT_RECHECK_DELAY).await;

		let drift_ms = self.ctx.time.now_ms() - server_time;

		if drift_ms.abs() > threshold && !self.warned_clock_drift.swap(true, Ordering::Relaxed) {
			let minutes = (drift_ms.abs() + 30_000) / 60_000;
			warn!(
				minutes,
				client_ahead = drift_ms > 0,
				"Clock drift detected;"
			);
			self.ctx.notifier.notify(Notice::ClockDrift { minutes });
		}
	}
}
