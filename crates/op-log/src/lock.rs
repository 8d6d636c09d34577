//! Named mutual exclusion shared by every context using the same storage.
//!
//! Compaction, local writes, uploads and downloads each run under a named
//! lock. The primary implementation is an advisory file lock per name, which
//! also serializes separate processes opening the same log. When no lock
//! directory is usable we fall back to process-local mutexes and say so once.

use crate::config::OpLogConfig;

use std::{
	collections::HashMap,
	fs::{File, OpenOptions},
	future::Future,
	io,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use fs2::FileExt;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, trace, warn};

/// Serializes local writes and compaction
pub const LOCK_OP_LOG: &str = "sp_op_log";
/// Serializes upload passes
pub const LOCK_UPLOAD: &str = "sp_op_log_upload";
/// Serializes download passes
pub const LOCK_DOWNLOAD: &str = "sp_op_log_download";
/// Serializes quota recovery so only one context runs an emergency compaction
pub const LOCK_QUOTA_EXCEEDED: &str = "sp_quota_exceeded";

#[derive(Debug, Error)]
pub enum LockError {
	#[error("failed to open lock file <path='{}'>: {1}", .0.display())]
	Open(PathBuf, #[source] io::Error),
	#[error("failed to acquire lock <name='{0}'>: {1}")]
	Acquire(String, #[source] io::Error),
	#[error("lock task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// Held lock; dropping it releases the lock, including on error, panic and
/// cancellation of the owning future.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
	name: String,
	file: Option<File>,
	_local: OwnedMutexGuard<()>,
}

impl LockGuard {
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Some(file) = self.file.take() {
			if let Err(e) = FileExt::unlock(&file) {
				error!(?e, name = %self.name, "Failed to release file lock;");
			}
		}
		trace!(name = %self.name, "Released lock;");
	}
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
	async fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;

	/// Whether the lock also excludes other processes
	fn is_cross_process(&self) -> bool;
}

/// Process-local named mutexes
#[derive(Default)]
pub struct ProcessLock {
	locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
	warn_on_first_use: bool,
	warned: AtomicBool,
}

impl ProcessLock {
	/// Fallback used when cross-process locking is unavailable
	#[must_use]
	pub fn fallback() -> Self {
		Self {
			warn_on_first_use: true,
			..Default::default()
		}
	}

	async fn acquire_local(&self, name: &str) -> OwnedMutexGuard<()> {
		let mutex = {
			let mut locks = self.locks.lock().await;
			Arc::clone(locks.entry(name.to_owned()).or_default())
		};

		mutex.lock_owned().await
	}
}

#[async_trait]
impl DistributedLock for ProcessLock {
	async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
		if self.warn_on_first_use && !self.warned.swap(true, Ordering::Relaxed) {
			warn!(
				"Cross-process locking is unavailable, falling back to process-local locks. \
				Running several instances against the same log may corrupt it;"
			);
		}

		let local = self.acquire_local(name).await;
		trace!(%name, "Acquired process lock;");

		Ok(LockGuard {
			name: name.to_owned(),
			file: None,
			_local: local,
		})
	}

	fn is_cross_process(&self) -> bool {
		false
	}
}

/// One exclusive advisory lock file per name inside `dir`
///
/// Waiters inside the same process queue on a local mutex first, so only one
/// blocking thread per name ever waits on the file.
pub struct FileLock {
	dir: PathBuf,
	local: ProcessLock,
}

impl FileLock {
	pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir)?;

		Ok(Self {
			dir,
			local: ProcessLock::default(),
		})
	}
}

#[async_trait]
impl DistributedLock for FileLock {
	async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
		let local = self.local.acquire_local(name).await;

		let path = self.dir.join(format!("{name}.lock"));
		let owned_name = name.to_owned();
		let file = tokio::task::spawn_blocking(move || {
			let file = OpenOptions::new()
				.create(true)
				.read(true)
				.write(true)
				.truncate(false)
				.open(&path)
				.map_err(|e| LockError::Open(path, e))?;

			file.lock_exclusive()
				.map_err(|e| LockError::Acquire(owned_name, e))?;

			Ok::<_, LockError>(file)
		})
		.await??;

		trace!(%name, "Acquired file lock;");

		Ok(LockGuard {
			name: name.to_owned(),
			file: Some(file),
			_local: local,
		})
	}

	fn is_cross_process(&self) -> bool {
		true
	}
}

/// Entry point used by the sync services to run work under a named lock
#[derive(Clone)]
pub struct LockService {
	inner: Arc<dyn DistributedLock>,
}

impl LockService {
	/// Picks the lock implementation once, at start-up
	#[must_use]
	pub fn new(config: &OpLogConfig) -> Self {
		if let Some(dir) = &config.lock_dir {
			match FileLock::new(dir) {
				Ok(lock) => return Self::with_lock(Arc::new(lock)),
				Err(e) => {
					error!(?e, dir = %dir.display(), "Failed to prepare lock directory;");
				}
			}
		}

		Self::with_lock(Arc::new(ProcessLock::fallback()))
	}

	#[must_use]
	pub fn with_lock(inner: Arc<dyn DistributedLock>) -> Self {
		Self { inner }
	}

	pub async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
		self.inner.acquire(name).await
	}

	/// Runs `work` while holding the lock called `name`
	pub async fn request<F, T>(&self, name: &str, work: F) -> Result<T, LockError>
	where
		F: Future<Output = T> + Send,
	{
		let _guard = self.acquire(name).await?;
		Ok(work.await)
	}

	#[must_use]
	pub fn is_cross_process(&self) -> bool {
		self.inner.is_cross_process()
	}
}
