use crate::{
	domain::{DomainError, LegacyMetaBridge},
	notify::Notifier,
};

use sp_op_log::{ClientId, LockService, OpLogConfig, OpLogStore, SystemTimeSource, TimeSource};

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use tokio::sync::OnceCell;
use tracing::debug;

/// Client id, loaded on first use and kept for the lifetime of the process
pub struct ClientIdCache {
	bridge: Arc<dyn LegacyMetaBridge>,
	cell: OnceCell<ClientId>,
}

impl ClientIdCache {
	#[must_use]
	pub fn new(bridge: Arc<dyn LegacyMetaBridge>) -> Self {
		Self {
			bridge,
			cell: OnceCell::new(),
		}
	}

	pub async fn get(&self) -> Result<ClientId, DomainError> {
		self.cell
			.get_or_try_init(|| async {
				let client_id = self.bridge.load_client_id().await?;
				debug!(%client_id, "Loaded client id;");
				Ok::<_, DomainError>(client_id)
			})
			.await
			.cloned()
	}
}

/// Everything the sync services share
pub struct SyncContext {
	pub store: Arc<dyn OpLogStore>,
	pub locks: LockService,
	pub config: Arc<OpLogConfig>,
	pub time: Arc<dyn TimeSource>,
	pub notifier: Arc<dyn Notifier>,
	pub client_id: ClientIdCache,
	pub legacy: Arc<dyn LegacyMetaBridge>,
	sync_in_progress: AtomicBool,
}

impl SyncContext {
	#[must_use]
	pub fn new(
		store: Arc<dyn OpLogStore>,
		config: OpLogConfig,
		legacy: Arc<dyn LegacyMetaBridge>,
		notifier: Arc<dyn Notifier>,
	) -> Self {
		Self {
			store,
			locks: LockService::new(&config),
			config: Arc::new(config),
			time: Arc::new(SystemTimeSource),
			notifier,
			client_id: ClientIdCache::new(Arc::clone(&legacy)),
			legacy,
			sync_in_progress: AtomicBool::new(false),
		}
	}

	#[must_use]
	pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
		self.time = time;
		self
	}

	#[must_use]
	pub fn with_locks(mut self, locks: LockService) -> Self {
		self.locks = locks;
		self
	}

	/// A full sync (download, apply, upload) is currently running
	#[must_use]
	pub fn is_sync_in_progress(&self) -> bool {
		self.sync_in_progress.load(Ordering::Acquire)
	}

	pub(crate) fn set_sync_in_progress(&self, value: bool) {
		self.sync_in_progress.store(value, Ordering::Release);
	}
}
