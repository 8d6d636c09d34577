use tokio::sync::broadcast;
use tracing::trace;

/// User-facing conditions raised by the sync engine
///
/// Variants flagged with [`Notice::suggests_reload`] leave the client in a
/// state where reloading the application is the recommended way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
	/// Local changes are all on the server
	InSync,
	/// Storage filled up but an emergency compaction freed enough room
	StorageRecovered,
	StorageQuotaExceeded,
	PersistFailed { reason: String },
	InvalidOperationPayload { reason: String },
	CompactionFailing { consecutive_failures: u32 },
	UploadOpsRejected { count: usize },
	TooManyOpsToDownload { limit: usize },
	IncompleteSync { failed_files: usize },
	ClockDrift { minutes: i64 },
	/// Remote operations could not be applied and wait for a retry
	RemoteApplyFailed { failed: usize },
	EncryptionPasswordRequired,
	DecryptionFailed,
}

impl Notice {
	#[must_use]
	pub const fn suggests_reload(&self) -> bool {
		matches!(
			self,
			Self::StorageQuotaExceeded
				| Self::PersistFailed { .. }
				| Self::InvalidOperationPayload { .. }
				| Self::RemoteApplyFailed { .. }
		)
	}
}

pub trait Notifier: Send + Sync {
	fn notify(&self, notice: Notice);
}

/// Fans notices out to every subscriber; notices without subscribers are dropped
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
	tx: broadcast::Sender<Notice>,
}

impl BroadcastNotifier {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
		self.tx.subscribe()
	}
}

impl Default for BroadcastNotifier {
	fn default() -> Self {
		Self::new(64)
	}
}

impl Notifier for BroadcastNotifier {
	fn notify(&self, notice: Notice) {
		if self.tx.send(notice).is_err() {
			trace!("No notice subscribers;");
		}
	}
}
