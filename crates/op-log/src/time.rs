//! Injectable wall clock
//!
//! Timestamps in the log (`applied_at`, `synced_at`, compaction cutoffs, drift
//! checks) all go through a [`TimeSource`] so retention and drift logic can be
//! exercised deterministically.

use std::sync::{
	atomic::{AtomicI64, Ordering},
	Arc,
};

pub trait TimeSource: Send + Sync {
	/// Milliseconds since the Unix epoch
	fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
	fn now_ms(&self) -> i64 {
		chrono::Utc::now().timestamp_millis()
	}
}

/// Manually driven clock, shared between clones
#[derive(Debug, Clone)]
pub struct FakeTimeSource {
	time: Arc<AtomicI64>,
}

impl Default for FakeTimeSource {
	fn default() -> Self {
		Self::new(1_000)
	}
}

impl FakeTimeSource {
	#[must_use]
	pub fn new(initial_ms: i64) -> Self {
		Self {
			time: Arc::new(AtomicI64::new(initial_ms)),
		}
	}

	pub fn advance(&self, delta_ms: i64) {
		self.time.fetch_add(delta_ms, Ordering::SeqCst);
	}

	pub fn set(&self, time_ms: i64) {
		self.time.store(time_ms, Ordering::SeqCst);
	}
}

impl TimeSource for FakeTimeSource {
	fn now_ms(&self) -> i64 {
		self.time.load(Ordering::SeqCst)
	}
}
