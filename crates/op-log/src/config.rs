use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Tunables of the operation log and the sync services built on it.
///
/// Every field has a default, so a TOML file only needs the keys it wants to
/// override. Durations are stored in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpLogConfig {
	/// Local writes between two scheduled compactions
	pub compaction_threshold: u64,
	/// Synced entries older than this are removed by a regular compaction
	pub compaction_retention_ms: u64,
	/// Retention used when the storage quota is exhausted
	pub emergency_compaction_retention_ms: u64,
	/// Consecutive failed compactions before the user is told
	pub max_compaction_failures: u32,
	/// Compactions slower than this are logged as a slow-path metric
	pub slow_compaction_threshold_ms: u64,

	pub upload_batch_size: usize,
	pub file_batch_size: usize,
	pub download_page_size: usize,
	/// Hard cap on operations accumulated by one download pass
	pub max_download_ops_in_memory: usize,
	pub max_download_iterations: usize,
	pub clock_drift_threshold_ms: u64,
	/// Rejected operations in one upload before the user is warned
	pub rejected_ops_warning_threshold: usize,

	pub immediate_upload_debounce_ms: u64,
	pub inbound_debounce_focused_ms: u64,
	pub inbound_debounce_unfocused_ms: u64,

	pub file_download_retries: u32,
	pub file_retry_base_delay_ms: u64,
	/// Operation files older than this are pruned from file providers
	pub remote_file_retention_ms: u64,
	/// New files in one upload that trigger a remote cleanup
	pub remote_cleanup_new_files: usize,
	/// Manifest size that triggers a remote cleanup
	pub remote_cleanup_manifest_files: usize,

	/// Failed attempts before a remote operation is rejected for good
	pub max_remote_apply_retries: u32,
	/// Remote operations left pending longer than this are rejected on recovery
	pub pending_remote_op_expiry_ms: u64,

	pub max_op_payload_bytes: usize,
	pub max_snapshot_payload_bytes: usize,

	/// Directory holding the cross-process lock files. Without it, locking
	/// falls back to process-local mutexes.
	pub lock_dir: Option<PathBuf>,
}

impl Default for OpLogConfig {
	fn default() -> Self {
		Self {
			compaction_threshold: 500,
			compaction_retention_ms: 7 * DAY_MS,
			emergency_compaction_retention_ms: DAY_MS,
			max_compaction_failures: 3,
			slow_compaction_threshold_ms: 3_000,
			upload_batch_size: 100,
			file_batch_size: 100,
			download_page_size: 500,
			max_download_ops_in_memory: 50_000,
			max_download_iterations: 1_000,
			clock_drift_threshold_ms: 5 * 60 * 1000,
			rejected_ops_warning_threshold: 10,
			immediate_upload_debounce_ms: 2_000,
			inbound_debounce_focused_ms: 500,
			inbound_debounce_unfocused_ms: 2_000,
			file_download_retries: 3,
			file_retry_base_delay_ms: 1_000,
			remote_file_retention_ms: 14 * DAY_MS,
			remote_cleanup_new_files: 10,
			remote_cleanup_manifest_files: 50,
			max_remote_apply_retries: 5,
			pending_remote_op_expiry_ms: DAY_MS,
			max_op_payload_bytes: 10 * 1024 * 1024,
			max_snapshot_payload_bytes: 50 * 1024 * 1024,
			lock_dir: None,
		}
	}
}

impl OpLogConfig {
	/// Reads a TOML config file, falling back to defaults for missing keys
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let raw = tokio::fs::read_to_string(path)
			.await
			.map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

		let config = Self::from_toml(&raw)?;
		debug!(path = %path.display(), "Loaded op log config;");

		Ok(config)
	}

	pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.upload_batch_size == 0 || self.file_batch_size == 0 || self.download_page_size == 0
		{
			return Err(ConfigError::Invalid("batch sizes must be greater than zero"));
		}

		if self.remote_file_retention_ms < self.compaction_retention_ms {
			return Err(ConfigError::Invalid(
				"remote file retention must cover the local retention",
			));
		}

		if self.emergency_compaction_retention_ms > self.compaction_retention_ms {
			return Err(ConfigError::Invalid(
				"emergency retention must not exceed regular retention",
			));
		}

		Ok(())
	}

	#[must_use]
	pub const fn compaction_retention(&self) -> Duration {
		Duration::from_millis(self.compaction_retention_ms)
	}

	#[must_use]
	pub const fn emergency_compaction_retention(&self) -> Duration {
		Duration::from_millis(self.emergency_compaction_retention_ms)
	}

	#[must_use]
	pub const fn slow_compaction_threshold(&self) -> Duration {
		Duration::from_millis(self.slow_compaction_threshold_ms)
	}

	#[must_use]
	pub const fn immediate_upload_debounce(&self) -> Duration {
		Duration::from_millis(self.immediate_upload_debounce_ms)
	}

	#[must_use]
	pub const fn inbound_debounce(&self, focused: bool) -> Duration {
		if focused {
			Duration::from_millis(self.inbound_debounce_focused_ms)
		} else {
			Duration::from_millis(self.inbound_debounce_unfocused_ms)
		}
	}

	#[must_use]
	pub const fn file_retry_base_delay(&self) -> Duration {
		Duration::from_millis(self.file_retry_base_delay_ms)
	}
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file <path='{}'>: {1}", .0.display())]
	Io(PathBuf, #[source] std::io::Error),
	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("invalid config: {0}")]
	Invalid(&'static str),
}
