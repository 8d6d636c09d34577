//! Index of operation files kept next to them on file-based providers.

use crate::provider::{FileSyncProvider, ProviderError, SyncOperation};

use sp_op_log::ClientId;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub const OPS_DIR: &str = "ops/";
pub const MANIFEST_PATH: &str = "ops/manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogManifest {
	pub version: u32,
	/// Full paths of every uploaded operation file, sorted
	#[serde(default)]
	pub operation_files: Vec<String>,
}

impl Default for OperationLogManifest {
	fn default() -> Self {
		Self {
			version: MANIFEST_VERSION,
			operation_files: Vec::new(),
		}
	}
}

impl OperationLogManifest {
	#[must_use]
	pub fn contains(&self, path: &str) -> bool {
		self.operation_files.iter().any(|file| file == path)
	}

	/// Adds `path` unless it is already listed, keeping the list sorted
	pub fn insert(&mut self, path: String) -> bool {
		match self.operation_files.binary_search(&path) {
			Ok(_) => false,
			Err(idx) => {
				self.operation_files.insert(idx, path);
				true
			}
		}
	}

	/// Drops files whose first operation is older than `cutoff_ms` and returns
	/// them. Names without a timestamp are kept.
	pub fn prune_older_than(&mut self, cutoff_ms: i64) -> Vec<String> {
		let (pruned, kept) = self
			.operation_files
			.drain(..)
			.partition(|path| file_timestamp(path).is_some_and(|ts| ts < cutoff_ms));
		self.operation_files = kept;
		pruned
	}
}

/// `ops/ops_{client}_{timestamp}.json`, named after the first operation it holds
#[must_use]
pub fn ops_file_path(client_id: &ClientId, first_op_timestamp: i64) -> String {
	format!("{OPS_DIR}ops_{client_id}_{first_op_timestamp}.json")
}

/// Timestamp part of an operation file name
#[must_use]
pub fn file_timestamp(path: &str) -> Option<i64> {
	path.strip_suffix(".json")?
		.rsplit_once('_')
		.and_then(|(_, ts)| ts.parse().ok())
}

#[must_use]
pub fn is_ops_file(path: &str) -> bool {
	path.strip_prefix(OPS_DIR)
		.is_some_and(|name| name.starts_with("ops_") && name.ends_with(".json"))
}

/// A missing manifest reads as an empty one
pub async fn load_remote_manifest(
	provider: &dyn FileSyncProvider,
) -> Result<OperationLogManifest, ProviderError> {
	match provider.download_file(MANIFEST_PATH).await {
		Ok(file) => {
			let mut manifest: OperationLogManifest = serde_json::from_str(&file.data)
				.map_err(|e| ProviderError::Other(format!("malformed manifest: {e}")))?;
			manifest.operation_files.sort();
			manifest.operation_files.dedup();
			trace!(files = manifest.operation_files.len(), "Loaded remote manifest;");
			Ok(manifest)
		}
		Err(ProviderError::NotFound(_)) => {
			debug!("Remote manifest not found, starting a new one;");
			Ok(OperationLogManifest::default())
		}
		Err(e) => Err(e),
	}
}

/// Always overwrites the remote copy
pub async fn upload_remote_manifest(
	provider: &dyn FileSyncProvider,
	manifest: &OperationLogManifest,
) -> Result<(), ProviderError> {
	let content = serde_json::to_string(manifest)
		.map_err(|e| ProviderError::Other(format!("failed to encode manifest: {e}")))?;
	provider.upload_file(MANIFEST_PATH, &content, None).await?;
	debug!(files = manifest.operation_files.len(), "Uploaded remote manifest;");
	Ok(())
}

/// Removes operation files older than `cutoff_ms` from the remote side and
/// returns how many were dropped from the manifest.
///
/// The pruned manifest is uploaded before any file is deleted, so readers
/// never see a listed file that is gone. Deletions that fail only leave
/// orphans behind and are logged.
pub async fn cleanup_remote_files(
	provider: &dyn FileSyncProvider,
	manifest: &mut OperationLogManifest,
	cutoff_ms: i64,
) -> Result<usize, ProviderError> {
	let pruned = manifest.prune_older_than(cutoff_ms);
	if pruned.is_empty() {
		trace!("No remote operation files to clean up;");
		return Ok(0);
	}

	upload_remote_manifest(provider, manifest).await?;

	for path in &pruned {
		match provider.remove_file(path).await {
			Ok(()) => {}
			Err(ProviderError::NotFound(_)) => trace!(%path, "Remote file already gone;"),
			Err(e) => warn!(%path, ?e, "Failed to remove old remote file;"),
		}
	}

	debug!(
		removed = pruned.len(),
		kept = manifest.operation_files.len(),
		"Cleaned up remote operation files;"
	);

	Ok(pruned.len())
}

pub fn encode_ops_file(ops: &[SyncOperation]) -> Result<String, serde_json::Error> {
	serde_json::to_string(ops)
}

pub fn decode_ops_file(content: &str) -> Result<Vec<SyncOperation>, serde_json::Error> {
	serde_json::from_str(content)
}
