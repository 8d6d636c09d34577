//! Contract with the remote side.
//!
//! A provider either speaks the operation API (ordered server sequence,
//! piggybacked operations, snapshots) or only stores files. Which one we talk
//! to is resolved once, when the [`SyncProvider`] is built.

use sp_op_log::{ClientId, OpType, Operation, OperationPayload, VectorClock};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
	#[error("network error: {0}")]
	Network(String),
	#[error("server error <status={status}>: {message}")]
	Server { status: u16, message: String },
	#[error("file not found <path='{0}'>")]
	NotFound(String),
	#[error("revision mismatch <path='{0}'>")]
	Conflict(String),
	#[error("provider error: {0}")]
	Other(String),
}

/// Operation as it travels on the wire
///
/// `payload` is the flattened payload, or a base64 ciphertext string when
/// `is_payload_encrypted` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
	pub id: Uuid,
	pub client_id: ClientId,
	pub action_type: String,
	pub op_type: OpType,
	pub entity_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entity_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entity_ids: Option<Vec<String>>,
	pub payload: Value,
	pub vector_clock: VectorClock,
	pub timestamp: i64,
	pub schema_version: u32,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub is_payload_encrypted: bool,
}

impl TryFrom<&Operation> for SyncOperation {
	type Error = serde_json::Error;

	fn try_from(op: &Operation) -> Result<Self, Self::Error> {
		Ok(Self {
			id: op.id,
			client_id: op.client_id.clone(),
			action_type: op.action_type.clone(),
			op_type: op.op_type,
			entity_type: op.entity_type.clone(),
			entity_id: op.entity_id.clone(),
			entity_ids: op.entity_ids.clone(),
			payload: op.payload.to_wire_value()?,
			vector_clock: op.vector_clock.clone(),
			timestamp: op.timestamp,
			schema_version: op.schema_version,
			is_payload_encrypted: false,
		})
	}
}

impl TryFrom<SyncOperation> for Operation {
	type Error = ProviderError;

	fn try_from(op: SyncOperation) -> Result<Self, Self::Error> {
		if op.is_payload_encrypted {
			return Err(ProviderError::Other(format!(
				"operation payload is still encrypted <op_id='{}'>",
				op.id
			)));
		}

		let payload = OperationPayload::from_wire_value(op.op_type, op.payload).map_err(|e| {
			ProviderError::Other(format!("malformed payload <op_id='{}'>: {e}", op.id))
		})?;

		Ok(Self {
			id: op.id,
			client_id: op.client_id,
			action_type: op.action_type,
			op_type: op.op_type,
			entity_type: op.entity_type,
			entity_id: op.entity_id,
			entity_ids: op.entity_ids,
			payload,
			vector_clock: op.vector_clock,
			timestamp: op.timestamp,
			schema_version: op.schema_version,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpUploadResult {
	pub op_id: Uuid,
	pub accepted: bool,
	#[serde(default)]
	pub server_seq: Option<u64>,
	#[serde(default)]
	pub error: Option<String>,
}

/// Operation stored on the server, with its position in the server order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOperation {
	pub server_seq: u64,
	pub received_at: i64,
	pub op: SyncOperation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOpsResponse {
	pub results: Vec<OpUploadResult>,
	pub latest_seq: u64,
	/// Operations from other clients returned alongside the upload
	#[serde(default)]
	pub new_ops: Option<Vec<ServerOperation>>,
	#[serde(default)]
	pub has_more_piggyback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOpsResponse {
	pub ops: Vec<ServerOperation>,
	pub has_more: bool,
	pub latest_seq: u64,
	/// The requested position no longer exists on the server
	#[serde(default)]
	pub gap_detected: bool,
	#[serde(default)]
	pub server_time: Option<i64>,
	/// Clock covering every operation folded into a server-side snapshot
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub snapshot_vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotReason {
	Initial,
	Recovery,
}

impl From<OpType> for SnapshotReason {
	fn from(op_type: OpType) -> Self {
		match op_type {
			OpType::SyncImport => Self::Initial,
			_ => Self::Recovery,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpload {
	/// Full state, or its base64 ciphertext when `is_encrypted` is set
	pub state: Value,
	pub client_id: ClientId,
	pub reason: SnapshotReason,
	pub vector_clock: VectorClock,
	pub schema_version: u32,
	pub is_encrypted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUploadResponse {
	pub accepted: bool,
	#[serde(default)]
	pub server_seq: Option<u64>,
	#[serde(default)]
	pub error: Option<String>,
}

/// Per-account settings kept on the provider side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateConfig {
	#[serde(default)]
	pub encryption_enabled: bool,
	#[serde(default)]
	pub encrypt_key: Option<String>,
}

impl PrivateConfig {
	/// Password to encrypt with, only when encryption is switched on
	#[must_use]
	pub fn active_key(&self) -> Option<&str> {
		self.encrypt_key
			.as_deref()
			.filter(|key| self.encryption_enabled && !key.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
	pub data: String,
	pub rev: Option<String>,
}

#[async_trait]
pub trait OperationSyncProvider: Send + Sync {
	/// Authenticated and configured
	async fn is_ready(&self) -> bool;

	async fn get_last_server_seq(&self) -> Result<u64, ProviderError>;

	async fn set_last_server_seq(&self, seq: u64) -> Result<(), ProviderError>;

	async fn upload_ops(
		&self,
		ops: &[SyncOperation],
		client_id: &ClientId,
		last_known_server_seq: Option<u64>,
	) -> Result<UploadOpsResponse, ProviderError>;

	async fn download_ops(
		&self,
		since_seq: u64,
		exclude_client: Option<&ClientId>,
		limit: usize,
	) -> Result<DownloadOpsResponse, ProviderError>;

	async fn upload_snapshot(
		&self,
		snapshot: SnapshotUpload,
	) -> Result<SnapshotUploadResponse, ProviderError>;

	async fn acknowledge_ops(
		&self,
		_client_id: &ClientId,
		_upto_seq: u64,
	) -> Result<(), ProviderError> {
		Ok(())
	}

	async fn load_private_config(&self) -> Result<Option<PrivateConfig>, ProviderError> {
		Ok(None)
	}
}

#[async_trait]
pub trait FileSyncProvider: Send + Sync {
	async fn is_ready(&self) -> bool;

	/// Writes `content` at `path` and returns the new revision
	async fn upload_file(
		&self,
		path: &str,
		content: &str,
		expected_rev: Option<&str>,
	) -> Result<String, ProviderError>;

	/// A missing file is reported as [`ProviderError::NotFound`]
	async fn download_file(&self, path: &str) -> Result<DownloadedFile, ProviderError>;

	async fn list_files(&self, dir: &str) -> Result<Vec<String>, ProviderError>;

	/// A missing file is reported as [`ProviderError::NotFound`]
	async fn remove_file(&self, path: &str) -> Result<(), ProviderError>;

	async fn load_private_config(&self) -> Result<Option<PrivateConfig>, ProviderError> {
		Ok(None)
	}
}

#[derive(Clone)]
pub enum SyncProvider {
	Api(Arc<dyn OperationSyncProvider>),
	File(Arc<dyn FileSyncProvider>),
}

impl SyncProvider {
	#[must_use]
	pub const fn is_api(&self) -> bool {
		matches!(self, Self::Api(_))
	}

	pub async fn is_ready(&self) -> bool {
		match self {
			Self::Api(provider) => provider.is_ready().await,
			Self::File(provider) => provider.is_ready().await,
		}
	}

	pub async fn load_private_config(&self) -> Result<Option<PrivateConfig>, ProviderError> {
		match self {
			Self::Api(provider) => provider.load_private_config().await,
			Self::File(provider) => provider.load_private_config().await,
		}
	}
}
