use crate::vector_clock::VectorClock;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Schema version stamped on every operation and state cache written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Stable identifier of one client installation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for ClientId {
	fn from(value: &str) -> Self {
		Self(value.to_owned())
	}
}

impl From<String> for ClientId {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
	#[serde(rename = "CRT")]
	Create,
	#[serde(rename = "UPD")]
	Update,
	#[serde(rename = "DEL")]
	Delete,
	#[serde(rename = "SYNC_IMPORT")]
	SyncImport,
	#[serde(rename = "BACKUP_IMPORT")]
	BackupImport,
	#[serde(rename = "REPAIR")]
	Repair,
}

impl OpType {
	/// Full-state operations replace the whole application state instead of
	/// describing a change to some entities.
	#[must_use]
	pub const fn is_full_state(self) -> bool {
		matches!(self, Self::SyncImport | Self::BackupImport | Self::Repair)
	}

	/// Rank used to pick the aggregate type of a multi-entity operation.
	/// Delete outranks Create, which outranks Update.
	#[must_use]
	pub const fn priority(self) -> u8 {
		match self {
			Self::Delete => 3,
			Self::Create => 2,
			Self::Update => 1,
			Self::SyncImport | Self::BackupImport | Self::Repair => 0,
		}
	}

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Create => "CRT",
			Self::Update => "UPD",
			Self::Delete => "DEL",
			Self::SyncImport => "SYNC_IMPORT",
			Self::BackupImport => "BACKUP_IMPORT",
			Self::Repair => "REPAIR",
		}
	}
}

impl fmt::Display for OpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Change to a single entity inside a multi-entity operation
///
/// `op_type` is the real kind of change for this entity and may differ from
/// the aggregate type of the enclosing operation. `changes` holds either the
/// field diff (updates) or the full entity snapshot (creates and deletes) and
/// is flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
	pub entity_type: String,
	pub entity_id: String,
	pub op_type: OpType,
	#[serde(flatten)]
	pub changes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiEntityPayload {
	pub action_payload: Value,
	#[serde(default)]
	pub entity_changes: Vec<EntityChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationPayload {
	MultiEntity(MultiEntityPayload),
	FullState(Value),
}

impl OperationPayload {
	/// Flattens the payload into the shape sent over the wire, where the
	/// operation type alone tells the receiver how to read it back.
	pub fn to_wire_value(&self) -> Result<Value, serde_json::Error> {
		match self {
			Self::MultiEntity(payload) => serde_json::to_value(payload),
			Self::FullState(state) => Ok(state.clone()),
		}
	}

	pub fn from_wire_value(op_type: OpType, value: Value) -> Result<Self, serde_json::Error> {
		if op_type.is_full_state() {
			return Ok(Self::FullState(value));
		}

		// Older clients sent the bare action payload without entity changes
		match value {
			Value::Object(ref map) if map.contains_key("actionPayload") => {
				serde_json::from_value(value).map(Self::MultiEntity)
			}
			other => Ok(Self::MultiEntity(MultiEntityPayload {
				action_payload: other,
				entity_changes: Vec::new(),
			})),
		}
	}
}

/// One immutable, client-produced state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
	pub id: Uuid,
	pub client_id: ClientId,
	pub action_type: String,
	pub op_type: OpType,
	pub entity_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entity_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entity_ids: Option<Vec<String>>,
	pub payload: OperationPayload,
	pub vector_clock: VectorClock,
	pub timestamp: i64,
	pub schema_version: u32,
}

impl Operation {
	#[must_use]
	pub const fn is_full_state(&self) -> bool {
		self.op_type.is_full_state()
	}

	/// Every entity id this operation touches, without duplicates
	#[must_use]
	pub fn touched_entity_ids(&self) -> Vec<&str> {
		let changes = match &self.payload {
			OperationPayload::MultiEntity(payload) => payload.entity_changes.as_slice(),
			OperationPayload::FullState(_) => &[],
		};

		let mut ids = Vec::<&str>::new();
		for id in self
			.entity_id
			.as_deref()
			.into_iter()
			.chain(self.entity_ids.iter().flatten().map(String::as_str))
			.chain(changes.iter().map(|change| change.entity_id.as_str()))
		{
			if !ids.contains(&id) {
				ids.push(id);
			}
		}

		ids
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
	Local,
	Remote,
}

impl OpSource {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Local => "local",
			Self::Remote => "remote",
		}
	}
}

impl TryFrom<&str> for OpSource {
	type Error = String;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		match value {
			"local" => Ok(Self::Local),
			"remote" => Ok(Self::Remote),
			other => Err(format!("unknown operation source: {other}")),
		}
	}
}

/// How far a remote operation got into the application state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
	/// Recorded, not yet handed to the application
	Pending,
	Applied,
	/// Handed over but refused; retried later
	Failed,
}

impl ApplicationStatus {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Applied => "applied",
			Self::Failed => "failed",
		}
	}
}

impl TryFrom<&str> for ApplicationStatus {
	type Error = String;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		match value {
			"pending" => Ok(Self::Pending),
			"applied" => Ok(Self::Applied),
			"failed" => Ok(Self::Failed),
			other => Err(format!("unknown application status: {other}")),
		}
	}
}

/// Operation as recorded in the local log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
	pub seq: u64,
	pub op: Operation,
	pub applied_at: i64,
	pub source: OpSource,
	pub synced_at: Option<i64>,
	pub rejected_at: Option<i64>,
	/// Only set for remote entries
	pub application_status: Option<ApplicationStatus>,
	/// Failed attempts to apply a remote entry
	pub retry_count: u32,
}

impl OperationLogEntry {
	/// Still waiting to be replicated: neither accepted nor permanently rejected
	#[must_use]
	pub const fn is_pending(&self) -> bool {
		self.synced_at.is_none() && self.rejected_at.is_none()
	}
}

/// Snapshot of the full application state at a log position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCache {
	pub state: Value,
	pub last_applied_op_seq: u64,
	pub vector_clock: VectorClock,
	pub compacted_at: i64,
	pub schema_version: u32,
	/// `ENTITY_TYPE:id` of every entity present in `state`
	#[serde(default)]
	pub snapshot_entity_keys: Vec<String>,
}
