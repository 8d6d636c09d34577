//! Structural checks run on every operation before it is persisted.
//!
//! Hard failures stop the write. Soft findings are returned as warnings and
//! logged by the caller; they describe payloads older clients produce and
//! that receivers can still apply.

use crate::{
	config::OpLogConfig,
	operation::{OpType, Operation, OperationPayload},
};

use serde_json::Value;
use thiserror::Error;

const MAX_CLIENT_ID_LENGTH: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("operation has an empty action type")]
	EmptyActionType,
	#[error("operation has an empty entity type")]
	EmptyEntityType,
	#[error("invalid client id length: {0}")]
	InvalidClientId(usize),
	#[error("vector clock has no entry for the producing client")]
	MissingOwnClockEntry,
	#[error("payload shape does not match operation type <op_type='{0}'>")]
	PayloadTypeMismatch(OpType),
	#[error("full state payload must be a JSON object")]
	FullStateNotObject,
	#[error("action payload must be a JSON object")]
	ActionPayloadNotObject,
	#[error("entity change #{0} is missing its entity type or id")]
	IncompleteEntityChange(usize),
	#[error("delete operation names no entity")]
	DeleteWithoutTarget,
	#[error("payload too large <size={size}, max={max}>")]
	PayloadTooLarge { size: usize, max: usize },
	#[error("failed to serialize payload: {0}")]
	Serialization(String),
}

/// Non-fatal findings of a successful validation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
	pub warnings: Vec<String>,
}

impl ValidationReport {
	#[must_use]
	pub fn is_clean(&self) -> bool {
		self.warnings.is_empty()
	}
}

pub fn validate_operation(
	op: &Operation,
	config: &OpLogConfig,
) -> Result<ValidationReport, ValidationError> {
	let mut report = ValidationReport::default();

	if op.action_type.trim().is_empty() {
		return Err(ValidationError::EmptyActionType);
	}

	if op.entity_type.trim().is_empty() {
		return Err(ValidationError::EmptyEntityType);
	}

	let client_len = op.client_id.as_str().len();
	if client_len == 0 || client_len > MAX_CLIENT_ID_LENGTH {
		return Err(ValidationError::InvalidClientId(client_len));
	}

	if op.vector_clock.get(&op.client_id) == 0 {
		return Err(ValidationError::MissingOwnClockEntry);
	}

	let max = match (&op.payload, op.op_type.is_full_state()) {
		(OperationPayload::FullState(state), true) => {
			if !state.is_object() {
				return Err(ValidationError::FullStateNotObject);
			}
			if state.as_object().is_some_and(serde_json::Map::is_empty) {
				report.warnings.push("full state payload is empty".into());
			}
			config.max_snapshot_payload_bytes
		}
		(OperationPayload::MultiEntity(payload), false) => {
			if !payload.action_payload.is_object() {
				return Err(ValidationError::ActionPayloadNotObject);
			}

			for (idx, change) in payload.entity_changes.iter().enumerate() {
				if change.entity_type.trim().is_empty() || change.entity_id.trim().is_empty() {
					return Err(ValidationError::IncompleteEntityChange(idx));
				}
			}

			check_targets(op, &payload.action_payload, &mut report)?;
			config.max_op_payload_bytes
		}
		_ => return Err(ValidationError::PayloadTypeMismatch(op.op_type)),
	};

	let size = serde_json::to_vec(&op.payload)
		.map_err(|e| ValidationError::Serialization(e.to_string()))?
		.len();
	if size > max {
		return Err(ValidationError::PayloadTooLarge { size, max });
	}

	Ok(report)
}

fn check_targets(
	op: &Operation,
	action_payload: &Value,
	report: &mut ValidationReport,
) -> Result<(), ValidationError> {
	let has_target = !op.touched_entity_ids().is_empty();

	match op.op_type {
		OpType::Delete => {
			// Bulk deletes of some entity kinds only carry their ids in the action itself
			let ids_in_action = action_payload
				.get("taskIds")
				.and_then(Value::as_array)
				.is_some_and(|ids| !ids.is_empty() && ids.iter().all(Value::is_string));

			if !has_target && !ids_in_action {
				return Err(ValidationError::DeleteWithoutTarget);
			}
		}
		OpType::Create if !has_target => {
			report
				.warnings
				.push("create operation names no entity id".into());
		}
		OpType::Update if !has_target => {
			report
				.warnings
				.push("update operation names no entity id".into());
		}
		_ => {}
	}

	Ok(())
}
