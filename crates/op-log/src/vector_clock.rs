//! Vector clocks for causal ordering of operations
//!
//! Every client owns one component of the clock and bumps it by exactly one
//! per local write. Ordering between operations is the partial order of their
//! clocks; wall-clock timestamps never participate.

use crate::operation::ClientId;

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};

/// Result of comparing two vector clocks under the causal partial order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorClockComparison {
	Equal,
	LessThan,
	GreaterThan,
	Concurrent,
}

/// Mapping from client id to that client's logical counter
///
/// Absent components are treated as 0. Serializes as a plain JSON object so
/// it can travel unchanged on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ClientId, u64>);

impl VectorClock {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Counter for `client`, 0 when the clock has never seen it
	#[must_use]
	pub fn get(&self, client: &ClientId) -> u64 {
		self.0.get(client).copied().unwrap_or(0)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
		self.0.iter()
	}

	/// Returns a copy with `client`'s component advanced by one
	#[must_use]
	pub fn increment(&self, client: &ClientId) -> Self {
		let mut next = self.clone();
		*next.0.entry(client.clone()).or_insert(0) += 1;
		next
	}

	/// Component-wise maximum over the union of both clocks
	#[must_use]
	pub fn merge(&self, other: &Self) -> Self {
		let mut merged = self.clone();
		for (client, &counter) in &other.0 {
			let slot = merged.0.entry(client.clone()).or_insert(0);
			*slot = (*slot).max(counter);
		}
		merged
	}

	#[must_use]
	pub fn compare(&self, other: &Self) -> VectorClockComparison {
		let mut self_ahead = false;
		let mut other_ahead = false;

		for client in self.0.keys().chain(other.0.keys()) {
			match self.get(client).cmp(&other.get(client)) {
				Ordering::Greater => self_ahead = true,
				Ordering::Less => other_ahead = true,
				Ordering::Equal => {}
			}

			if self_ahead && other_ahead {
				return VectorClockComparison::Concurrent;
			}
		}

		match (self_ahead, other_ahead) {
			(false, false) => VectorClockComparison::Equal,
			(true, false) => VectorClockComparison::GreaterThan,
			(false, true) => VectorClockComparison::LessThan,
			(true, true) => VectorClockComparison::Concurrent,
		}
	}
}

impl PartialOrd for VectorClock {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		match self.compare(other) {
			VectorClockComparison::Equal => Some(Ordering::Equal),
			VectorClockComparison::LessThan => Some(Ordering::Less),
			VectorClockComparison::GreaterThan => Some(Ordering::Greater),
			VectorClockComparison::Concurrent => None,
		}
	}
}

impl FromIterator<(ClientId, u64)> for VectorClock {
	fn from_iter<T: IntoIterator<Item = (ClientId, u64)>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}
