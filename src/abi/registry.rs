//! Signature → decoder registry built once at startup from contract ABIs.

use crate::abi::decode::{EventDecoder, FieldMap};
use crate::abi::types::{Abi, DecodeError};
use crate::ledger::Log;

use primitive_types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A log decoded against a known event signature.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
	pub name: String,
	pub fields: FieldMap,
}

/// Lookup table from topic 0 to the decoder for that event.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
	by_topic: HashMap<H256, Arc<EventDecoder>>,
}

impl EventRegistry {
	/// Registry for the events of a single ABI.
	pub fn from_abi(abi: &Abi) -> Self {
		Self::merged([abi])
	}

	/// Registry merged from several ABIs.
	///
	/// Events are merged by name in the order given: a later ABI's event with
	/// the same name replaces the earlier definition.
	pub fn merged<'a>(abis: impl IntoIterator<Item = &'a Abi>) -> Self {
		let mut by_name: HashMap<String, EventDecoder> = HashMap::new();
		for abi in abis {
			for entry in abi.events() {
				let decoder = EventDecoder::from_entry(entry);
				if let Some(previous) = by_name.insert(entry.name.clone(), decoder) {
					debug!(
						"Event {} redefined, {} replaced by later ABI",
						entry.name,
						previous.signature()
					);
				}
			}
		}

		let by_topic = by_name
			.into_values()
			.filter(|decoder| !decoder.is_anonymous())
			.map(|decoder| (decoder.topic0(), Arc::new(decoder)))
			.collect();

		Self { by_topic }
	}

	pub fn len(&self) -> usize {
		self.by_topic.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_topic.is_empty()
	}

	pub fn lookup(&self, topic0: &H256) -> Option<&EventDecoder> {
		self.by_topic.get(topic0).map(Arc::as_ref)
	}

	/// Event names known to the registry.
	pub fn event_names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.by_topic.values().map(|d| d.name()).collect();
		names.sort_unstable();
		names
	}

	/// Decode a log by exact match of its leading topic.
	pub fn decode(&self, log: &Log) -> Result<DecodedLog, DecodeError> {
		let topic0 = log.topic0().ok_or(DecodeError::NoTopics)?;
		let decoder = self
			.lookup(topic0)
			.ok_or_else(|| DecodeError::UnknownSignature(format!("{:#x}", topic0)))?;
		let fields = decoder.decode(log)?;
		Ok(DecodedLog {
			name: decoder.name().to_string(),
			fields,
		})
	}
}
