//! Decoding of log topics and log bodies into named field values.
//!
//! Indexed parameters live in the topic list (one 32-byte word each, after the
//! signature topic) and are read positionally. Non-indexed parameters are
//! ABI-encoded together in the log body and decoded as one batch.

use crate::abi::types::{AbiEntry, DecodeError, ParamType};
use crate::abi::signature::event_topic;
use crate::ledger::Log;

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const WORD: usize = 32;

/// A decoded field value.
///
/// Integers up to 64 bits are plain numbers; wider integers are decimal strings
/// so that no precision is lost downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
	Bool(bool),
	Unsigned(u64),
	Signed(i64),
	Text(String),
}

impl FieldValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			FieldValue::Text(text) => Some(text),
			_ => None,
		}
	}
}

impl std::fmt::Display for FieldValue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FieldValue::Bool(value) => write!(f, "{}", value),
			FieldValue::Unsigned(value) => write!(f, "{}", value),
			FieldValue::Signed(value) => write!(f, "{}", value),
			FieldValue::Text(value) => write!(f, "{}", value),
		}
	}
}

/// Name → value map of a decoded event.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// One event parameter prepared for decoding.
#[derive(Debug, Clone)]
struct EventInput {
	name: String,
	ty: ParamType,
	ty_name: String,
	indexed: bool,
}

/// Decoder for a single event signature, built once from its ABI entry.
#[derive(Debug, Clone)]
pub struct EventDecoder {
	name: String,
	signature: String,
	topic0: H256,
	anonymous: bool,
	inputs: Vec<EventInput>,
}

impl EventDecoder {
	/// Build a decoder from an `event` ABI entry.
	///
	/// Parameters whose type cannot be parsed are kept and reported when a log
	/// actually exercises them, so one exotic event does not poison the registry.
	pub fn from_entry(entry: &AbiEntry) -> Self {
		let signature = entry.signature();
		let inputs = entry
			.inputs
			.iter()
			.enumerate()
			.map(|(position, param)| EventInput {
				name: if param.name.is_empty() {
					format!("arg{}", position)
				} else {
					param.name.clone()
				},
				ty: ParamType::from_param(param).unwrap_or(ParamType::Tuple(Vec::new())),
				ty_name: param.ty.clone(),
				indexed: param.indexed,
			})
			.collect();

		Self {
			name: entry.name.clone(),
			topic0: event_topic(&signature),
			signature,
			anonymous: entry.anonymous,
			inputs,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn signature(&self) -> &str {
		&self.signature
	}

	pub fn topic0(&self) -> H256 {
		self.topic0
	}

	pub fn is_anonymous(&self) -> bool {
		self.anonymous
	}

	/// Decode every parameter of `log` into a field map.
	pub fn decode(&self, log: &Log) -> Result<FieldMap, DecodeError> {
		let first_indexed_topic = if self.anonymous { 0 } else { 1 };
		let indexed_count = self.inputs.iter().filter(|input| input.indexed).count();
		let expected = first_indexed_topic + indexed_count;
		if log.topics.len() != expected {
			return Err(DecodeError::TopicCountMismatch {
				event: self.name.clone(),
				expected,
				actual: log.topics.len(),
			});
		}

		let mut fields = FieldMap::new();

		let mut topics = log.topics[first_indexed_topic..].iter();
		for input in self.inputs.iter().filter(|input| input.indexed) {
			let Some(topic) = topics.next() else { break };
			let value = if input.ty.is_dynamic() {
				// Dynamic indexed values are stored as their hash.
				FieldValue::Text(format!("{:#x}", topic))
			} else {
				self.decode_word(input, topic.as_fixed_bytes())?
			};
			fields.insert(input.name.clone(), value);
		}

		let mut head = 0usize;
		for input in self.inputs.iter().filter(|input| !input.indexed) {
			let value = self.decode_body_value(input, &log.data, head)?;
			fields.insert(input.name.clone(), value);
			head += WORD;
		}

		Ok(fields)
	}

	fn decode_body_value(
		&self,
		input: &EventInput,
		data: &[u8],
		head: usize,
	) -> Result<FieldValue, DecodeError> {
		let word = self.read_word(input, data, head)?;
		match &input.ty {
			ParamType::String | ParamType::Bytes => {
				let offset = self.word_to_usize(input, &word)?;
				let length_word = self.read_word(input, data, offset)?;
				let length = self.word_to_usize(input, &length_word)?;
				let start = offset + WORD;
				let bytes = start
					.checked_add(length)
					.and_then(|end| data.get(start..end))
					.ok_or_else(|| self.too_short(input))?;
				Ok(match input.ty {
					ParamType::String => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
					_ => FieldValue::Text(format!("0x{}", hex::encode(bytes))),
				})
			}
			_ => self.decode_word(input, &word),
		}
	}

	fn decode_word(&self, input: &EventInput, word: &[u8; WORD]) -> Result<FieldValue, DecodeError> {
		match input.ty {
			ParamType::Address => Ok(FieldValue::Text(format!("0x{}", hex::encode(&word[12..])))),
			ParamType::Bool => Ok(FieldValue::Bool(word[WORD - 1] != 0)),
			ParamType::Uint(bits) => {
				let value = U256::from_big_endian(word);
				if bits <= 64 {
					Ok(FieldValue::Unsigned(value.low_u64()))
				} else {
					Ok(FieldValue::Text(value.to_string()))
				}
			}
			ParamType::Int(bits) => {
				let raw = U256::from_big_endian(word);
				let negative = word[0] & 0x80 != 0;
				if !negative {
					return Ok(if bits <= 64 {
						FieldValue::Signed(raw.low_u64() as i64)
					} else {
						FieldValue::Text(raw.to_string())
					});
				}
				// Two's complement magnitude.
				let magnitude = (!raw).overflowing_add(U256::one()).0;
				if bits <= 64 {
					Ok(FieldValue::Signed((-(magnitude.low_u64() as i128)) as i64))
				} else {
					Ok(FieldValue::Text(format!("-{}", magnitude)))
				}
			}
			ParamType::FixedBytes(len) => Ok(FieldValue::Text(format!("0x{}", hex::encode(&word[..len])))),
			_ => Err(DecodeError::UnsupportedType {
				event: self.name.clone(),
				field: input.name.clone(),
				ty: input.ty_name.clone(),
			}),
		}
	}

	fn read_word(&self, input: &EventInput, data: &[u8], offset: usize) -> Result<[u8; WORD], DecodeError> {
		let slice = offset
			.checked_add(WORD)
			.and_then(|end| data.get(offset..end))
			.ok_or_else(|| self.too_short(input))?;
		let mut word = [0u8; WORD];
		word.copy_from_slice(slice);
		Ok(word)
	}

	fn word_to_usize(&self, input: &EventInput, word: &[u8; WORD]) -> Result<usize, DecodeError> {
		let value = U256::from_big_endian(word);
		if value > U256::from(usize::MAX) {
			return Err(self.too_short(input));
		}
		Ok(value.as_usize())
	}

	fn too_short(&self, input: &EventInput) -> DecodeError {
		DecodeError::DataTooShort {
			event: self.name.clone(),
			field: input.name.clone(),
		}
	}
}
