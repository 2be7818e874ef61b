//! Contract ABI support for log decoding
//!
//! This module parses JSON ABIs, hashes event and function signatures, and builds the
//! runtime registry used by both ingestion paths to turn raw logs into named fields.
//! The set of events is not known at compile time, so decoders are built from the
//! ABIs at startup rather than written per event type.

/// Bundled contract ABIs
pub mod contracts;
/// Topic and body decoding
pub mod decode;
/// Signature registry
pub mod registry;
/// Keccak hashing of signatures
pub mod signature;
/// ABI data model and errors
pub mod types;

pub use decode::{EventDecoder, FieldMap, FieldValue};
pub use registry::{DecodedLog, EventRegistry};
pub use signature::{event_topic, function_selector, keccak256};
pub use types::*;
