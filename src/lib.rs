//! Ledger bridge
//!
//! Connects synchronous HTTP callers to a ledger through a message broker, and relays
//! ledger events into the broker for downstream consumers.

/// Contract ABIs and event log decoding
pub mod abi;
/// Message broker seam with AMQP and in-memory backends
pub mod broker;
/// Request/reply commands over the broker
pub mod commands;
/// Command line and environment configuration
pub mod config;
/// Ledger event ingestion and publication
pub mod events;
/// HTTP front end
pub mod http;
/// Ledger JSON-RPC client and submission
pub mod ledger;
/// Shared helpers
pub mod utils;
