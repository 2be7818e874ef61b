//! Command request/reply module
//!
//! The [`CommandGateway`] turns a synchronous call into a command on a durable
//! command queue and waits for the matching reply on a private reply queue. The
//! [`CommandWorker`] consumes the command queues, submits valid commands to the
//! ledger and always answers with exactly one reply.

/// Caller side: publish and await reply
mod gateway;
/// Command, reply and error types
mod types;
/// Consumer side: validate, submit, reply
mod worker;

pub use gateway::{CommandGateway, DEFAULT_REPLY_TIMEOUT};
pub use types::*;
pub use worker::{CommandWorker, LedgerCall, validate};
