use crate::broker::{APPROVAL_QUEUE, BrokerError, DEPOSIT_QUEUE};
use crate::ledger::LedgerError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Operation requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Approve,
    Deposit,
}

impl CommandKind {
    pub const ALL: [CommandKind; 2] = [CommandKind::Approve, CommandKind::Deposit];

    /// Durable queue commands of this kind are routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            CommandKind::Approve => APPROVAL_QUEUE,
            CommandKind::Deposit => DEPOSIT_QUEUE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Approve => "approve",
            CommandKind::Deposit => "deposit",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command as it travels on a command queue.
///
/// The payload is kind-specific and kept as raw JSON fields; the worker validates it
/// against the declared kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub kind: CommandKind,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub correlation_id: String,
    pub reply_to: String,
}

/// Result of a command as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        message: String,
        transaction_hash: Option<String>,
    },
    Failure {
        error: String,
        details: Option<String>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Turn a failure outcome into [`CommandError::Remote`].
    pub fn into_result(self) -> Result<Option<String>, CommandError> {
        match self {
            Outcome::Success {
                transaction_hash, ..
            } => Ok(transaction_hash),
            Outcome::Failure { error, details } => Err(CommandError::Remote { error, details }),
        }
    }
}

/// Wire form of a reply: `{message, transactionHash}` on success, `{error, details}`
/// on failure, always with the command's `correlationId`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Reply {
    pub fn new(correlation_id: impl Into<String>, outcome: Outcome) -> Self {
        let correlation_id = correlation_id.into();
        match outcome {
            Outcome::Success {
                message,
                transaction_hash,
            } => Self {
                correlation_id,
                message: Some(message),
                transaction_hash,
                ..Default::default()
            },
            Outcome::Failure { error, details } => Self {
                correlation_id,
                error: Some(error),
                details,
                ..Default::default()
            },
        }
    }

    /// A reply carrying `error` is a failure, whatever else it holds.
    pub fn outcome(&self) -> Outcome {
        match &self.error {
            Some(error) => Outcome::Failure {
                error: error.clone(),
                details: self.details.clone(),
            },
            None => Outcome::Success {
                message: self.message.clone().unwrap_or_default(),
                transaction_hash: self.transaction_hash.clone(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid command: {0}")]
    Validation(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No reply for {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Command failed: {error}")]
    Remote {
        error: String,
        details: Option<String>,
    },

    #[error("Gateway is shutting down")]
    ShuttingDown,
}
