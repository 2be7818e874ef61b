//! Types for the ledger JSON-RPC surface: logs, filters and errors

use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};

/// A raw log as returned by `eth_getLogs` or pushed by an `eth_subscribe("logs")` stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Contract that emitted the log.
    pub address: H160,
    /// Topic 0 is the event signature hash for non-anonymous events.
    pub topics: Vec<H256>,
    /// ABI-encoded non-indexed parameters.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "quantity")]
    pub block_number: u64,
    pub transaction_hash: H256,
    pub block_hash: H256,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    #[serde(with = "quantity")]
    pub log_index: u64,
    /// Set when the log was dropped by a chain reorganisation.
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    /// Leading topic, the event signature hash.
    pub fn topic0(&self) -> Option<&H256> {
        self.topics.first()
    }
}

/// Filter for range queries and push subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Contracts whose logs are wanted.
    pub addresses: Vec<H160>,
    /// Inclusive lower bound; ignored by push subscriptions.
    pub from_block: Option<u64>,
    /// Inclusive upper bound; ignored by push subscriptions.
    pub to_block: Option<u64>,
}

impl LogFilter {
    pub fn for_addresses(addresses: Vec<H160>) -> Self {
        Self {
            addresses,
            from_block: None,
            to_block: None,
        }
    }

    /// Restrict the filter to the inclusive block range `[from, to]`.
    pub fn with_range(mut self, from: u64, to: u64) -> Self {
        self.from_block = Some(from);
        self.to_block = Some(to);
        self
    }

    /// JSON-RPC filter object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut filter = serde_json::Map::new();
        let addresses = self
            .addresses
            .iter()
            .map(|address| serde_json::Value::String(format!("{:#x}", address)))
            .collect::<Vec<_>>();
        filter.insert("address".to_string(), serde_json::Value::Array(addresses));
        if let Some(from) = self.from_block {
            filter.insert("fromBlock".to_string(), quantity::encode(from).into());
        }
        if let Some(to) = self.to_block {
            filter.insert("toBlock".to_string(), quantity::encode(to).into());
        }
        serde_json::Value::Object(filter)
    }
}

/// Hash of a submitted transaction.
pub type TxHash = H256;

/// Error types for ledger RPC and subscription operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("RPC error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Submission error: {0}")]
    SubmissionError(String),

    #[error("Signing credential error: {0}")]
    CredentialError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// `0x`-prefixed hexadecimal quantities as used by JSON-RPC.
pub mod quantity {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn encode(value: u64) -> String {
        format!("0x{:x}", value)
    }

    pub fn decode(text: &str) -> Result<u64, String> {
        let digits = text
            .strip_prefix("0x")
            .ok_or_else(|| format!("quantity {:?} is missing 0x prefix", text))?;
        u64::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity {:?}: {}", text, e))
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(D::Error::custom)
    }
}

/// `0x`-prefixed hex byte strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text.strip_prefix("0x").unwrap_or(&text);
        hex::decode(digits).map_err(D::Error::custom)
    }
}
