use crate::abi::{DecodedLog, FieldMap};
use crate::broker::BrokerError;
use crate::ledger::{LedgerError, Log};

use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A log decoded against a known signature, with its chain coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub name: String,
    pub fields: FieldMap,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub block_hash: H256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub address: H160,
}

impl LedgerEvent {
    pub fn from_decoded(decoded: DecodedLog, log: &Log) -> Self {
        Self {
            name: decoded.name,
            fields: decoded.fields,
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            block_hash: log.block_hash,
            transaction_index: log.transaction_index,
            log_index: log.log_index,
            address: log.address,
        }
    }
}

/// Wire form of a [`LedgerEvent`] on the event queue.
///
/// Hashes and addresses are `0x`-prefixed lowercase hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub event_name: String,
    pub data: FieldMap,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub block_hash: H256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub address: H160,
}

impl From<LedgerEvent> for EventMessage {
    fn from(event: LedgerEvent) -> Self {
        Self {
            event_name: event.name,
            data: event.fields,
            block_number: event.block_number,
            transaction_hash: event.transaction_hash,
            block_hash: event.block_hash,
            transaction_index: event.transaction_index,
            log_index: event.log_index,
            address: event.address,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cursor store error: {0}")]
    CursorStore(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::FieldValue;

    #[test]
    fn event_message_uses_camel_case_and_hex() {
        let mut fields = FieldMap::new();
        fields.insert("amount".into(), FieldValue::Text("1500000000000000000".into()));
        fields.insert("proposalId".into(), FieldValue::Unsigned(7));

        let message = EventMessage::from(LedgerEvent {
            name: "DepositedEther".into(),
            fields,
            block_number: 12,
            transaction_hash: H256::repeat_byte(0xaa),
            block_hash: H256::repeat_byte(0xbb),
            transaction_index: 1,
            log_index: 3,
            address: H160::repeat_byte(0x11),
        });

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["eventName"], "DepositedEther");
        assert_eq!(json["data"]["amount"], "1500000000000000000");
        assert_eq!(json["data"]["proposalId"], 7);
        assert_eq!(json["blockNumber"], 12);
        assert_eq!(json["logIndex"], 3);
        assert_eq!(json["address"], format!("0x{}", "11".repeat(20)));
        assert_eq!(json["transactionHash"], format!("0x{}", "aa".repeat(32)));
    }
}
