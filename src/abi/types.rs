//! Types for JSON contract ABIs and the event decoding errors they produce

use serde::{Deserialize, Serialize};

/// One input parameter of an ABI entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbiParam {
    /// Parameter name; may be empty for unnamed outputs.
    #[serde(default)]
    pub name: String,
    /// Solidity type as written in the ABI (`uint256`, `address`, `tuple[]`, ...).
    #[serde(rename = "type")]
    pub ty: String,
    /// Whether an event parameter is stored in the log topics instead of the body.
    #[serde(default)]
    pub indexed: bool,
    #[serde(rename = "internalType", default, skip_serializing_if = "Option::is_none")]
    pub internal_type: Option<String>,
    /// Members of a tuple type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    /// Canonical type string used when hashing signatures.
    ///
    /// Tuples are expanded into their component list and the `uint`/`int`
    /// aliases are widened to their 256-bit spelling.
    pub fn canonical_type(&self) -> String {
        let (base, suffix) = match self.ty.find('[') {
            Some(idx) => self.ty.split_at(idx),
            None => (self.ty.as_str(), ""),
        };
        let base = match base {
            "tuple" => format!(
                "({})",
                self.components
                    .iter()
                    .map(AbiParam::canonical_type)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            "uint" => "uint256".to_string(),
            "int" => "int256".to_string(),
            other => other.to_string(),
        };
        format!("{}{}", base, suffix)
    }
}

/// A single entry of a JSON ABI array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbiEntry {
    /// Entry kind: `event`, `function`, `error`, `constructor`, ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<AbiParam>,
    /// Anonymous events carry no signature topic.
    #[serde(default)]
    pub anonymous: bool,
    #[serde(rename = "stateMutability", default, skip_serializing_if = "Option::is_none")]
    pub state_mutability: Option<String>,
}

impl AbiEntry {
    pub fn is_event(&self) -> bool {
        self.kind == "event"
    }

    /// `Name(type1,type2)` form of this entry.
    pub fn signature(&self) -> String {
        format!(
            "{}({})",
            self.name,
            self.inputs
                .iter()
                .map(AbiParam::canonical_type)
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

/// A parsed JSON ABI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Abi {
    pub entries: Vec<AbiEntry>,
}

impl Abi {
    /// Parse an ABI from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, AbiError> {
        Ok(serde_json::from_str(json)?)
    }

    /// All event entries, in declaration order.
    pub fn events(&self) -> impl Iterator<Item = &AbiEntry> {
        self.entries.iter().filter(|entry| entry.is_event())
    }
}

/// Solidity parameter types understood by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Bool,
    Uint(usize),
    Int(usize),
    FixedBytes(usize),
    Bytes,
    String,
    Array(Box<ParamType>),
    FixedArray(Box<ParamType>, usize),
    Tuple(Vec<ParamType>),
}

impl ParamType {
    /// Parse the type of an ABI parameter, including tuple components.
    pub fn from_param(param: &AbiParam) -> Result<Self, AbiError> {
        Self::parse(&param.ty, &param.components)
    }

    fn parse(ty: &str, components: &[AbiParam]) -> Result<Self, AbiError> {
        if let Some(stripped) = ty.strip_suffix(']') {
            let open = stripped
                .rfind('[')
                .ok_or_else(|| AbiError::UnsupportedType(ty.to_string()))?;
            let inner = Self::parse(&stripped[..open], components)?;
            let size = &stripped[open + 1..];
            return if size.is_empty() {
                Ok(ParamType::Array(Box::new(inner)))
            } else {
                let size = size
                    .parse::<usize>()
                    .map_err(|_| AbiError::UnsupportedType(ty.to_string()))?;
                Ok(ParamType::FixedArray(Box::new(inner), size))
            };
        }

        match ty {
            "address" => Ok(ParamType::Address),
            "bool" => Ok(ParamType::Bool),
            "string" => Ok(ParamType::String),
            "bytes" => Ok(ParamType::Bytes),
            "function" => Ok(ParamType::FixedBytes(24)),
            "uint" => Ok(ParamType::Uint(256)),
            "int" => Ok(ParamType::Int(256)),
            "tuple" => components
                .iter()
                .map(ParamType::from_param)
                .collect::<Result<Vec<_>, _>>()
                .map(ParamType::Tuple),
            _ => {
                if let Some(bits) = ty.strip_prefix("uint") {
                    Self::parse_width(ty, bits).map(ParamType::Uint)
                } else if let Some(bits) = ty.strip_prefix("int") {
                    Self::parse_width(ty, bits).map(ParamType::Int)
                } else if let Some(len) = ty.strip_prefix("bytes") {
                    match len.parse::<usize>() {
                        Ok(len) if (1..=32).contains(&len) => Ok(ParamType::FixedBytes(len)),
                        _ => Err(AbiError::UnsupportedType(ty.to_string())),
                    }
                } else {
                    Err(AbiError::UnsupportedType(ty.to_string()))
                }
            }
        }
    }

    fn parse_width(ty: &str, bits: &str) -> Result<usize, AbiError> {
        match bits.parse::<usize>() {
            Ok(bits) if bits > 0 && bits <= 256 && bits % 8 == 0 => Ok(bits),
            _ => Err(AbiError::UnsupportedType(ty.to_string())),
        }
    }

    /// Dynamic types are stored by offset in the log body and by hash in topics.
    pub fn is_dynamic(&self) -> bool {
        match self {
            ParamType::Bytes | ParamType::String | ParamType::Array(_) => true,
            ParamType::FixedArray(inner, _) => inner.is_dynamic(),
            ParamType::Tuple(members) => members.iter().any(ParamType::is_dynamic),
            _ => false,
        }
    }
}

/// Errors raised while loading ABIs
#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("ABI parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Unsupported ABI type: {0}")]
    UnsupportedType(String),
}

/// Errors raised while decoding a log against the registry
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Log has no topics")]
    NoTopics,

    #[error("Unknown event signature: {0}")]
    UnknownSignature(String),

    #[error("Event {event} expects {expected} topics, log has {actual}")]
    TopicCountMismatch {
        event: String,
        expected: usize,
        actual: usize,
    },

    #[error("Log data too short decoding {field} of {event}")]
    DataTooShort { event: String, field: String },

    #[error("Unsupported type {ty} for field {field} of {event}")]
    UnsupportedType {
        event: String,
        field: String,
        ty: String,
    },
}
