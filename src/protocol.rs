//! # Wire Protocol
//!
//! Payloads are UTF-8 JSON. A call travels as `{"name": ..., "data": ...}`; a
//! reply is the bare result value. The correlation token and the reply
//! destination never appear in the payload; they ride as message properties.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RpcError};

/// Any self-describing JSON value. No schema is enforced at this layer.
pub type StructuredValue = serde_json::Value;

/// The decoded unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Handler name
    pub name: String,
    /// Handler argument
    #[serde(default)]
    pub data: StructuredValue,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, data: StructuredValue) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Serialize into a call payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RpcError::encode(e.to_string()))
    }

    /// Parse a call payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| RpcError::decode(e.to_string()))
    }
}

/// Token matching a reply to its pending call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random (v4) token
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Serialize a handler result into a reply payload
pub fn encode_value(value: &StructuredValue) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RpcError::encode(e.to_string()))
}

/// Parse a reply payload
pub fn decode_value(payload: &[u8]) -> Result<StructuredValue> {
    serde_json::from_slice(payload).map_err(|e| RpcError::decode(e.to_string()))
}

/// Convert a typed request into call data
pub fn to_structured<T: Serialize + ?Sized>(value: &T) -> Result<StructuredValue> {
    serde_json::to_value(value).map_err(|e| RpcError::encode(e.to_string()))
}

/// Coerce call data or a reply into a concrete type
pub fn from_structured<T: DeserializeOwned>(value: StructuredValue) -> Result<T> {
    serde_json::from_value(value).map_err(|e| RpcError::decode(e.to_string()))
}
