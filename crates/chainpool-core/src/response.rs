//! Contract call / transaction response returned to resolver callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a contract method call or transaction submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractResponse {
    /// `true` for read-only (constant) calls that produced no transaction.
    pub constant: bool,
    /// Decoded return values.
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Node-reported status byte.
    #[serde(default)]
    pub status: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContractResponse {
    /// Result of a constant (read-only) call.
    pub fn constant(data: Vec<Value>) -> Self {
        Self {
            constant: true,
            data,
            ..Default::default()
        }
    }

    /// A submitted transaction.
    pub fn transaction(tx_hash: impl Into<String>, msg_hash: Option<String>, status: u8) -> Self {
        Self {
            tx_hash: Some(tx_hash.into()),
            msg_hash,
            status,
            ..Default::default()
        }
    }

    /// A failed call or transaction.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
