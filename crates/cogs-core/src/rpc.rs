//! Wire types for the RPC tunnel
//!
//! Frames are newline-delimited JSON objects shaped like Go's
//! `net/rpc/jsonrpc`: `{"id", "method", "params"}` in,
//! `{"id", "result", "error"}` out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CogsError, CogsResult};

/// Return the node status snapshot
pub const METHOD_STATUS: &str = "Cogs.Status";
/// Wait for and reserve devices
pub const METHOD_CLAIM: &str = "Cogs.Claim";
/// Release devices held by the caller
pub const METHOD_RELEASE: &str = "Cogs.Release";

/// A method call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Build a request for `method` with a single parameter object
    pub fn new(id: u64, method: &str, params: impl Serialize) -> CogsResult<Self> {
        Ok(Self {
            id: Value::from(id),
            method: method.to_string(),
            params: Value::Array(vec![serde_json::to_value(params)?]),
        })
    }

    /// Decode the parameters, accepting a bare object or a one-element array
    pub fn params<T: DeserializeOwned>(&self) -> CogsResult<T> {
        let value = match &self.params {
            Value::Array(items) if items.len() == 1 => items[0].clone(),
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value)
            .map_err(|e| CogsError::Protocol(format!("invalid params for {}: {}", self.method, e)))
    }
}

/// Reply to a method call; exactly one of `result` and `error` is non-null
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<String>,
}

impl RpcResponse {
    /// Successful reply
    pub fn ok(id: Value, result: impl Serialize) -> CogsResult<Self> {
        Ok(Self {
            id,
            result: serde_json::to_value(result)?,
            error: None,
        })
    }

    /// Failed reply
    pub fn err(id: Value, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error.to_string()),
        }
    }
}

/// Parameters of `Cogs.Claim`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimArgs {
    /// Number of devices wanted
    pub count: u32,
    /// Seconds to wait; 0 fails immediately, negative waits forever
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Parameters of `Cogs.Release`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseArgs {
    pub devices: Vec<u32>,
}
