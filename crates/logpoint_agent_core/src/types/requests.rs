use std::num::NonZeroU32;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogpointType {
    #[default]
    Snapshot,
    Log,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddRequest {
    pub logpoint_id: String,
    pub project_id: i64,
    pub webroot: PathBuf,
    pub file_path: String,
    pub file_hash: String,
    pub line_number: NonZeroU32,
    #[serde(default, rename = "type")]
    pub kind: LogpointType,
    #[serde(default)]
    pub log_variable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub logpoint_id: String,
}

/// Relay reply to the bootstrap request. Entries are decoded one by one so a
/// single malformed logpoint does not discard the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub logpoints: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub result: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

/// Shape of a result file written by the instrumentation hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub event: String,
    #[serde(default)]
    pub header: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}
