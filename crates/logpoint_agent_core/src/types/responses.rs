use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub internal_ips: Vec<String>,
    pub hostname: String,
    pub runtime_version: String,
    pub agent_version: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateData {
    pub api_key_id: String,
    pub channel: String,
    pub auth: String,
    pub host_info: HostInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogpointHeader {
    pub logpoint_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(rename = "errorCode")]
    pub error_code: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

impl ErrorData {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: code.into(),
            error_message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    ByUser,
    EvaluationError,
}

impl RemovalReason {
    pub fn code(self) -> u16 {
        match self {
            Self::ByUser => 101,
            Self::EvaluationError => 102,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ByUser => "Logpoint removed by a user",
            Self::EvaluationError => "Error evaluating logpoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalData {
    pub removal_reason_code: u16,
    pub removal_reason_message: String,
}

impl From<RemovalReason> for RemovalData {
    fn from(reason: RemovalReason) -> Self {
        Self {
            removal_reason_code: reason.code(),
            removal_reason_message: reason.message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_data_uses_camel_case_keys() {
        let value = serde_json::to_value(ErrorData::new("HASH_MISMATCH", "differs")).unwrap();
        assert_eq!(value, json!({"errorCode": "HASH_MISMATCH", "errorMessage": "differs"}));
    }

    #[test]
    fn test_removal_data_from_reason() {
        let value = serde_json::to_value(RemovalData::from(RemovalReason::ByUser)).unwrap();
        assert_eq!(
            value,
            json!({"removal_reason_code": 101, "removal_reason_message": "Logpoint removed by a user"})
        );
        assert_eq!(RemovalReason::EvaluationError.code(), 102);
    }

    #[test]
    fn test_header_omits_missing_project() {
        let header = LogpointHeader {
            logpoint_id: "X".into(),
            project_id: None,
        };
        assert_eq!(serde_json::to_value(header).unwrap(), json!({"logpoint_id": "X"}));
    }
}
