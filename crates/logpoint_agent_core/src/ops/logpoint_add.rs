use serde_json::json;

use crate::client::RelayClient;
use crate::store::{Logpoint, LogpointStore};
use crate::types::{events, AddRequest, ErrorData, LogpointHeader};
use crate::{AgentError, LogpointError, Result};

/// Validates and installs a logpoint, answering with `logpoint-added` or
/// `logpoint-error-adding`. Only transport and filesystem failures are errors.
pub fn logpoint_add(
    client: &mut RelayClient,
    store: &mut LogpointStore,
    request: &AddRequest,
) -> Result<()> {
    match store.add(request) {
        Ok(logpoint) => {
            tracing::info!(
                "Added logpoint {} at {}:{}",
                logpoint.logpoint_id,
                logpoint.absolute_path.display(),
                logpoint.line_number
            );
            report_added(client, logpoint)
        }
        Err(AgentError::Rejected(reason)) => report_rejected(
            client,
            &request.logpoint_id,
            Some(request.project_id),
            &reason,
        ),
        Err(e) => Err(e),
    }
}

pub(crate) fn report_added(client: &mut RelayClient, logpoint: &Logpoint) -> Result<()> {
    let header = LogpointHeader {
        logpoint_id: logpoint.logpoint_id.clone(),
        project_id: Some(logpoint.project_id),
    };
    let data = json!({
        "file_path": logpoint.file_path,
        "line_number": logpoint.line_number,
        "type": logpoint.kind,
    });
    client.send_lifecycle(events::LOGPOINT_ADDED, header, Some(data))
}

/// Answers with `logpoint-error-adding`. `project_id` is absent when the
/// request could not be decoded.
pub(crate) fn report_rejected(
    client: &mut RelayClient,
    logpoint_id: &str,
    project_id: Option<i64>,
    reason: &LogpointError,
) -> Result<()> {
    tracing::warn!(
        "Rejected logpoint {} ({}): {}",
        logpoint_id,
        reason.code(),
        reason
    );
    let header = LogpointHeader {
        logpoint_id: logpoint_id.to_string(),
        project_id,
    };
    let data = serde_json::to_value(ErrorData::new(reason.code(), reason.to_string()))?;
    client.send_lifecycle(events::LOGPOINT_ERROR_ADDING, header, Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChannelTransport;
    use crate::config::tests::config_for;
    use crate::store::tests::Fixture;
    use serde_json::Value;
    use std::sync::Arc;

    fn setup() -> (Fixture, RelayClient, LogpointStore, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let fixture = Fixture::new();
        let (transport, rx) = ChannelTransport::new();
        let client = RelayClient::new(
            Arc::new(config_for(fixture.dir.path(), false)),
            Box::new(transport),
        );
        let store = LogpointStore::open(fixture.store_path()).unwrap();
        (fixture, client, store, rx)
    }

    #[test]
    fn test_valid_logpoint_is_acknowledged() {
        let (fixture, mut client, mut store, mut rx) = setup();
        logpoint_add(&mut client, &mut store, &fixture.request("lp-1", "a.php")).unwrap();

        let wire: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(wire["event"], "logpoint-added");
        assert_eq!(wire["header"]["logpoint_id"], "lp-1");
        assert_eq!(wire["header"]["project_id"], 7);
        assert_eq!(wire["data"]["line_number"], 10);
        assert_eq!(wire["data"]["type"], "snapshot");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejection_reports_error_code() {
        let (fixture, mut client, mut store, mut rx) = setup();
        logpoint_add(&mut client, &mut store, &fixture.request("lp-1", "../outside.php")).unwrap();

        let wire: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(wire["event"], "logpoint-error-adding");
        assert_eq!(wire["header"]["logpoint_id"], "lp-1");
        assert_eq!(wire["data"]["errorCode"], "OUTSIDE_WEBROOT");
        assert_eq!(wire["data"]["errorMessage"], "Invalid file path provided.");
        assert!(store.is_empty());
    }
}
