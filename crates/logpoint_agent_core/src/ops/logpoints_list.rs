use serde_json::Value;

use crate::client::RelayClient;
use crate::ops::logpoint_add::{report_added, report_rejected};
use crate::store::LogpointStore;
use crate::types::{AddRequest, ListResponse};
use crate::{LogpointError, Result};

/// Reconciles the store with the relay's full list after (re)authentication.
/// Every entry is validated again; the configuration file is written once.
pub fn logpoints_list(
    client: &mut RelayClient,
    store: &mut LogpointStore,
    response: &ListResponse,
) -> Result<()> {
    let mut requests: Vec<AddRequest> = Vec::with_capacity(response.logpoints.len());
    let mut malformed = Vec::new();
    for entry in &response.logpoints {
        match serde_json::from_value::<AddRequest>(entry.clone()) {
            Ok(request) => requests.push(request),
            Err(e) => match entry.get("logpoint_id").and_then(Value::as_str) {
                Some(id) => malformed.push((
                    id.to_string(),
                    entry.get("project_id").and_then(Value::as_i64),
                    LogpointError::InvalidRequest(e.to_string()),
                )),
                None => tracing::warn!("Skipping unidentifiable logpoint in list: {}", e),
            },
        }
    }

    let outcomes = store.replace_all(&requests)?;
    tracing::info!(
        "Reconciled {} logpoints from relay ({} active)",
        requests.len(),
        store.len()
    );

    for (request, (_, outcome)) in requests.iter().zip(outcomes) {
        match outcome {
            Ok(()) => match store.get(&request.logpoint_id) {
                Some(logpoint) => report_added(client, logpoint)?,
                None => tracing::warn!("Logpoint {} vanished during reconcile", request.logpoint_id),
            },
            Err(reason) => report_rejected(
                client,
                &request.logpoint_id,
                Some(request.project_id),
                &reason,
            )?,
        }
    }

    for (logpoint_id, project_id, reason) in &malformed {
        report_rejected(client, logpoint_id, *project_id, reason)?;
    }

    Ok(())
}
