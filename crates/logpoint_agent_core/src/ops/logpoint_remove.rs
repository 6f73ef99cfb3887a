use crate::client::RelayClient;
use crate::store::LogpointStore;
use crate::types::{events, LogpointHeader, RemovalReason, RemoveRequest};
use crate::Result;

/// Removes a logpoint on user request. Unknown IDs are logged and ignored.
pub fn logpoint_remove(
    client: &mut RelayClient,
    store: &mut LogpointStore,
    request: &RemoveRequest,
) -> Result<bool> {
    let Some(removed) = store.remove(&request.logpoint_id)? else {
        tracing::info!("Ignoring removal of unknown logpoint {}", request.logpoint_id);
        return Ok(false);
    };

    tracing::info!("Removed logpoint {}", removed.logpoint_id);
    let header = LogpointHeader {
        logpoint_id: removed.logpoint_id,
        project_id: Some(removed.project_id),
    };
    client.send_removal(events::LOGPOINT_REMOVED, header, RemovalReason::ByUser)?;
    Ok(true)
}
