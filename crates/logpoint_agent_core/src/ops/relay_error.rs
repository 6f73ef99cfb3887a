use crate::client::RelayClient;
use crate::protocol::ConnectionProtocol;
use crate::types::RelayError;
use crate::Result;

/// Relay protocol errors never close the session. Oversized payloads are
/// reported back so the user sees why a dump went missing.
pub fn relay_error(
    client: &mut RelayClient,
    protocol: &ConnectionProtocol,
    error: &RelayError,
) -> Result<()> {
    match protocol.on_relay_error(error) {
        Some(code) => client.send_error(
            code,
            error
                .message
                .clone()
                .unwrap_or_else(|| "Payload exceeds relay limit".to_string()),
        ),
        None => Ok(()),
    }
}
