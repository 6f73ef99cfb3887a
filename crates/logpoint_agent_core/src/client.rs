use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::envelope::{self, Envelope, SendPolicy};
use crate::types::{events, ErrorData, LogpointHeader, RemovalData, RemovalReason};
use crate::{AgentConfig, AgentError, Result};

/// Outbound half of the relay connection.
pub trait Transport: Send {
    fn send(&mut self, payload: String) -> Result<()>;
}

/// Queues payloads for whoever owns the socket.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, payload: String) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| AgentError::Transport("outbound channel closed".into()))
    }
}

pub struct RelayClient {
    config: Arc<AgentConfig>,
    transport: Box<dyn Transport>,
    sent: u64,
}

impl RelayClient {
    pub fn new(config: Arc<AgentConfig>, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            sent: 0,
        }
    }

    pub fn send(&mut self, envelope: Envelope, policy: SendPolicy) -> Result<()> {
        self.sent += 1;
        let event = envelope.event.clone();
        let payload = envelope::encode(envelope, policy, self.config.encryption_key.as_ref())?;

        tracing::debug!(
            "Sending message: event={}, seq={}, bytes={}, compressed={}, encrypted={}",
            event,
            self.sent,
            payload.len(),
            policy.compress,
            policy.encrypt
        );

        self.transport.send(payload)
    }

    /// Policy for logpoint lifecycle notifications.
    pub fn lifecycle_policy(&self) -> SendPolicy {
        SendPolicy {
            compress: false,
            encrypt: self.config.encryption_enabled(),
        }
    }

    /// Policy for results shipped from the instrumentation hook.
    pub fn results_policy(&self) -> SendPolicy {
        SendPolicy {
            compress: self.config.compression,
            encrypt: self.config.encryption_enabled(),
        }
    }

    /// Reports a per-message failure. Always sent in the clear so the relay can
    /// read it even when the key is misconfigured.
    pub fn send_error(&mut self, code: &str, message: impl Into<String>) -> Result<()> {
        let data = serde_json::to_value(ErrorData::new(code, message))?;
        self.send(
            Envelope::new(events::AGENT_ERROR).with_data(data),
            SendPolicy::PLAIN,
        )
    }

    /// Sends a logpoint lifecycle event identified by `header`.
    pub fn send_lifecycle(
        &mut self,
        event: &str,
        header: LogpointHeader,
        data: Option<Value>,
    ) -> Result<()> {
        let mut envelope = Envelope::new(event).with_header(serde_json::to_value(header)?);
        if let Some(data) = data {
            envelope = envelope.with_data(data);
        }
        let policy = self.lifecycle_policy();
        self.send(envelope, policy)
    }

    pub fn send_removal(
        &mut self,
        event: &str,
        header: LogpointHeader,
        reason: RemovalReason,
    ) -> Result<()> {
        let data = serde_json::to_value(RemovalData::from(reason))?;
        self.send_lifecycle(event, header, Some(data))
    }

    pub fn send_pong(&mut self) -> Result<()> {
        self.send(
            Envelope::new(events::PONG).with_data(json!({})),
            SendPolicy::PLAIN,
        )
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::config_for;

    fn client(encryption: bool) -> (RelayClient, mpsc::UnboundedReceiver<String>) {
        let config = Arc::new(config_for(std::path::Path::new("/tmp/agent"), encryption));
        let (transport, rx) = ChannelTransport::new();
        (RelayClient::new(config, Box::new(transport)), rx)
    }

    #[test]
    fn test_send_queues_serialized_envelope() {
        let (mut client, mut rx) = client(false);
        client
            .send(Envelope::new("logpoints-list"), SendPolicy::PLAIN)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"{"event":"logpoints-list"}"#);
        assert_eq!(client.messages_sent(), 1);
    }

    #[test]
    fn test_error_is_never_encrypted() {
        let (mut client, mut rx) = client(true);
        client
            .send_error("MESSAGE_DECRYPTION_FAILED", "Unable to decrypt message")
            .unwrap();
        let wire: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(wire["event"], "client-agent-encountered-error");
        assert_eq!(wire["data"]["errorCode"], "MESSAGE_DECRYPTION_FAILED");
        assert!(wire.get("encrypted").is_none());
    }

    #[test]
    fn test_policies_follow_config() {
        let (client, _rx) = client(true);
        assert!(client.lifecycle_policy().encrypt);
        assert!(!client.lifecycle_policy().compress);
        assert!(client.results_policy().compress);

        let (client, _rx) = self::client(false);
        assert!(!client.results_policy().encrypt);
    }

    #[test]
    fn test_removal_carries_reason_and_header() {
        let (mut client, mut rx) = client(false);
        let header = LogpointHeader {
            logpoint_id: "lp-9".into(),
            project_id: Some(3),
        };
        client
            .send_removal(events::LOGPOINT_REMOVED, header, RemovalReason::ByUser)
            .unwrap();
        let wire: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(wire["event"], "logpoint-removed");
        assert_eq!(wire["header"]["logpoint_id"], "lp-9");
        assert_eq!(wire["header"]["project_id"], 3);
        assert_eq!(wire["data"]["removal_reason_code"], 101);
    }

    #[test]
    fn test_lifecycle_is_encrypted_when_enabled() {
        let (mut client, mut rx) = client(true);
        let header = LogpointHeader {
            logpoint_id: "lp-9".into(),
            project_id: None,
        };
        client
            .send_lifecycle(events::LOGPOINT_ADDED, header, Some(json!({"line_number": 4})))
            .unwrap();
        let wire: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(wire["encrypted"], true);
        assert_eq!(wire["header"]["logpoint_id"], "lp-9");
        assert!(wire.get("data").is_none());
    }

    #[test]
    fn test_closed_channel_is_transport_error() {
        let (mut client, rx) = client(false);
        drop(rx);
        let err = client.send_pong().unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
