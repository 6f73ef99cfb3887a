//! Binds the handshake, the logpoint store and the maintenance cycle to the
//! inbound event stream.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::client::{RelayClient, Transport};
use crate::envelope::{self, Envelope, SendPolicy};
use crate::maintenance::MaintenanceCycle;
use crate::ops;
use crate::protocol::{signer_from_config, ConnectionProtocol, CredentialSigner};
use crate::store::LogpointStore;
use crate::types::{
    events, AddRequest, AuthenticationResult, ConnectionEstablished, ListResponse, RelayError,
    RemoveRequest,
};
use crate::{AgentConfig, AgentError, LogpointError, Result};

type Handler = fn(&mut Agent, &Envelope) -> Result<()>;

/// Every inbound event the agent understands. Each needs a handler.
pub const INBOUND_EVENTS: &[&str] = &[
    events::CONNECTION_ESTABLISHED,
    events::AUTHENTICATION_RESULT,
    events::LOGPOINT_ADD,
    events::LOGPOINT_REMOVE,
    events::LOGPOINTS_LIST,
    events::RELAY_ERROR,
    events::SERVER_ERROR,
    events::PING,
    events::SUBSCRIPTION_SUCCEEDED,
];

fn dispatch_table() -> HashMap<&'static str, Handler> {
    let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
    handlers.insert(events::CONNECTION_ESTABLISHED, Agent::on_connection_established);
    handlers.insert(events::AUTHENTICATION_RESULT, Agent::on_authentication_result);
    handlers.insert(events::LOGPOINT_ADD, Agent::on_logpoint_add);
    handlers.insert(events::LOGPOINT_REMOVE, Agent::on_logpoint_remove);
    handlers.insert(events::LOGPOINTS_LIST, Agent::on_logpoints_list);
    handlers.insert(events::RELAY_ERROR, Agent::on_relay_error);
    handlers.insert(events::SERVER_ERROR, Agent::on_relay_error);
    handlers.insert(events::PING, Agent::on_ping);
    handlers.insert(events::SUBSCRIPTION_SUCCEEDED, Agent::on_subscribed);
    handlers
}

fn check_dispatch_table(handlers: &HashMap<&'static str, Handler>) -> Result<()> {
    match INBOUND_EVENTS.iter().find(|event| !handlers.contains_key(*event)) {
        Some(missing) => Err(AgentError::Dispatch(missing.to_string())),
        None => Ok(()),
    }
}

pub struct Agent {
    config: Arc<AgentConfig>,
    client: RelayClient,
    protocol: ConnectionProtocol,
    store: LogpointStore,
    maintenance: MaintenanceCycle,
    handlers: HashMap<&'static str, Handler>,
}

impl Agent {
    /// Fails on anything that must stop the agent from starting.
    pub fn new(config: Arc<AgentConfig>, transport: Box<dyn Transport>) -> Result<Self> {
        let signer = signer_from_config(&config)?;
        Self::with_signer(config, transport, signer)
    }

    pub fn with_signer(
        config: Arc<AgentConfig>,
        transport: Box<dyn Transport>,
        signer: Box<dyn CredentialSigner>,
    ) -> Result<Self> {
        let handlers = dispatch_table();
        check_dispatch_table(&handlers)?;
        config.verify_directories()?;

        let store = LogpointStore::open(config.logpoints_path())?;
        tracing::info!("Cleared logpoints file {}", store.path().display());

        Ok(Self {
            protocol: ConnectionProtocol::new(&config, signer),
            maintenance: MaintenanceCycle::new(&config),
            client: RelayClient::new(Arc::clone(&config), transport),
            store,
            handlers,
            config,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.protocol.is_ready()
    }

    pub fn protocol(&self) -> &ConnectionProtocol {
        &self.protocol
    }

    pub fn store(&self) -> &LogpointStore {
        &self.store
    }

    pub fn handle_open(&mut self, local_ip: Option<IpAddr>) {
        tracing::info!("Connected to relay");
        self.protocol.on_open(local_ip);
    }

    pub fn handle_close(&mut self) {
        self.protocol.on_close();
    }

    /// Handles one inbound payload. Only a broken transport is returned as an
    /// error; everything else is reported or logged and dropped.
    pub fn handle_message(&mut self, text: &str) -> Result<()> {
        let envelope = match envelope::decode(text, self.config.encryption_key.as_ref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                return match e.wire_code() {
                    Some(code) => {
                        tracing::warn!("Dropping undecodable message: {}", e);
                        self.client.send_error(code, e.to_string())
                    }
                    None => {
                        tracing::warn!("Dropping malformed message: {}", e);
                        Ok(())
                    }
                };
            }
        };

        tracing::debug!("Received message: event={}", envelope.event);
        let Some(handler) = self.handlers.get(envelope.event.as_str()).copied() else {
            tracing::debug!("Ignoring unknown event {}", envelope.event);
            return Ok(());
        };

        match handler(self, &envelope) {
            Err(e @ AgentError::Transport(_)) => Err(e),
            Err(e) => {
                tracing::warn!("Failed to handle {}: {}", envelope.event, e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Scheduler tick. Maintenance only runs once the session is ready.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if !self.protocol.is_ready() {
            return Ok(());
        }

        match self.maintenance.tick(now, &mut self.client, &mut self.store) {
            Err(e @ AgentError::Transport(_)) => Err(e),
            Err(e) => {
                tracing::warn!("Maintenance failed: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn on_connection_established(&mut self, envelope: &Envelope) -> Result<()> {
        let challenge: ConnectionEstablished = envelope.decode_as()?;
        match self.protocol.on_connection_established(&challenge)? {
            Some(reply) => self.client.send(reply, SendPolicy::PLAIN),
            None => Ok(()),
        }
    }

    fn on_authentication_result(&mut self, envelope: &Envelope) -> Result<()> {
        let result: AuthenticationResult = envelope.decode_as()?;
        match self.protocol.on_authentication_result(&result) {
            Some(bootstrap) => self.client.send(bootstrap, SendPolicy::PLAIN),
            None => Ok(()),
        }
    }

    fn on_logpoint_add(&mut self, envelope: &Envelope) -> Result<()> {
        let request: AddRequest = match envelope.decode_as() {
            Ok(request) => request,
            Err(e) => {
                // Without an ID there is nobody to answer.
                let Some(logpoint_id) = envelope.field("logpoint_id").and_then(Value::as_str)
                else {
                    return Err(e);
                };
                let project_id = envelope.field("project_id").and_then(Value::as_i64);
                let reason = LogpointError::InvalidRequest(e.to_string());
                return ops::logpoint_add::report_rejected(
                    &mut self.client,
                    logpoint_id,
                    project_id,
                    &reason,
                );
            }
        };
        ops::logpoint_add(&mut self.client, &mut self.store, &request)
    }

    fn on_logpoint_remove(&mut self, envelope: &Envelope) -> Result<()> {
        let request: RemoveRequest = envelope.decode_as()?;
        ops::logpoint_remove(&mut self.client, &mut self.store, &request).map(|_| ())
    }

    fn on_logpoints_list(&mut self, envelope: &Envelope) -> Result<()> {
        let response = match &envelope.data {
            Some(Value::Array(entries)) => ListResponse {
                logpoints: entries.clone(),
            },
            _ => envelope.decode_as()?,
        };
        ops::logpoints_list(&mut self.client, &mut self.store, &response)
    }

    fn on_relay_error(&mut self, envelope: &Envelope) -> Result<()> {
        let error: RelayError = envelope.decode_as()?;
        ops::relay_error(&mut self.client, &self.protocol, &error)
    }

    fn on_ping(&mut self, _envelope: &Envelope) -> Result<()> {
        self.client.send_pong()
    }

    fn on_subscribed(&mut self, envelope: &Envelope) -> Result<()> {
        tracing::info!(
            "Subscribed to channel {}",
            envelope
                .field("channel")
                .and_then(|channel| channel.as_str())
                .unwrap_or(&self.protocol.session().channel_name)
        );
        Ok(())
    }
}
