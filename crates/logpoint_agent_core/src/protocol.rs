//! Relay authentication handshake and the readiness gate.

use std::net::IpAddr;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::envelope::Envelope;
use crate::types::{
    events, AuthenticateData, AuthenticationResult, ConnectionEstablished, HostInfo, RelayError,
};
use crate::{AgentConfig, AgentError, Result};

type HmacSha256 = Hmac<Sha256>;

const SIGNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns a relay challenge into a credential the relay will accept.
pub trait CredentialSigner: Send {
    fn sign(&self, socket_id: &str) -> Result<String>;
}

/// Signs locally with the shared API secret.
pub struct HmacSigner {
    api_key_id: String,
    secret: String,
}

impl HmacSigner {
    pub fn new(api_key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key_id: api_key_id.into(),
            secret: secret.into(),
        }
    }
}

impl CredentialSigner for HmacSigner {
    fn sign(&self, socket_id: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AgentError::Signer(e.to_string()))?;
        mac.update(format!("{socket_id}:{}", self.api_key_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Asks a remote endpoint to sign the challenge. Blocks the caller.
pub struct HttpSigner {
    endpoint: String,
    api_key_id: String,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct SignResponse {
    auth: String,
}

impl HttpSigner {
    pub fn new(endpoint: impl Into<String>, api_key_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key_id: api_key_id.into(),
            agent: ureq::AgentBuilder::new().timeout(SIGNER_TIMEOUT).build(),
        }
    }
}

impl CredentialSigner for HttpSigner {
    fn sign(&self, socket_id: &str) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(json!({
                "socket_id": socket_id,
                "api_key_id": self.api_key_id,
            }))
            .map_err(|e| AgentError::Signer(format!("signing endpoint request failed: {e}")))?;
        let body: SignResponse = response
            .into_json()
            .map_err(|e| AgentError::Signer(format!("invalid signing endpoint response: {e}")))?;
        Ok(body.auth)
    }
}

/// Picks the signer the configuration asks for.
pub fn signer_from_config(config: &AgentConfig) -> Result<Box<dyn CredentialSigner>> {
    match (&config.auth_endpoint, &config.api_secret) {
        (Some(endpoint), _) => Ok(Box::new(HttpSigner::new(endpoint, &config.api_key_id))),
        (None, Some(secret)) => Ok(Box::new(HmacSigner::new(&config.api_key_id, secret))),
        (None, None) => Err(AgentError::config("no credential signer configured")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Ready,
    /// The relay refused the credential; stays here until the connection closes.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub channel_name: String,
    pub authenticated: bool,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
}

pub struct ConnectionProtocol {
    state: ConnectionState,
    session: ConnectionSession,
    api_key_id: String,
    host_info: HostInfo,
    signer: Box<dyn CredentialSigner>,
}

impl ConnectionProtocol {
    pub fn new(config: &AgentConfig, signer: Box<dyn CredentialSigner>) -> Self {
        let encryption_enabled = config.encryption_enabled();
        Self {
            state: ConnectionState::Connecting,
            session: ConnectionSession {
                channel_name: channel_name(&config.api_key_id, encryption_enabled),
                authenticated: false,
                encryption_enabled,
                compression_enabled: config.compression,
            },
            api_key_id: config.api_key_id.clone(),
            host_info: HostInfo {
                internal_ips: Vec::new(),
                hostname: config.hostname.clone().unwrap_or_else(detect_hostname),
                runtime_version: config.runtime_version.clone(),
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
                labels: config.labels.clone(),
            },
            signer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Transport is up; `local_ip` is the address the socket is bound to.
    pub fn on_open(&mut self, local_ip: Option<IpAddr>) {
        if let Some(ip) = local_ip {
            self.host_info.internal_ips = vec![ip.to_string()];
        }
        self.state = ConnectionState::AwaitingChallenge;
        self.session.authenticated = false;
    }

    pub fn on_close(&mut self) {
        if self.state != ConnectionState::Connecting {
            tracing::info!("Relay connection closed in state {:?}", self.state);
        }
        self.state = ConnectionState::Connecting;
        self.session.authenticated = false;
    }

    /// Answers the relay challenge with an `authenticate-as-server` message.
    /// Answers the relay's challenge. Returns `None` when no challenge is
    /// expected, so a rejected session cannot authenticate again on the same
    /// connection.
    pub fn on_connection_established(
        &mut self,
        challenge: &ConnectionEstablished,
    ) -> Result<Option<Envelope>> {
        if self.state != ConnectionState::AwaitingChallenge {
            tracing::warn!(
                "Ignoring connection challenge for socket {} in state {:?}",
                challenge.socket_id,
                self.state
            );
            return Ok(None);
        }

        let auth = self.signer.sign(&challenge.socket_id)?;
        let data = AuthenticateData {
            api_key_id: self.api_key_id.clone(),
            channel: self.session.channel_name.clone(),
            auth,
            host_info: self.host_info.clone(),
        };

        self.state = ConnectionState::Authenticating;
        self.session.authenticated = false;
        tracing::info!(
            "Authenticating on channel {} (socket {})",
            self.session.channel_name,
            challenge.socket_id
        );

        Ok(Some(
            Envelope::new(events::AUTHENTICATE_AS_SERVER).with_data(serde_json::to_value(data)?),
        ))
    }

    /// On success returns the `logpoints-list` bootstrap request.
    pub fn on_authentication_result(&mut self, result: &AuthenticationResult) -> Option<Envelope> {
        if self.state != ConnectionState::Authenticating {
            tracing::warn!("Ignoring authentication result in state {:?}", self.state);
            return None;
        }
        if !result.result {
            tracing::warn!("Relay rejected authentication; agent stays idle until reconnect");
            self.state = ConnectionState::Rejected;
            self.session.authenticated = false;
            return None;
        }

        tracing::info!("Authenticated with relay; requesting known logpoints");
        self.state = ConnectionState::Ready;
        self.session.authenticated = true;
        Some(Envelope::new(events::LOGPOINTS_LIST))
    }

    /// Relay protocol errors are non-fatal. Only payload-size violations are
    /// reported back, as `DATA_CONTENT_LIMIT_EXCEEDED`.
    pub fn on_relay_error(&self, error: &RelayError) -> Option<&'static str> {
        let message = error.message.as_deref().unwrap_or_default();
        if is_payload_size_violation(message) {
            tracing::warn!("Relay rejected an oversized payload: {}", message);
            Some("DATA_CONTENT_LIMIT_EXCEEDED")
        } else {
            tracing::warn!(
                "Relay protocol error (code {:?}): {}",
                error.code,
                message
            );
            None
        }
    }
}

pub fn channel_name(api_key_id: &str, encrypted: bool) -> String {
    if encrypted {
        format!("private-encrypted-{api_key_id}")
    } else {
        format!("private-{api_key_id}")
    }
}

/// Wording relays use when a single event is over the size cap.
const SIZE_VIOLATION_PHRASES: &[&str] = &[
    "too large",
    "too big",
    "size exceeds",
    "exceeds the allowed maximum",
    "maximum size",
    "size limit",
];
/// Throttling errors also talk about limits but say nothing about size.
const THROTTLING_WORDS: &[&str] = &["rate", "quota", "throttled", "frequency"];

fn is_payload_size_violation(message: &str) -> bool {
    let lower = message.to_lowercase();
    let throttling = lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| THROTTLING_WORDS.contains(&word));
    !throttling && SIZE_VIOLATION_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
