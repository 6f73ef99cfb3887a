//! Logpoint Agent Core
//!
//! Protocol and state engine of a remote-debugging agent. Authenticates
//! against a pub/sub relay, installs logpoints requested over the relay into
//! a configuration file read by the runtime instrumentation hook, and ships
//! the hook's captured results back. Transport and process wiring live in the
//! `logpoint_agent` binary.

pub mod agent;
pub mod cipher;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod maintenance;
pub mod ops;
pub mod protocol;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use agent::Agent;
pub use client::{ChannelTransport, RelayClient, Transport};
pub use config::AgentConfig;
pub use envelope::{Envelope, SendPolicy};
pub use error::{AgentError, LogpointError};
pub use protocol::{ConnectionProtocol, ConnectionState, CredentialSigner};
pub use store::{Logpoint, LogpointStore};

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;
