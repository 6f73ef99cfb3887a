use std::net::IpAddr;

use anyhow::{Context, Result};
use logpoint_agent_core::AgentConfig;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Endpoint with the application key appended and the configured host applied.
pub fn relay_url(config: &AgentConfig) -> Result<Url> {
    let mut url = Url::parse(&config.relay_endpoint)
        .with_context(|| format!("Invalid relay endpoint '{}'", config.relay_endpoint))?;
    if let Some(key) = &config.relay_key {
        url.query_pairs_mut().append_pair("key", key);
    }
    if let Some(host) = &config.relay_host {
        url.set_host(Some(host))
            .with_context(|| format!("Invalid relay host '{host}'"))?;
    }
    Ok(url)
}

/// Address the TCP socket dials. A configured connect address replaces the
/// endpoint host for the dial only; TLS and the handshake still use the URL.
pub fn connect_address(config: &AgentConfig, url: &Url) -> Result<String> {
    if let Some(address) = &config.connect_address {
        return Ok(address.clone());
    }
    let host = url.host_str().context("Relay endpoint has no host")?;
    let port = url
        .port_or_known_default()
        .context("Relay endpoint has no port")?;
    Ok(format!("{host}:{port}"))
}

fn tls_connector(verify_tls: bool) -> Result<Connector> {
    if !verify_tls {
        tracing::warn!("TLS certificate verification is disabled");
    }
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!verify_tls)
        .danger_accept_invalid_hostnames(!verify_tls)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(Connector::NativeTls(connector))
}

/// Opens the websocket. Returns the socket's local address for host info.
pub async fn connect(config: &AgentConfig) -> Result<(RelayStream, Option<IpAddr>)> {
    let url = relay_url(config)?;
    let address = connect_address(config, &url)?;
    tracing::info!(
        "Connecting to relay {} via {}",
        url.host_str().unwrap_or_default(),
        address
    );

    let tcp = timeout(config.connect_timeout, TcpStream::connect(&address))
        .await
        .with_context(|| format!("Timed out connecting to {address}"))?
        .with_context(|| format!("Failed to connect to {address}"))?;
    let local_ip = tcp.local_addr().ok().map(|addr| addr.ip());

    let connector = match url.scheme() {
        "wss" | "https" => Some(tls_connector(config.verify_tls)?),
        _ => None,
    };
    let (stream, _response) = timeout(
        config.connect_timeout,
        client_async_tls_with_config(url.as_str(), tcp, None, connector),
    )
    .await
    .context("Timed out during websocket handshake")?
    .context("Websocket handshake failed")?;

    Ok((stream, local_ip))
}
