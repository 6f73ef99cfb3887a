mod transport;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use logpoint_agent_core::{Agent, AgentConfig, ChannelTransport};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

/// Delay before exiting on a failure so a supervisor does not restart in a
/// tight loop.
const FATAL_EXIT_DELAY: Duration = Duration::from_secs(30);

fn bootstrap() -> Result<(Arc<AgentConfig>, Agent, UnboundedReceiver<String>)> {
    let config = Arc::new(AgentConfig::from_env().context("Invalid configuration")?);
    let (transport, outbound) = ChannelTransport::new();
    let agent = Agent::new(Arc::clone(&config), Box::new(transport))
        .context("Agent failed to start")?;
    Ok((config, agent, outbound))
}

/// Runs one relay connection until it closes.
async fn run(
    config: &AgentConfig,
    agent: &mut Agent,
    outbound: &mut UnboundedReceiver<String>,
) -> Result<()> {
    let (stream, local_ip) = transport::connect(config).await?;
    let (mut sink, mut stream) = stream.split();
    agent.handle_open(local_ip);

    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => agent.handle_message(&text)?,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => agent.handle_message(&text)?,
                    Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Relay closed the connection: {:?}", frame);
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e).context("Websocket error"),
                None => break Ok(()),
            },
            Some(payload) = outbound.recv() => {
                sink.send(Message::Text(payload)).await.context("Failed to send to relay")?;
            }
            _ = ticker.tick() => agent.tick(Instant::now())?,
        }
    };

    agent.handle_close();
    result
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, mut agent, mut outbound) = match bootstrap() {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!("Refusing to start: {:#}", e);
            sleep(FATAL_EXIT_DELAY).await;
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        "Starting logpoint agent {} (channel {})",
        env!("CARGO_PKG_VERSION"),
        agent.protocol().session().channel_name
    );

    match run(&config, &mut agent, &mut outbound).await {
        Ok(()) => tracing::info!("Relay connection closed; exiting so the supervisor reconnects"),
        Err(e) => {
            tracing::error!("Relay connection failed: {:#}", e);
            sleep(FATAL_EXIT_DELAY).await;
        }
    }

    ExitCode::FAILURE
}
