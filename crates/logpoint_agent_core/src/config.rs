use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cipher::SecretKey;
use crate::{AgentError, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_SHIP_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_LOGPOINTS_FILE: &str = "logpoints.conf";
const DEFAULT_RESULTS_SUBDIR: &str = "logs";
const WRITE_CHECK_NAME: &str = ".agent-write-check";

/// Everything the agent needs, read once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay_endpoint: String,
    pub relay_host: Option<String>,
    pub relay_key: Option<String>,
    pub verify_tls: bool,
    /// `host:port` the TCP socket dials instead of the endpoint's host. This
    /// is not a nameserver override: no DNS lookup is redirected, and the
    /// endpoint host is still used for TLS SNI and the `Host` header.
    pub connect_address: Option<String>,
    pub connect_timeout: Duration,
    pub tick_interval: Duration,
    pub ship_interval: Duration,
    pub compression: bool,
    /// Present only when end-to-end encryption is enabled.
    pub encryption_key: Option<SecretKey>,
    pub api_key_id: String,
    pub api_secret: Option<String>,
    pub auth_endpoint: Option<String>,
    pub data_dir: PathBuf,
    pub logpoints_file: String,
    pub results_subdir: String,
    pub runtime_version: String,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |name: &str| {
            get(name).ok_or_else(|| AgentError::config(format!("{name} is not set")))
        };

        // An unrecognised value must not silently select the insecure side.
        let flag = |name: &str, default: bool| match get(name) {
            None => Ok(default),
            Some(value) => parse_bool(&value).ok_or_else(|| {
                AgentError::config(format!("{name} must be a boolean, got '{value}'"))
            }),
        };

        let encryption_enabled = flag("AGENT_E2E_ENCRYPTION", false)?;
        let encryption_key = if encryption_enabled {
            let encoded = require("AGENT_E2E_KEY")?;
            Some(SecretKey::from_base64(&encoded)?)
        } else {
            None
        };

        let auth_endpoint = get("AGENT_AUTH_ENDPOINT");
        let api_secret = get("AGENT_API_SECRET");
        if auth_endpoint.is_none() && api_secret.is_none() {
            return Err(AgentError::config(
                "AGENT_API_SECRET is not set and no AGENT_AUTH_ENDPOINT is configured",
            ));
        }

        let tick_interval = get("AGENT_TICK_INTERVAL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .filter(|interval| *interval >= MIN_TICK_INTERVAL)
            .unwrap_or(DEFAULT_TICK_INTERVAL);

        Ok(Self {
            relay_endpoint: require("AGENT_RELAY_ENDPOINT")?,
            relay_host: get("AGENT_RELAY_HOST"),
            relay_key: get("AGENT_RELAY_KEY"),
            verify_tls: flag("AGENT_RELAY_VERIFY_TLS", true)?,
            connect_address: get("AGENT_RELAY_CONNECT_ADDRESS"),
            connect_timeout: get("AGENT_CONNECT_TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            tick_interval,
            ship_interval: get("AGENT_SHIP_INTERVAL_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SHIP_INTERVAL),
            compression: flag("AGENT_COMPRESSION", true)?,
            encryption_key,
            api_key_id: require("AGENT_API_KEY_ID")?,
            api_secret,
            auth_endpoint,
            data_dir: PathBuf::from(require("AGENT_DATA_DIR")?),
            logpoints_file: get("AGENT_LOGPOINTS_FILE")
                .unwrap_or_else(|| DEFAULT_LOGPOINTS_FILE.to_string()),
            results_subdir: get("AGENT_RESULTS_SUBDIR")
                .unwrap_or_else(|| DEFAULT_RESULTS_SUBDIR.to_string()),
            runtime_version: get("AGENT_RUNTIME_VERSION").unwrap_or_else(|| "unknown".to_string()),
            hostname: get("AGENT_HOSTNAME"),
            labels: get("AGENT_LABELS").map(|v| parse_labels(&v)).unwrap_or_default(),
        })
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_key.is_some()
    }

    pub fn logpoints_path(&self) -> PathBuf {
        self.data_dir.join(&self.logpoints_file)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join(&self.results_subdir)
    }

    /// Checks the directories shared with the instrumentation hook. Any failure
    /// here means the agent must not start.
    pub fn verify_directories(&self) -> Result<()> {
        if !self.data_dir.is_dir() {
            return Err(AgentError::config(format!(
                "Data directory '{}' does not exist",
                self.data_dir.display()
            )));
        }

        let results_dir = self.results_dir();
        if !results_dir.is_dir() {
            return Err(AgentError::config(format!(
                "Results directory '{}' does not exist",
                results_dir.display()
            )));
        }
        check_writable(&results_dir)?;

        let logpoints_path = self.logpoints_path();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logpoints_path)
            .map_err(|e| {
                AgentError::config(format!(
                    "Logpoints file '{}' is not writable: {e}",
                    logpoints_path.display()
                ))
            })?;

        Ok(())
    }
}

fn check_writable(dir: &Path) -> Result<()> {
    let marker = dir.join(WRITE_CHECK_NAME);
    fs::write(&marker, b"").map_err(|e| {
        AgentError::config(format!("Directory '{}' is not writable: {e}", dir.display()))
    })?;
    fs::remove_file(&marker)?;
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_labels(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
