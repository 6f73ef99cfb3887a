//! Wire envelope and the compress/encrypt pipeline applied to its `data`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cipher::{self, SecretKey};
use crate::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Per-message choice of transformations; decided by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendPolicy {
    pub compress: bool,
    pub encrypt: bool,
}

impl SendPolicy {
    pub const PLAIN: SendPolicy = SendPolicy {
        compress: false,
        encrypt: false,
    };
}

impl Envelope {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            header: None,
            data: None,
            compressed: false,
            encrypted: false,
            nonce: None,
            ciphertext: None,
        }
    }

    pub fn with_header(mut self, header: Value) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Looks a field up in `header` first, then in `data`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        [self.header.as_ref(), self.data.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|section| section.get(name))
    }

    /// Decodes the union of `header` and `data` into a typed request.
    /// Header fields win when both sections carry the same key.
    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T> {
        let mut merged = Map::new();
        for section in [self.data.as_ref(), self.header.as_ref()].into_iter().flatten() {
            if let Value::Object(fields) = section {
                merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(serde_json::from_value(Value::Object(merged))?)
    }
}

/// Applies compress-then-encrypt to `data` and serializes the envelope.
pub fn encode(mut envelope: Envelope, policy: SendPolicy, key: Option<&SecretKey>) -> Result<String> {
    if let Some(data) = envelope.data.take() {
        let mut payload = serde_json::to_vec(&data)?;
        let mut data = Some(data);

        if policy.compress {
            payload = cipher::compress(&payload)?;
            data = Some(Value::String(BASE64.encode(&payload)));
            envelope.compressed = true;
        }

        if policy.encrypt {
            let key = key.ok_or_else(|| {
                AgentError::Crypto("encryption requested but no key is configured".into())
            })?;
            let (nonce, ciphertext) = cipher::encrypt(&payload, key)?;
            envelope.nonce = Some(BASE64.encode(nonce));
            envelope.ciphertext = Some(BASE64.encode(ciphertext));
            envelope.encrypted = true;
            data = None;
        }

        envelope.data = data;
    }

    Ok(serde_json::to_string(&envelope)?)
}

/// Parses an inbound payload and reverses the pipeline. The returned envelope
/// has plain structured `data` and both flags cleared.
pub fn decode(text: &str, key: Option<&SecretKey>) -> Result<Envelope> {
    let mut envelope: Envelope = serde_json::from_str(text)?;
    let mut raw: Option<Vec<u8>> = None;

    if envelope.encrypted {
        let nonce = envelope.nonce.take().ok_or(AgentError::Decryption)?;
        let ciphertext = envelope.ciphertext.take().ok_or(AgentError::Decryption)?;
        let key = key.ok_or(AgentError::Decryption)?;
        let nonce = BASE64.decode(nonce).map_err(|_| AgentError::Decryption)?;
        let ciphertext = BASE64.decode(ciphertext).map_err(|_| AgentError::Decryption)?;
        raw = Some(cipher::decrypt(&nonce, &ciphertext, key)?);
        envelope.encrypted = false;
    }

    if envelope.compressed {
        let compressed = match raw.take() {
            Some(bytes) => bytes,
            None => match envelope.data.take() {
                Some(Value::String(encoded)) => BASE64.decode(encoded).map_err(|e| {
                    AgentError::Decompression(format!("compressed data is not base64: {e}"))
                })?,
                _ => {
                    return Err(AgentError::Decompression(
                        "compressed data must be a base64 string".into(),
                    ))
                }
            },
        };
        raw = Some(cipher::decompress(&compressed)?);
        envelope.compressed = false;
    }

    match raw {
        Some(bytes) => envelope.data = Some(serde_json::from_slice(&bytes)?),
        None => {
            // Relays commonly send `data` as a JSON-encoded string.
            if let Some(Value::String(inner)) = &envelope.data {
                if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(inner) {
                    envelope.data = Some(parsed);
                }
            }
        }
    }

    Ok(envelope)
}
