//! Compact text envelope for carrying signaling over a rendezvous channel
//! (chat, QR code, clipboard): JSON, gzip, base64.

use crate::peer::types::{Description, IceCandidate};
use crate::utils::random_id;
use crate::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

// Ограничение размера распакованных данных (защита от zip-bomb)
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// What one side tells the other
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum SignalMessage {
    Description(Description),
    Candidates(Vec<IceCandidate>),
}

impl From<Description> for SignalMessage {
    fn from(d: Description) -> Self {
        SignalMessage::Description(d)
    }
}

impl From<Vec<IceCandidate>> for SignalMessage {
    fn from(c: Vec<IceCandidate>) -> Self {
        SignalMessage::Candidates(c)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub id: String,
    /// Unix time, milliseconds
    pub ts: i64,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(message: impl Into<SignalMessage>) -> Self {
        Self {
            id: random_id(),
            ts: chrono::Utc::now().timestamp_millis(),
            message: message.into(),
        }
    }
}

pub fn encode(envelope: &SignalEnvelope) -> Result<String> {
    // 1. JSON -> bytes
    let json = serde_json::to_vec(envelope)?;

    // 2. GZIP
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    // 3. base64
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode(s: &str) -> Result<SignalEnvelope> {
    let compressed = general_purpose::STANDARD.decode(s.trim())?;

    let mut json = Vec::new();
    GzDecoder::new(&compressed[..])
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut json)?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(Error::Codec(format!(
            "envelope exceeds {MAX_DECOMPRESSED_SIZE} bytes"
        )));
    }

    Ok(serde_json::from_slice(&json)?)
}
