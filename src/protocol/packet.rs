//! Packet codec
//!
//! Control messages are single UTF-8 JSON objects terminated by `\n`:
//!
//! ```json
//! {"id": 1700000000000, "type": "lanlink.ping", "body": {"message": "hi"}}
//! ```
//!
//! A packet with an attached binary payload additionally carries a
//! top-level `payloadSize` (bytes, -1 if unknown) and
//! `payloadTransferInfo: {"port": <u16>}`. The payload bytes themselves are
//! never embedded in the JSON; they travel on the payload side-channel.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Payload size announced when the sender does not know it up front
pub const PAYLOAD_SIZE_UNKNOWN: i64 = -1;

/// Out-of-band transfer metadata accompanying a packet with a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Port on the sender where the payload listener accepts one connection
    pub port: u16,
}

/// A single protocol message
///
/// The body is an ordered key/value map; it is immutable after construction
/// except through the payload metadata setters used while a packet is being
/// prepared for transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Millisecond timestamp; monotonic-ish, uniqueness not required
    pub id: i64,

    /// Packet type, e.g. `lanlink.identity`
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Ordered body map
    #[serde(default)]
    pub body: Map<String, Value>,

    /// Payload size in bytes, -1 if unknown; absent for payload-less packets
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Side-channel coordinates; absent for payload-less packets
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<TransferInfo>,
}

impl Packet {
    /// Create a packet with a fresh timestamp id.
    ///
    /// `body` should be a JSON object; any other value yields an empty body.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(Self::timestamp_id(), packet_type, body)
    }

    /// Create a packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    fn timestamp_id() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Check the packet type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Whether transfer metadata announces an out-of-band payload
    pub fn has_payload(&self) -> bool {
        self.payload_transfer_info.is_some()
    }

    /// Stamp the transfer metadata prior to serializing the control line
    pub fn set_payload_info(&mut self, size: i64, port: u16) {
        self.payload_size = Some(size);
        self.payload_transfer_info = Some(TransferInfo { port });
    }

    /// Serialize to a single JSON line without the trailing newline
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to wire bytes: one JSON line terminated by `\n`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = self.to_line()?.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse one line (trailing newline tolerated)
    pub fn from_line(line: &str) -> Result<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Err(LinkError::malformed("empty line"));
        }
        serde_json::from_str(trimmed).map_err(|e| LinkError::malformed(e.to_string()))
    }

    /// Parse wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(bytes)
            .map_err(|_| LinkError::malformed("packet line is not valid UTF-8"))?;
        Self::from_line(line)
    }
}

/// Read one newline-terminated line from a buffered reader, enforcing the
/// byte cap. Returns `Ok(None)` on a clean end of stream.
///
/// Only safe on streams this side owns exclusively (the post-handshake
/// control channel): buffering may read past the newline. For pre-TLS reads
/// use [`read_line_unbuffered`].
pub async fn read_packet_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let (copied, found) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(LinkError::malformed("stream closed mid-line"));
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&buf[..pos]);
                    (pos + 1, true)
                }
                None => {
                    line.extend_from_slice(buf);
                    (buf.len(), false)
                }
            }
        };
        reader.consume(copied);
        if line.len() > cap {
            return Err(LinkError::malformed(format!(
                "line exceeds {} byte cap",
                cap
            )));
        }
        if found {
            break;
        }
    }
    let text = String::from_utf8(line)
        .map_err(|_| LinkError::malformed("packet line is not valid UTF-8"))?;
    Ok(Some(text))
}

/// Read one newline-terminated line byte by byte, never consuming anything
/// past the `\n`.
///
/// Used for the plaintext identity line and the in-TLS identity re-exchange,
/// where bytes after the newline belong to the next protocol phase and must
/// stay in the stream.
pub async fn read_line_unbuffered<S: AsyncRead + Unpin>(
    stream: &mut S,
    cap: usize,
) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(LinkError::malformed("stream closed before newline"));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > cap {
            return Err(LinkError::malformed(format!(
                "line exceeds {} byte cap",
                cap
            )));
        }
    }
    String::from_utf8(line).map_err(|_| LinkError::malformed("packet line is not valid UTF-8"))
}
