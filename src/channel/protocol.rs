//! Control-channel wire protocol.
//!
//! Length-prefixed JSON frames over TCP:
//! `[u64 total_len][i32 msg_type][payload bytes]`, where
//! `total_len = sizeof(msg_type) + payload_len`. Frames above 1 MiB or
//! without a type word are rejected before any payload parse.

use crate::error::{KvError, KvResult};
use crate::memory::{MemAddr, MemKind};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on `total_len`.
pub const MAX_FRAME_LEN: u64 = 1024 * 1024;
/// Size of the message-type word inside `total_len`.
const MSG_TYPE_LEN: u64 = std::mem::size_of::<i32>() as u64;
/// Longest accepted notify name or message, in characters.
pub const MAX_NOTIFY_LEN: usize = 1024;

/// Registered address range advertised in a `Connect` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddrRange {
    /// Placement of the range.
    pub mem_type: MemKind,
    /// First byte.
    pub start: MemAddr,
    /// One past the last byte.
    pub end: MemAddr,
}

/// Control messages exchanged over a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Connection request/reply, exchanged in both directions.
    Connect {
        /// Channel id minted by the client.
        channel_id: String,
        /// Opaque communicator resource description.
        comm_res: Option<serde_json::Value>,
        /// Handshake budget in milliseconds.
        timeout: u64,
        /// The sender's registered ranges.
        addrs: Vec<AddrRange>,
    },
    /// Client-initiated teardown.
    Disconnect {
        /// Channel being torn down.
        channel_id: String,
    },
    /// Receiver-to-sender outcome report.
    Status {
        /// Stable numeric code; non-zero tears the link down.
        error_code: u32,
        /// Human-readable detail.
        error_message: String,
    },
    /// Lightweight application notification.
    Notify {
        /// Notification name, at most 1024 characters.
        name: String,
        /// Notification body, at most 1024 characters.
        message: String,
    },
    /// Server asks the client to disconnect a channel.
    RequestDisconnect {
        /// Channel the server wants released.
        channel_id: String,
        /// Correlation id, monotonically increasing.
        req_id: u64,
        /// Response budget in milliseconds.
        timeout: u64,
    },
    /// Client's answer to a disconnect request.
    RequestDisconnectResp {
        /// Correlation id echoed back.
        req_id: u64,
        /// Zero when the client agreed to disconnect.
        error_code: u32,
        /// Detail when refusing.
        error_message: String,
    },
    /// Periodic liveness probe.
    Heartbeat {
        /// Sending channel.
        channel_id: String,
    },
    /// Application message dispatched through the handler registry.
    App {
        /// Registry key.
        msg_type: i32,
        /// Handler-defined JSON payload.
        payload: serde_json::Value,
    },
}

impl ControlMessage {
    /// Wire type word for this message.
    pub fn msg_type(&self) -> i32 {
        match self {
            ControlMessage::Connect { .. } => 1,
            ControlMessage::Disconnect { .. } => 2,
            ControlMessage::Status { .. } => 3,
            ControlMessage::Notify { .. } => 4,
            ControlMessage::RequestDisconnect { .. } => 5,
            ControlMessage::RequestDisconnectResp { .. } => 6,
            ControlMessage::Heartbeat { .. } => 7,
            ControlMessage::App { msg_type, .. } => *msg_type,
        }
    }

    /// Validate limits that the framing layer cannot see.
    pub fn validate(&self) -> KvResult<()> {
        if let ControlMessage::Notify { name, message } = self {
            if name.chars().count() > MAX_NOTIFY_LEN {
                return Err(KvError::ParamInvalid(format!(
                    "notify name length {} exceeds {}",
                    name.chars().count(),
                    MAX_NOTIFY_LEN
                )));
            }
            if message.chars().count() > MAX_NOTIFY_LEN {
                return Err(KvError::ParamInvalid(format!(
                    "notify message length {} exceeds {}",
                    message.chars().count(),
                    MAX_NOTIFY_LEN
                )));
            }
        }
        Ok(())
    }

    fn payload(&self) -> KvResult<Vec<u8>> {
        // The enum tag travels in the frame header, not in the JSON body.
        let value = match self {
            ControlMessage::Connect { channel_id, comm_res, timeout, addrs } => serde_json::json!({
                "channel_id": channel_id,
                "comm_res": comm_res,
                "timeout": timeout,
                "addrs": addrs,
            }),
            ControlMessage::Disconnect { channel_id } => serde_json::json!({
                "channel_id": channel_id,
            }),
            ControlMessage::Status { error_code, error_message } => serde_json::json!({
                "error_code": error_code,
                "error_message": error_message,
            }),
            ControlMessage::Notify { name, message } => serde_json::json!({
                "name": name,
                "message": message,
            }),
            ControlMessage::RequestDisconnect { channel_id, req_id, timeout } => serde_json::json!({
                "channel_id": channel_id,
                "req_id": req_id,
                "timeout": timeout,
            }),
            ControlMessage::RequestDisconnectResp { req_id, error_code, error_message } => serde_json::json!({
                "req_id": req_id,
                "error_code": error_code,
                "error_message": error_message,
            }),
            ControlMessage::Heartbeat { channel_id } => serde_json::json!({
                "channel_id": channel_id,
            }),
            ControlMessage::App { payload, .. } => payload.clone(),
        };
        Ok(serde_json::to_vec(&value)?)
    }

    fn from_parts(msg_type: i32, payload: &[u8]) -> KvResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let get_str = |key: &str| -> KvResult<String> {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| KvError::Failed(format!("frame missing field '{}'", key)))
        };
        let get_u64 = |key: &str| -> KvResult<u64> {
            value
                .get(key)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| KvError::Failed(format!("frame missing field '{}'", key)))
        };
        match msg_type {
            1 => Ok(ControlMessage::Connect {
                channel_id: get_str("channel_id")?,
                comm_res: value.get("comm_res").filter(|v| !v.is_null()).cloned(),
                timeout: get_u64("timeout")?,
                addrs: serde_json::from_value(
                    value.get("addrs").cloned().unwrap_or(serde_json::Value::Null),
                )?,
            }),
            2 => Ok(ControlMessage::Disconnect { channel_id: get_str("channel_id")? }),
            3 => Ok(ControlMessage::Status {
                error_code: get_u64("error_code")? as u32,
                error_message: get_str("error_message")?,
            }),
            4 => Ok(ControlMessage::Notify {
                name: get_str("name")?,
                message: get_str("message")?,
            }),
            5 => Ok(ControlMessage::RequestDisconnect {
                channel_id: get_str("channel_id")?,
                req_id: get_u64("req_id")?,
                timeout: get_u64("timeout")?,
            }),
            6 => Ok(ControlMessage::RequestDisconnectResp {
                req_id: get_u64("req_id")?,
                error_code: get_u64("error_code")? as u32,
                error_message: get_str("error_message")?,
            }),
            7 => Ok(ControlMessage::Heartbeat { channel_id: get_str("channel_id")? }),
            other if other > 7 => Ok(ControlMessage::App { msg_type: other, payload: value }),
            other => Err(KvError::Failed(format!("unknown message type {}", other))),
        }
    }

    /// Encode the full frame.
    pub fn encode(&self) -> KvResult<Vec<u8>> {
        self.validate()?;
        let payload = self.payload()?;
        let total_len = MSG_TYPE_LEN + payload.len() as u64;
        if total_len > MAX_FRAME_LEN {
            return Err(KvError::ParamInvalid(format!(
                "frame length {} exceeds {}",
                total_len, MAX_FRAME_LEN
            )));
        }
        let mut frame = Vec::with_capacity(8 + total_len as usize);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&self.msg_type().to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Write one frame to the stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> KvResult<()> {
        let frame = self.encode()?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one frame from the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> KvResult<Self> {
        let total_len = stream.read_u64().await?;
        if total_len <= MSG_TYPE_LEN || total_len > MAX_FRAME_LEN {
            return Err(KvError::Failed(format!("bad frame length {}", total_len)));
        }
        let msg_type = stream.read_i32().await?;
        let payload_len = (total_len - MSG_TYPE_LEN) as usize;
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await?;
        let message = Self::from_parts(msg_type, &payload)?;
        message.validate()?;
        Ok(message)
    }
}
