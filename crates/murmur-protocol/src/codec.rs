//! JSON codec for Murmur payloads.
//!
//! Every payload is a single JSON document. Broker deliveries go through
//! [`decode_inbound`], which turns a `(topic, bytes)` pair into a tagged
//! [`InboundEvent`] so callers can route with a `match`.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::messages::{ChatMessage, ClientChat, InboundEvent, PresenceEvent};
use crate::topics::Topics;

/// Maximum payload size accepted from the broker (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds the allowed size.
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A delivery arrived on a topic the hub does not handle.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Encode a value to a JSON payload.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a JSON payload, rejecting anything larger than `max`.
///
/// # Errors
///
/// Returns an error if the payload is too large or is not valid JSON for `T`.
pub fn decode_limited<T: DeserializeOwned>(data: &[u8], max: usize) -> Result<T, ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::PayloadTooLarge {
            size: data.len(),
            max,
        });
    }
    Ok(serde_json::from_slice(data)?)
}

/// Decode a chat message payload.
///
/// # Errors
///
/// Returns an error if the payload is too large or malformed.
pub fn decode_chat(data: &[u8]) -> Result<ChatMessage, ProtocolError> {
    decode_limited(data, MAX_PAYLOAD_SIZE)
}

/// Decode a presence event payload.
///
/// # Errors
///
/// Returns an error if the payload is too large or malformed.
pub fn decode_presence(data: &[u8]) -> Result<PresenceEvent, ProtocolError> {
    decode_limited(data, MAX_PAYLOAD_SIZE)
}

/// Decode a chat frame received from a client connection.
///
/// # Errors
///
/// Returns an error if the frame exceeds `max_size` or is malformed.
pub fn decode_client_chat(data: &[u8], max_size: usize) -> Result<ClientChat, ProtocolError> {
    decode_limited(data, max_size)
}

/// Decode a broker delivery into a tagged event based on its topic.
///
/// # Errors
///
/// Returns an error if the topic is not one of `topics` or the payload
/// does not match the topic's message type.
pub fn decode_inbound(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<InboundEvent, ProtocolError> {
    if topic == topics.chat {
        decode_chat(payload).map(InboundEvent::ChatReceived)
    } else if topic == topics.status {
        decode_presence(payload).map(InboundEvent::PresenceReceived)
    } else {
        Err(ProtocolError::UnknownTopic(topic.to_string()))
    }
}
