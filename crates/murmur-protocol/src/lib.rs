//! # murmur-protocol
//!
//! Wire contract for the Murmur chat hub.
//!
//! Two audiences share these types:
//!
//! - **Broker topics** - `chat/messages` carries [`ChatMessage`],
//!   `chat/status` carries [`PresenceEvent`]
//! - **Client connections** - clients send [`ClientChat`], the hub sends
//!   [`ChatMessage`] and [`ServerEvent::UserStatus`]
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, ChatMessage, InboundEvent, Topics};
//!
//! let topics = Topics::default();
//! let message = ChatMessage::new("alice", "hi");
//! let payload = codec::encode(&message).unwrap();
//!
//! match codec::decode_inbound(&topics, &topics.chat, &payload).unwrap() {
//!     InboundEvent::ChatReceived(decoded) => assert_eq!(decoded.content, "hi"),
//!     other => panic!("unexpected event: {other:?}"),
//! }
//! ```

pub mod codec;
pub mod messages;
pub mod topics;

pub use codec::{decode_inbound, encode, ProtocolError};
pub use messages::{ChatMessage, ClientChat, InboundEvent, OnlineSet, PresenceEvent, ServerEvent};
pub use topics::{Topics, CHAT_TOPIC, STATUS_TOPIC};
