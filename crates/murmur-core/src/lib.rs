//! # murmur-core
//!
//! Presence-aware chat distribution for the Murmur hub.
//!
//! - **Presence** - which usernames are online
//! - **Registry** - live client connections and their outbound queues
//! - **Hub** - fan-out to every client, evicting the ones that fall behind
//! - **Bridge** - relay between the external broker and the hub
//! - **Lifecycle** - attach, run and detach of a single connection
//! - **Store** - chat history and activity persistence
//!
//! ## Architecture
//!
//! ```text
//!                 ┌─────────────┐
//!   broker ──────▶│   Bridge    │──────▶ Presence, Store
//!     ▲           └─────────────┘
//!     │                  │
//!     │                  ▼
//! ┌───────────┐   ┌─────────────┐     ┌─────────────┐
//! │ Lifecycle │   │     Hub     │────▶│  Registry   │──▶ client queues
//! └───────────┘   └─────────────┘     └─────────────┘
//!       ▲
//!       │
//!   client frames
//! ```

pub mod bridge;
pub mod hub;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod store;

pub use bridge::MessageBridge;
pub use hub::{BroadcastHub, Delivery, HubStats};
pub use lifecycle::{resolve_username, ConnectionLifecycle, LifecycleConfig, Session};
pub use presence::{PresenceTracker, PresenceUpdate};
pub use registry::{ClientHandle, ClientId, ConnectionRegistry, EnqueueError};
pub use store::{
    ActivityKind, ActivityRecord, ChatStore, MemoryStore, SledStore, StoreError, StoredMessage,
};
