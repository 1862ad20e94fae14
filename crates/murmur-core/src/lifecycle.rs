//! Per-connection lifecycle: attach, run, detach.
//!
//! A connection moves through `Connecting -> Attached -> Detached`. While
//! attached it has one writer task draining its queue into the transport
//! and one reader loop feeding client frames to the bridge. Either side
//! ending closes the handle, which stops the other.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use murmur_protocol::{codec, ChatMessage, PresenceEvent};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::MessageBridge;
use crate::hub::BroadcastHub;
use crate::registry::ClientHandle;
use crate::store::ChatStore;

/// How long a writer waits for the transport to close before dropping it.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Outbound queue capacity per client.
    pub queue_capacity: usize,
    /// Stored messages replayed on attach.
    pub history_limit: usize,
    /// Largest accepted client frame, in bytes.
    pub max_message_size: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            history_limit: 50,
            max_message_size: 64 * 1024,
        }
    }
}

/// An attached connection.
#[derive(Debug)]
pub struct Session {
    /// The handle registered with the hub.
    pub handle: Arc<ClientHandle>,
    /// Receiving end of the handle's outbound queue.
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Drives connections through attach, run and detach.
pub struct ConnectionLifecycle {
    hub: BroadcastHub,
    bridge: Arc<MessageBridge>,
    store: Arc<dyn ChatStore>,
    config: LifecycleConfig,
}

impl ConnectionLifecycle {
    /// Create a lifecycle manager.
    #[must_use]
    pub fn new(
        hub: BroadcastHub,
        bridge: Arc<MessageBridge>,
        store: Arc<dyn ChatStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            hub,
            bridge,
            store,
            config,
        }
    }

    /// Get the limits in effect.
    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Attach a new connection.
    ///
    /// Registers the handle, announces the user online (to the broker and
    /// locally) and queues recent history, oldest first, for this client
    /// only.
    pub async fn attach(&self, requested_username: Option<&str>) -> Session {
        let username = resolve_username(requested_username);
        let (handle, outbound) = ClientHandle::new(username.clone(), self.config.queue_capacity);
        self.hub.registry().register(Arc::clone(&handle));

        info!(client = handle.id(), username = %username, "Client attached");

        let event = PresenceEvent::online(username);
        self.bridge.publish_presence(&event).await;
        self.bridge.apply_presence(event).await;

        self.replay_history(&handle).await;

        Session { handle, outbound }
    }

    async fn replay_history(&self, handle: &Arc<ClientHandle>) {
        let history = match self.store.recent_messages(self.config.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                error!(client = handle.id(), error = %e, "Failed to load history");
                return;
            }
        };

        debug!(client = handle.id(), count = history.len(), "Replaying history");
        for stored in history.into_iter().rev() {
            match codec::encode(&ChatMessage::from(stored)) {
                Ok(payload) => self.hub.send_to(handle, payload),
                Err(e) => error!(client = handle.id(), error = %e, "Failed to encode history"),
            }
        }
    }

    /// Run an attached connection until either direction ends, then detach.
    ///
    /// `sink` receives every payload queued for the client; `stream` yields
    /// the client's text frames.
    pub async fn run<S, R, E>(&self, session: Session, sink: S, stream: R)
    where
        S: Sink<Bytes> + Unpin + Send + 'static,
        S::Error: fmt::Display + Send,
        R: Stream<Item = Result<String, E>> + Unpin + Send,
        E: fmt::Display + Send,
    {
        let Session { handle, outbound } = session;

        let writer = tokio::spawn(write_loop(Arc::clone(&handle), outbound, sink));
        self.read_loop(&handle, stream).await;

        handle.close();
        if let Err(e) = writer.await {
            warn!(client = handle.id(), error = %e, "Writer task failed");
        }

        self.detach(&handle).await;
    }

    async fn read_loop<R, E>(&self, handle: &Arc<ClientHandle>, mut stream: R)
    where
        R: Stream<Item = Result<String, E>> + Unpin + Send,
        E: fmt::Display + Send,
    {
        let closed = wait_closed(handle.closed());
        tokio::pin!(closed);

        loop {
            let frame = tokio::select! {
                _ = &mut closed => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(text)) => self.handle_frame(handle, &text).await,
                Some(Err(e)) => {
                    debug!(client = handle.id(), error = %e, "Read error");
                    break;
                }
                None => break,
            }
        }
    }

    /// Handle one text frame from a client.
    ///
    /// Malformed or oversized frames are logged and skipped. An empty
    /// username falls back to the one the connection attached as.
    pub async fn handle_frame(&self, handle: &ClientHandle, frame: &str) {
        let chat = match codec::decode_client_chat(frame.as_bytes(), self.config.max_message_size)
        {
            Ok(chat) => chat,
            Err(e) => {
                warn!(client = handle.id(), error = %e, "Discarding client frame");
                return;
            }
        };

        let username = if chat.username.is_empty() {
            handle.username()
        } else {
            chat.username.as_str()
        };
        self.bridge.publish_chat(username, &chat.content).await;
    }

    /// Detach a connection: unregister it and announce the user offline.
    ///
    /// Runs at most once per handle; later calls return `false`.
    pub async fn detach(&self, handle: &Arc<ClientHandle>) -> bool {
        if !handle.begin_detach() {
            return false;
        }

        handle.close();
        self.hub.registry().unregister(handle.id());
        info!(client = handle.id(), username = %handle.username(), "Client detached");

        let event = PresenceEvent::offline(handle.username());
        self.bridge.publish_presence(&event).await;
        self.bridge.apply_presence(event).await;
        true
    }
}

async fn write_loop<S>(handle: Arc<ClientHandle>, mut outbound: mpsc::Receiver<Bytes>, mut sink: S)
where
    S: Sink<Bytes> + Unpin,
    S::Error: fmt::Display,
{
    let closed = wait_closed(handle.closed());
    tokio::pin!(closed);

    loop {
        let payload = tokio::select! {
            biased;
            _ = &mut closed => break,
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        // A stalled write must not outlive an eviction
        let sent = tokio::select! {
            biased;
            _ = &mut closed => break,
            sent = sink.send(payload) => sent,
        };
        if let Err(e) = sent {
            debug!(client = handle.id(), error = %e, "Write error");
            break;
        }
    }

    handle.close();
    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(client = handle.id(), error = %e, "Error closing sink"),
        Err(_) => debug!(client = handle.id(), "Sink close timed out, abandoning transport"),
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// The username a connection attaches as: the requested one, or
/// `Guest-<n>` when none was given.
#[must_use]
pub fn resolve_username(requested: Option<&str>) -> String {
    match requested {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            format!("Guest-{}", secs % 1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceTracker;
    use crate::registry::ConnectionRegistry;
    use crate::store::{ActivityKind, MemoryStore};
    use murmur_broker::{Broker, BrokerEvent, LocalBroker, QoS};
    use murmur_protocol::Topics;
    use serde_json::{json, Value};
    use tokio::time::timeout;

    struct Fixture {
        lifecycle: Arc<ConnectionLifecycle>,
        broker: Arc<LocalBroker>,
        events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
        hub: BroadcastHub,
        presence: Arc<PresenceTracker>,
        store: Arc<MemoryStore>,
    }

    /// Build a lifecycle over a loopback broker. With `relay`, the bridge
    /// consumes broker events and is subscribed before this returns.
    async fn fixture(config: LifecycleConfig, relay: bool) -> Fixture {
        let (broker, events) = LocalBroker::new();
        let broker = Arc::new(broker);
        let hub = BroadcastHub::spawn(Arc::new(ConnectionRegistry::new()));
        let presence = Arc::new(PresenceTracker::new());
        let store = Arc::new(MemoryStore::new());
        let bridge = Arc::new(MessageBridge::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            hub.clone(),
            Arc::clone(&presence),
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Topics::default(),
        ));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            hub.clone(),
            Arc::clone(&bridge),
            Arc::clone(&store) as Arc<dyn ChatStore>,
            config,
        ));

        let events = if relay {
            bridge.spawn(events);
            wait_until(|| {
                broker.is_subscribed("chat/messages") && broker.is_subscribed("chat/status")
            })
            .await;
            None
        } else {
            Some(events)
        };

        Fixture {
            lifecycle,
            broker,
            events,
            hub,
            presence,
            store,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|payload| serde_json::from_slice(&payload).unwrap())
            .collect()
    }

    #[test]
    fn test_resolve_username() {
        assert_eq!(resolve_username(Some("alice")), "alice");
        assert!(resolve_username(None).starts_with("Guest-"));
        assert!(resolve_username(Some("  ")).starts_with("Guest-"));

        let n: u64 = resolve_username(None)["Guest-".len()..].parse().unwrap();
        assert!(n < 1000);
    }

    #[tokio::test]
    async fn test_chat_relayed_to_other_clients() {
        let fx = fixture(LifecycleConfig::default(), true).await;
        let alice = fx.lifecycle.attach(Some("alice")).await;
        let mut bob = fx.lifecycle.attach(Some("bob")).await;

        fx.lifecycle
            .handle_frame(&alice.handle, r#"{"content":"hi"}"#)
            .await;

        let chat = timeout(Duration::from_secs(2), async {
            loop {
                let payload = bob.outbound.recv().await.unwrap();
                let value: Value = serde_json::from_slice(&payload).unwrap();
                if value.get("Content").is_some() {
                    return value;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(chat["Username"], "alice");
        assert_eq!(chat["Content"], "hi");

        // Persisted before it was broadcast
        let stored = fx.store.recent_messages(10).await.unwrap();
        assert_eq!(stored[0].username, "alice");
    }

    #[tokio::test]
    async fn test_presence_snapshots_follow_attach_and_detach() {
        let fx = fixture(LifecycleConfig::default(), false).await;
        let mut bob = fx.lifecycle.attach(Some("bob")).await;
        let carol = fx.lifecycle.attach(Some("carol")).await;

        assert!(fx.lifecycle.detach(&carol.handle).await);
        fx.hub.flush().await;

        let statuses = drain(&mut bob.outbound);
        assert_eq!(
            statuses,
            vec![
                json!({"type": "user_status", "onlineUsers": {"bob": true}}),
                json!({"type": "user_status", "onlineUsers": {"bob": true, "carol": true}}),
                json!({"type": "user_status", "onlineUsers": {"bob": true}}),
            ]
        );
        assert!(!fx.hub.registry().contains(carol.handle.id()));
    }

    #[tokio::test]
    async fn test_newcomer_snapshot_includes_everyone_online() {
        let fx = fixture(LifecycleConfig::default(), false).await;
        let _bob = fx.lifecycle.attach(Some("bob")).await;
        let _carol = fx.lifecycle.attach(Some("carol")).await;

        let mut dave = fx.lifecycle.attach(Some("dave")).await;
        fx.hub.flush().await;

        let received = drain(&mut dave.outbound);
        assert_eq!(
            received,
            vec![json!({
                "type": "user_status",
                "onlineUsers": {"bob": true, "carol": true, "dave": true}
            })]
        );
    }

    #[tokio::test]
    async fn test_history_replayed_oldest_first() {
        let fx = fixture(LifecycleConfig::default(), false).await;
        for content in ["one", "two", "three"] {
            fx.store.save_message("alice", content).await.unwrap();
        }

        let mut dave = fx.lifecycle.attach(Some("dave")).await;
        fx.hub.flush().await;

        let received = drain(&mut dave.outbound);
        assert_eq!(received[0]["type"], "user_status");
        let contents: Vec<_> = received[1..].iter().map(|v| v["Content"].clone()).collect();
        assert_eq!(contents, vec![json!("one"), json!("two"), json!("three")]);
    }

    #[tokio::test]
    async fn test_history_limit() {
        let config = LifecycleConfig {
            history_limit: 2,
            ..LifecycleConfig::default()
        };
        let fx = fixture(config, false).await;
        for content in ["one", "two", "three"] {
            fx.store.save_message("alice", content).await.unwrap();
        }

        let mut dave = fx.lifecycle.attach(Some("dave")).await;
        fx.hub.flush().await;

        let received = drain(&mut dave.outbound);
        assert_eq!(received.len(), 3);
        assert_eq!(received[1]["Content"], "two");
        assert_eq!(received[2]["Content"], "three");
    }

    #[tokio::test]
    async fn test_detach_runs_once() {
        let fx = fixture(LifecycleConfig::default(), false).await;
        let erin = fx.lifecycle.attach(Some("erin")).await;

        assert!(fx.lifecycle.detach(&erin.handle).await);
        assert!(!fx.lifecycle.detach(&erin.handle).await);

        let activity = fx.store.recent_activity(10).await.unwrap();
        let kinds: Vec<_> = activity.iter().map(|r| r.event_type).collect();
        assert_eq!(kinds, vec![ActivityKind::Offline, ActivityKind::Online]);
        assert!(!fx.presence.is_online("erin"));
    }

    #[tokio::test]
    async fn test_frames_published_with_fallback_username() {
        let mut fx = fixture(LifecycleConfig::default(), false).await;
        let mut events = fx.events.take().unwrap();
        let _ = events.recv().await;
        fx.broker.subscribe("chat/messages", QoS::AtLeastOnce).await.unwrap();

        let frank = fx.lifecycle.attach(Some("frank")).await;
        fx.lifecycle.handle_frame(&frank.handle, r#"{"content":"a"}"#).await;
        fx.lifecycle
            .handle_frame(&frank.handle, r#"{"username":"franky","content":"b"}"#)
            .await;

        let mut senders = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::Delivery { payload, .. } = event {
                senders.push(codec::decode_chat(&payload).unwrap().username);
            }
        }
        assert_eq!(senders, vec!["frank", "franky"]);
    }

    #[tokio::test]
    async fn test_malformed_and_oversized_frames_skipped() {
        let config = LifecycleConfig {
            max_message_size: 64,
            ..LifecycleConfig::default()
        };
        let mut fx = fixture(config, false).await;
        let mut events = fx.events.take().unwrap();
        let _ = events.recv().await;
        fx.broker.subscribe("chat/messages", QoS::AtLeastOnce).await.unwrap();

        let grace = fx.lifecycle.attach(Some("grace")).await;
        let oversized = format!(r#"{{"content":"{}"}}"#, "x".repeat(100));
        fx.lifecycle.handle_frame(&grace.handle, "not json").await;
        fx.lifecycle.handle_frame(&grace.handle, &oversized).await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_evicted_client_is_detached() {
        let config = LifecycleConfig {
            queue_capacity: 1,
            ..LifecycleConfig::default()
        };
        let fx = fixture(config, false).await;

        // The attach snapshot fills the slow client's only slot
        let slow = fx.lifecycle.attach(Some("slow")).await;
        let _other = fx.lifecycle.attach(Some("other")).await;
        fx.hub.flush().await;

        assert!(slow.handle.is_closed());
        assert!(!fx.hub.registry().contains(slow.handle.id()));
        assert!(fx.presence.is_online("slow"));

        let handle = Arc::clone(&slow.handle);
        let stream = futures_util::stream::pending::<Result<String, std::io::Error>>();
        timeout(
            Duration::from_secs(2),
            fx.lifecycle.run(slow, futures_util::sink::drain(), stream),
        )
        .await
        .unwrap();

        assert!(!fx.presence.is_online("slow"));
        assert!(!fx.lifecycle.detach(&handle).await);
    }

    #[tokio::test]
    async fn test_eviction_interrupts_stalled_write() {
        let config = LifecycleConfig {
            queue_capacity: 1,
            ..LifecycleConfig::default()
        };
        let fx = fixture(config, false).await;
        let slow = fx.lifecycle.attach(Some("slow")).await;
        let handle = Arc::clone(&slow.handle);

        // Accepts nothing: every write stays pending
        let sink = Box::pin(futures_util::sink::unfold((), |(), _payload: Bytes| {
            futures_util::future::pending::<Result<(), std::io::Error>>()
        }));
        let stream = futures_util::stream::pending::<Result<String, std::io::Error>>();

        let lifecycle = Arc::clone(&fx.lifecycle);
        let task = tokio::spawn(async move { lifecycle.run(slow, sink, stream).await });

        fx.hub.broadcast(Bytes::from_static(b"1"));
        fx.hub.broadcast(Bytes::from_static(b"2"));
        fx.hub.flush().await;

        assert!(handle.is_closed());
        assert!(!fx.hub.registry().contains(handle.id()));

        timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert!(!fx.presence.is_online("slow"));
        assert!(!fx.lifecycle.detach(&handle).await);
    }

    #[tokio::test]
    async fn test_run_writes_queue_until_closed() {
        let fx = fixture(LifecycleConfig::default(), false).await;
        let session = fx.lifecycle.attach(Some("heidi")).await;
        let handle = Arc::clone(&session.handle);

        let (tx, mut written) = mpsc::unbounded_channel::<Bytes>();
        let sink = Box::pin(futures_util::sink::unfold(tx, |tx, payload: Bytes| async move {
            tx.send(payload).map_err(|_| "writer gone")?;
            Ok::<_, &'static str>(tx)
        }));
        let stream = futures_util::stream::pending::<Result<String, std::io::Error>>();

        let lifecycle = Arc::clone(&fx.lifecycle);
        let task = tokio::spawn(async move { lifecycle.run(session, sink, stream).await });

        fx.hub.broadcast(Bytes::from_static(b"ping"));
        let ping = timeout(Duration::from_secs(2), async {
            loop {
                let payload = written.recv().await.unwrap();
                if payload == Bytes::from_static(b"ping") {
                    return payload;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ping, Bytes::from_static(b"ping"));

        handle.close();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert!(!fx.presence.is_online("heidi"));
        assert!(fx.hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_run_ends_when_stream_ends() {
        let fx = fixture(LifecycleConfig::default(), true).await;
        let session = fx.lifecycle.attach(Some("ivan")).await;

        let frames = vec![
            Ok::<_, std::io::Error>(r#"{"content":"bye"}"#.to_string()),
            Ok("garbage".to_string()),
        ];
        let stream = futures_util::stream::iter(frames);
        timeout(
            Duration::from_secs(2),
            fx.lifecycle.run(session, futures_util::sink::drain(), stream),
        )
        .await
        .unwrap();

        assert!(fx.hub.registry().is_empty());

        let store = Arc::clone(&fx.store);
        timeout(Duration::from_secs(2), async move {
            loop {
                let stored = store.recent_messages(10).await.unwrap();
                if stored.iter().any(|m| m.content == "bye") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
