//! Invalidation channels.
//!
//! The room-list and notification channels carry only a discriminator
//! (`{"type": "room_list_update"}`), never a payload: receivers re-fetch
//! authoritative state. Delivery is at-least-once and unordered relative to
//! REST responses. The bus is injected into each component rather than held
//! as a global so that tests can substitute [`LocalBus`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Default number of signals buffered per subscriber.
pub const BUS_CHANNEL_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    RoomListUpdate,
    NotificationListUpdate,
    Ban,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::RoomListUpdate => "room_list_update",
            Signal::NotificationListUpdate => "notification_list_update",
            Signal::Ban => "ban",
        }
    }

    /// Parse a `{"type": ...}` frame. Unknown discriminators and malformed
    /// frames yield `None` and are ignored by every consumer.
    pub fn parse(frame: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
        }
        let env: Envelope = serde_json::from_str(frame).ok()?;
        match env.kind.as_str() {
            "room_list_update" => Some(Signal::RoomListUpdate),
            "notification_list_update" => Some(Signal::NotificationListUpdate),
            "ban" => Some(Signal::Ban),
            _ => None,
        }
    }

    pub fn to_frame(self) -> String {
        serde_json::json!({ "type": self.as_str() }).to_string()
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fan-out pub/sub handle. No mutation ever travels over it.
pub trait InvalidationBus: Send + Sync {
    fn publish(&self, signal: Signal) -> impl Future<Output = Result<()>> + Send;
    fn subscribe(&self) -> broadcast::Receiver<Signal>;
}

impl<B: InvalidationBus> InvalidationBus for Arc<B> {
    fn publish(&self, signal: Signal) -> impl Future<Output = Result<()>> + Send {
        (**self).publish(signal)
    }

    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        (**self).subscribe()
    }
}

/// What a subscriber sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Signal(Signal),
    /// The subscriber fell behind and `n` signals were dropped. Consumers
    /// treat this as an invalidation of whatever they hold.
    Lagged(u64),
}

/// Stream view over a bus subscription.
pub struct Subscription {
    inner: BroadcastStream<Signal>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<Signal>) -> Self {
        Self { inner: BroadcastStream::new(rx) }
    }

    /// Next delivery, or `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        match self.inner.next().await? {
            Ok(signal) => Some(Delivery::Signal(signal)),
            Err(BroadcastStreamRecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// In-process bus backed by `tokio::sync::broadcast`.
///
/// Several directory or inbox instances sharing one `LocalBus` behave like
/// several tabs sharing the backend's broadcast group.
#[derive(Debug)]
pub struct LocalBus {
    tx: broadcast::Sender<Signal>,
    published: AtomicUsize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CHANNEL_CAP)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx, published: AtomicUsize::new(0) }
    }

    /// Deliver a signal as if the server had pushed it.
    pub fn inject(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    /// Number of signals published through [`InvalidationBus::publish`].
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus for LocalBus {
    async fn publish(&self, signal: Signal) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // no subscribers is not an error for a fan-out channel
        let _ = self.tx.send(signal);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Websocket bus
// ---------------------------------------------------------------------------

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Bus backed by one of the backend's broadcast websocket endpoints.
///
/// A reader task parses incoming frames and re-broadcasts recognized signals
/// locally. `publish` writes a frame that the backend fans out to the whole
/// group, including this connection. Dropping the bus aborts the reader and
/// with it the subscription.
pub struct WsBus {
    url: String,
    tx: broadcast::Sender<Signal>,
    sink: Mutex<WsSink>,
    reader: JoinHandle<()>,
}

impl WsBus {
    pub async fn connect(url: impl Into<String>, capacity: usize) -> Result<Self> {
        let url = url.into();
        let (stream, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Channel(format!("{url}: {e}")))?;
        info!(url = %url, "broadcast channel open");

        let (sink, mut source) = stream.split();
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        let reader_tx = tx.clone();
        let reader_url = url.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match Signal::parse(&text) {
                        Some(signal) => {
                            debug!(url = %reader_url, %signal, "signal received");
                            let _ = reader_tx.send(signal);
                        }
                        None => debug!(url = %reader_url, "ignoring unrecognized frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(url = %reader_url, error = %e, "broadcast channel failed");
                        break;
                    }
                }
            }
            info!(url = %reader_url, "broadcast channel closed");
        });

        Ok(Self { url, tx, sink: Mutex::new(sink), reader })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }
}

impl InvalidationBus for WsBus {
    async fn publish(&self, signal: Signal) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(signal.to_frame())).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_signals() {
        assert_eq!(Signal::parse(r#"{"type":"room_list_update"}"#), Some(Signal::RoomListUpdate));
        assert_eq!(
            Signal::parse(r#"{"type":"notification_list_update"}"#),
            Some(Signal::NotificationListUpdate)
        );
        assert_eq!(Signal::parse(r#"{"type":"ban"}"#), Some(Signal::Ban));
    }

    #[test]
    fn parse_ignores_extra_fields() {
        assert_eq!(
            Signal::parse(r#"{"type":"room_list_update","room":"lobby"}"#),
            Some(Signal::RoomListUpdate)
        );
    }

    #[test]
    fn parse_unknown_or_malformed_is_none() {
        assert_eq!(Signal::parse(r#"{"type":"something_new"}"#), None);
        assert_eq!(Signal::parse(r#"{"kind":"ban"}"#), None);
        assert_eq!(Signal::parse("not json"), None);
        assert_eq!(Signal::parse(""), None);
    }

    #[test]
    fn frame_roundtrips_through_parse() {
        for s in [Signal::RoomListUpdate, Signal::NotificationListUpdate, Signal::Ban] {
            assert_eq!(Signal::parse(&s.to_frame()), Some(s));
        }
    }

    #[tokio::test]
    async fn local_bus_fans_out_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Signal::RoomListUpdate).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Signal::RoomListUpdate);
        assert_eq!(b.recv().await.unwrap(), Signal::RoomListUpdate);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn local_bus_publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        assert!(bus.publish(Signal::Ban).await.is_ok());
    }

    #[tokio::test]
    async fn inject_does_not_count_as_publish() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe();
        bus.inject(Signal::NotificationListUpdate);
        assert_eq!(rx.recv().await.unwrap(), Signal::NotificationListUpdate);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn subscription_reports_lag() {
        let bus = LocalBus::with_capacity(2);
        let mut sub = Subscription::new(bus.subscribe());
        for _ in 0..5 {
            bus.inject(Signal::RoomListUpdate);
        }
        assert!(matches!(sub.next().await, Some(Delivery::Lagged(_))));
        assert_eq!(sub.next().await, Some(Delivery::Signal(Signal::RoomListUpdate)));
    }

    #[tokio::test]
    async fn subscription_ends_when_bus_dropped() {
        let bus = LocalBus::new();
        let mut sub = Subscription::new(bus.subscribe());
        drop(bus);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn ws_bus_connect_failure_is_channel_error() {
        let err = WsBus::connect("ws://127.0.0.1:1/ws/room-list/", 8).await.err().unwrap();
        assert!(matches!(err, SyncError::Channel(_)));
    }
}
