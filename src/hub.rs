//! Subscription Hub (J): channel-multiplexed fan-out over a WebSocket.
//!
//! One `tokio::sync::broadcast` channel per data topic is fed by a
//! background poller calling the aggregator on a fixed interval; each
//! connection subscribes to the topics it wants and forwards matching
//! messages into its own bounded outbound queue, the way this codebase's
//! `sse.rs` forwards an upstream byte stream into a bounded `mpsc` and
//! watches `capacity() == 0` for backpressure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use moka::future::Cache;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};

use crate::aggregator::Aggregator;

const OUTBOUND_QUEUE_CAPACITY: usize = 64;
const DROP_DISCONNECT_THRESHOLD: u32 = 32;
const DROP_WINDOW: Duration = Duration::from_secs(60);
const RECONNECT_WINDOW: Duration = Duration::from_secs(30);

pub const PUBLIC_CHANNELS: &[&str] = &["market_data", "sentiment", "news", "whales", "predictions"];
pub const PRIVATE_CHANNELS: &[&str] = &["portfolio", "alerts"];

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Result of an `AuthHook::authenticate` call.
pub struct AuthResult {
    pub client_id: String,
    pub groups: HashSet<String>,
}

/// Delegates to the (out-of-scope) authentication subsystem. The default
/// stub grants every connection a fresh anonymous id in the `public` group
/// only; a real deployment wires its own implementation.
pub trait AuthHook: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> AuthResult;
}

pub struct PermissiveAuthHook;

impl AuthHook for PermissiveAuthHook {
    fn authenticate(&self, _token: Option<&str>) -> AuthResult {
        let id: u64 = rand::thread_rng().gen();
        AuthResult {
            client_id: format!("anon-{:016x}", id),
            groups: HashSet::from(["public".to_string()]),
        }
    }
}

/// One broadcast payload: channel name, timestamp, and the canonical
/// payload serialized as JSON (so the hub never depends on the aggregator's
/// concrete return types beyond serialization).
#[derive(Debug, Clone)]
struct ChannelMessage {
    channel: String,
    t: i64,
    payload: serde_json::Value,
    /// When `Some`, only subscribers whose symbol filter intersects this set
    /// receive the message (market data symbols). `None` means unfiltered.
    symbols: Option<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlMessage {
    Subscribe { channel: String, symbols: Option<Vec<String>> },
    Unsubscribe { channel: String },
    Request { channel: String, query: Option<serde_json::Value> },
    Ping,
}

/// Untagged: data messages match the literal `{channel, t, payload}` shape
/// of §4.10; the control replies (`pong`/`session`/`error`) carry their own
/// `op` discriminant field instead of a shared envelope tag.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ServerMessage {
    Data { channel: String, t: i64, payload: serde_json::Value },
    Pong { op: &'static str, t: i64 },
    Session { op: &'static str, cookie: String, t: i64 },
    Error { op: &'static str, channel: Option<String>, message: String },
}

impl ServerMessage {
    fn pong(t: i64) -> Self {
        ServerMessage::Pong { op: "pong", t }
    }

    fn session(cookie: String, t: i64) -> Self {
        ServerMessage::Session { op: "session", cookie, t }
    }

    fn error(channel: Option<String>, message: String) -> Self {
        ServerMessage::Error { op: "error", channel, message }
    }
}

#[derive(Clone, Default)]
struct SavedSession {
    channels: Vec<(String, Option<HashSet<String>>)>,
}

pub struct Hub {
    senders: HashMap<&'static str, broadcast::Sender<ChannelMessage>>,
    auth: Arc<dyn AuthHook>,
    reconnect_sessions: Cache<String, SavedSession>,
    active_subscriptions: Arc<AtomicI64>,
}

impl Hub {
    pub fn new(aggregator: Arc<Aggregator>) -> Arc<Self> {
        Self::with_auth(aggregator, Arc::new(PermissiveAuthHook))
    }

    pub fn with_auth(aggregator: Arc<Aggregator>, auth: Arc<dyn AuthHook>) -> Arc<Self> {
        let mut senders = HashMap::new();
        for name in ["market_data", "sentiment", "news", "whales", "predictions"] {
            let (tx, _rx) = broadcast::channel(OUTBOUND_QUEUE_CAPACITY);
            senders.insert(name, tx);
        }

        let hub = Arc::new(Self {
            senders,
            auth,
            reconnect_sessions: Cache::builder()
                .time_to_live(RECONNECT_WINDOW)
                .max_capacity(10_000)
                .build(),
            active_subscriptions: Arc::new(AtomicI64::new(0)),
        });

        hub.spawn_pollers(aggregator);
        hub
    }

    fn spawn_pollers(self: &Arc<Self>, aggregator: Arc<Aggregator>) {
        self.spawn_poller("market_data", Duration::from_secs(30), {
            let aggregator = Arc::clone(&aggregator);
            move || {
                let aggregator = Arc::clone(&aggregator);
                async move {
                    let res = aggregator.get_market_listings(50, true).await?;
                    let symbols: HashSet<String> = res.data.iter().map(|p| p.symbol.clone()).collect();
                    Ok((serde_json::to_value(&res.data)?, Some(symbols)))
                }
            }
        });
        self.spawn_poller("sentiment", Duration::from_secs(120), {
            let aggregator = Arc::clone(&aggregator);
            move || {
                let aggregator = Arc::clone(&aggregator);
                async move {
                    let res = aggregator.get_fear_greed(true).await?;
                    Ok((serde_json::to_value(&res.data)?, None))
                }
            }
        });
        self.spawn_poller("news", Duration::from_secs(120), {
            let aggregator = Arc::clone(&aggregator);
            move || {
                let aggregator = Arc::clone(&aggregator);
                async move {
                    let res = aggregator.get_news(None, 20, true).await?;
                    Ok((serde_json::to_value(&res.data)?, None))
                }
            }
        });
        self.spawn_poller("whales", Duration::from_secs(60), {
            let aggregator = Arc::clone(&aggregator);
            move || {
                let aggregator = Arc::clone(&aggregator);
                async move {
                    let res = aggregator.get_whales(0.0, 50, true).await?;
                    Ok((serde_json::to_value(&res.data)?, None))
                }
            }
        });
        // `predictions` has no poller: the prediction engine lives outside
        // the core (§1). Clients may subscribe but will never receive data
        // until a deployer wires a real producer onto that broadcast sender.
    }

    fn spawn_poller<F, Fut>(self: &Arc<Self>, channel: &'static str, interval: Duration, mut producer: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(serde_json::Value, Option<HashSet<String>>), crate::error::GatewayError>> + Send,
    {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let poll = tokio::time::timeout(interval * 2, producer()).await;
                match poll {
                    Ok(Ok((payload, symbols))) => {
                        let msg = ChannelMessage { channel: channel.to_string(), t: now_ms(), payload, symbols };
                        if let Some(tx) = hub.senders.get(channel) {
                            let _ = tx.send(msg);
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(channel, error = %e, "poller fetch failed");
                    }
                    Err(_) => {
                        tracing::warn!(channel, "poller overran 2x its interval, aborted");
                    }
                }
            }
        });
    }

    pub fn active_subscriptions(&self) -> i64 {
        self.active_subscriptions.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub token: Option<String>,
    pub cookie: Option<String>,
}

pub async fn stream_handler(
    State(state): State<crate::AppState>,
    Query(params): Query<StreamParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = state.hub;
    ws.on_upgrade(move |socket| handle_connection(socket, hub, params))
}

/// A bounded outbound queue with eviction-on-push: once full, pushing a new
/// message drops the oldest buffered one rather than the new arrival, so a
/// slow consumer's queue always holds the most recent `capacity` messages
/// instead of the first ones it happened to receive.
#[derive(Clone)]
struct OutboundQueue {
    inner: Arc<OutboundQueueInner>,
}

struct OutboundQueueInner {
    capacity: usize,
    buffer: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(OutboundQueueInner {
                capacity,
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
            }),
        }
    }

    /// Pushes `msg`, evicting the oldest buffered message first if the queue
    /// is already at capacity. Returns `true` if an eviction occurred.
    fn push(&self, msg: ServerMessage) -> bool {
        let mut buffer = self.inner.buffer.lock();
        let evicted = if buffer.len() >= self.inner.capacity {
            buffer.pop_front();
            true
        } else {
            false
        };
        buffer.push_back(msg);
        drop(buffer);
        self.inner.notify.notify_one();
        evicted
    }

    async fn recv(&self) -> ServerMessage {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(msg) = self.inner.buffer.lock().pop_front() {
                return msg;
            }
            notified.await;
        }
    }
}

struct Connection {
    client_id: String,
    groups: HashSet<String>,
    subscriptions: Mutex<HashMap<String, Option<HashSet<String>>>>,
    drops: Mutex<Vec<std::time::Instant>>,
    drops_total: AtomicU64,
}

impl Connection {
    fn record_drops(&self, n: u32) -> bool {
        self.drops_total.fetch_add(n as u64, Ordering::Relaxed);
        let mut drops = self.drops.lock();
        let now = std::time::Instant::now();
        for _ in 0..n {
            drops.push(now);
        }
        drops.retain(|t| now.duration_since(*t) < DROP_WINDOW);
        drops.len() as u32 > DROP_DISCONNECT_THRESHOLD
    }

    fn is_allowed(&self, channel: &str) -> bool {
        if PUBLIC_CHANNELS.contains(&channel) {
            return true;
        }
        if PRIVATE_CHANNELS.contains(&channel) {
            return self.groups.contains("private");
        }
        false
    }
}

async fn handle_connection(mut socket: WebSocket, hub: Arc<Hub>, params: StreamParams) {
    let auth = hub.auth.authenticate(params.token.as_deref());
    tracing::info!(client_id = %auth.client_id, "stream handshake");

    let conn = Arc::new(Connection {
        client_id: auth.client_id.clone(),
        groups: auth.groups,
        subscriptions: Mutex::new(HashMap::new()),
        drops: Mutex::new(Vec::new()),
        drops_total: AtomicU64::new(0),
    });

    let out_tx = OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY);

    if let Some(cookie) = &params.cookie {
        if let Some(saved) = hub.reconnect_sessions.get(cookie).await {
            for (channel, symbols) in saved.channels {
                subscribe(&hub, &conn, &out_tx, channel, symbols).await;
            }
            tracing::info!(client_id = %conn.client_id, "restored subscriptions from reconnect cookie");
        }
    }

    crate::metrics::set_active_subscriptions(hub.active_subscriptions.fetch_add(1, Ordering::Relaxed) + 1);

    let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
    let reason = loop {
        tokio::select! {
            msg = out_tx.recv() => {
                let is_data = matches!(msg, ServerMessage::Data { .. });
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break "client_disconnected";
                }
                if is_data {
                    crate::metrics::record_fanout_message_sent();
                }
            }
            _ = ping_interval.tick() => {
                out_tx.push(ServerMessage::pong(now_ms()));
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(ControlMessage::Subscribe { channel, symbols }) => {
                                if !conn.is_allowed(&channel) {
                                    out_tx.push(ServerMessage::error(
                                        Some(channel.clone()),
                                        "channel requires authentication".to_string(),
                                    ));
                                    continue;
                                }
                                let symbols = symbols.map(|s| s.into_iter().map(|x| x.to_uppercase()).collect());
                                subscribe(&hub, &conn, &out_tx, channel, symbols).await;
                            }
                            Ok(ControlMessage::Unsubscribe { channel }) => {
                                conn.subscriptions.lock().remove(&channel);
                            }
                            Ok(ControlMessage::Request { channel, query: _ }) => {
                                if !conn.is_allowed(&channel) {
                                    out_tx.push(ServerMessage::error(
                                        Some(channel.clone()),
                                        "channel requires authentication".to_string(),
                                    ));
                                    continue;
                                }
                                // On-demand snapshot: handled by the caller re-subscribing;
                                // a focused pull-through is left to the HTTP API surface.
                                out_tx.push(ServerMessage::error(
                                    Some(channel),
                                    "use the HTTP API for on-demand snapshots".to_string(),
                                ));
                            }
                            Ok(ControlMessage::Ping) => {
                                out_tx.push(ServerMessage::pong(now_ms()));
                            }
                            Err(e) => {
                                out_tx.push(ServerMessage::error(None, e.to_string()));
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "client_closed",
                    Some(Err(_)) => break "socket_error",
                    _ => {}
                }
            }
        }
    };

    hub.active_subscriptions.fetch_sub(1, Ordering::Relaxed);
    crate::metrics::set_active_subscriptions(hub.active_subscriptions.load(Ordering::Relaxed));

    let saved = SavedSession { channels: conn.subscriptions.lock().clone().into_iter().collect() };
    let cookie: String = format!("{:032x}", rand::thread_rng().gen::<u128>());
    hub.reconnect_sessions.insert(cookie.clone(), saved).await;
    let _ = socket.send(Message::Text(
        serde_json::to_string(&ServerMessage::session(cookie, now_ms())).unwrap_or_default().into(),
    )).await;

    tracing::info!(client_id = %conn.client_id, reason, drops = conn.drops_total.load(Ordering::Relaxed), "stream closed");
}

/// Subscribes `conn` to `channel`, spawning a forwarding task that reads the
/// hub's broadcast receiver and pushes matching messages into `out_tx`.
async fn subscribe(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    out_tx: &OutboundQueue,
    channel: String,
    symbols_filter: Option<HashSet<String>>,
) {
    let Some(tx) = hub.senders.get(channel.as_str()) else {
        out_tx.push(ServerMessage::error(Some(channel), "unknown channel".to_string()));
        return;
    };
    conn.subscriptions.lock().insert(channel.clone(), symbols_filter.clone());

    let mut rx = tx.subscribe();
    let out_tx = out_tx.clone();
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if !conn.subscriptions.lock().contains_key(&msg.channel) {
                        break; // unsubscribed
                    }
                    if let (Some(filter), Some(msg_symbols)) = (&symbols_filter, &msg.symbols) {
                        if filter.is_disjoint(msg_symbols) {
                            continue;
                        }
                    }
                    let data = ServerMessage::Data { channel: msg.channel.clone(), t: msg.t, payload: msg.payload.clone() };
                    if out_tx.push(data) {
                        crate::metrics::record_stream_backpressure();
                        crate::metrics::record_queue_drop(&conn.client_id);
                        if conn.record_drops(1) {
                            tracing::info!(client_id = %conn.client_id, "slow_consumer: drop threshold exceeded");
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    for _ in 0..n {
                        crate::metrics::record_queue_drop(&conn.client_id);
                    }
                    if conn.record_drops(n as u32) {
                        tracing::info!(client_id = %conn.client_id, "slow_consumer: drop threshold exceeded");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_channels_are_allowed_without_groups() {
        let conn = Connection {
            client_id: "c1".into(),
            groups: HashSet::new(),
            subscriptions: Mutex::new(HashMap::new()),
            drops: Mutex::new(Vec::new()),
            drops_total: AtomicU64::new(0),
        };
        assert!(conn.is_allowed("market_data"));
        assert!(!conn.is_allowed("portfolio"));
    }

    #[test]
    fn private_channels_require_private_group() {
        let mut groups = HashSet::new();
        groups.insert("private".to_string());
        let conn = Connection {
            client_id: "c1".into(),
            groups,
            subscriptions: Mutex::new(HashMap::new()),
            drops: Mutex::new(Vec::new()),
            drops_total: AtomicU64::new(0),
        };
        assert!(conn.is_allowed("portfolio"));
    }

    #[test]
    fn drop_threshold_trips_slow_consumer() {
        let conn = Connection {
            client_id: "c1".into(),
            groups: HashSet::new(),
            subscriptions: Mutex::new(HashMap::new()),
            drops: Mutex::new(Vec::new()),
            drops_total: AtomicU64::new(0),
        };
        assert!(!conn.record_drops(30));
        assert!(conn.record_drops(3));
    }

    #[test]
    fn outbound_queue_evicts_the_oldest_message_on_overflow() {
        let q = OutboundQueue::new(2);
        assert!(!q.push(ServerMessage::pong(1)));
        assert!(!q.push(ServerMessage::pong(2)));
        // Third push overflows capacity 2: the oldest (t=1) must be evicted,
        // not the new arrival.
        assert!(q.push(ServerMessage::pong(3)));

        let mut buffer = q.inner.buffer.lock();
        let remaining: Vec<i64> = buffer
            .drain(..)
            .map(|m| match m {
                ServerMessage::Pong { t, .. } => t,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(remaining, vec![2, 3], "the surviving messages must be the newest ones, oldest-first");
    }

    /// A client that never drains its outbound queue while 200 messages are
    /// fanned out: the bounded buffer (capacity 64) fills and starts
    /// evicting its oldest entry on every further push, and the forwarding
    /// task disconnects itself once cumulative evictions pass
    /// `DROP_DISCONNECT_THRESHOLD` rather than running to the end of the 200.
    #[tokio::test]
    async fn fanout_backpressure_evicts_oldest_messages_and_disconnects_a_slow_consumer() {
        let (tx, _rx) = broadcast::channel::<ChannelMessage>(256);
        let mut senders = HashMap::new();
        senders.insert("market_data", tx.clone());
        let hub = Arc::new(Hub {
            senders,
            auth: Arc::new(PermissiveAuthHook),
            reconnect_sessions: Cache::builder().time_to_live(RECONNECT_WINDOW).max_capacity(10).build(),
            active_subscriptions: Arc::new(AtomicI64::new(0)),
        });

        let conn = Arc::new(Connection {
            client_id: "slow-consumer".into(),
            groups: HashSet::new(),
            subscriptions: Mutex::new(HashMap::new()),
            drops: Mutex::new(Vec::new()),
            drops_total: AtomicU64::new(0),
        });

        let out_tx = OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY);
        subscribe(&hub, &conn, &out_tx, "market_data".to_string(), None).await;

        for i in 0..200i64 {
            tx.send(ChannelMessage {
                channel: "market_data".to_string(),
                t: i,
                payload: serde_json::json!({ "i": i }),
                symbols: None,
            })
            .ok();
        }

        // Give the forwarding task a chance to drain the broadcast channel
        // and hit its disconnect threshold before we inspect state.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The forwarding task disconnects itself the moment cumulative
        // evictions exceed DROP_DISCONNECT_THRESHOLD (32), so it never
        // processes all 200 messages: drops_total settles at threshold+1.
        assert_eq!(conn.drops_total.load(Ordering::Relaxed), (DROP_DISCONNECT_THRESHOLD + 1) as u64);

        // Whatever survives in the buffer is a contiguous run of the most
        // recently sent messages, capped at the queue capacity: eviction
        // always removes the oldest, never the newest.
        let remaining: Vec<i64> = out_tx
            .inner
            .buffer
            .lock()
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Data { t, .. } => Some(*t),
                _ => None,
            })
            .collect();
        assert!(remaining.len() <= OUTBOUND_QUEUE_CAPACITY);
        for pair in remaining.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "surviving messages must be contiguous, oldest evicted first");
        }
    }
}
