//! One live WebSocket to the upstream Realtime API.
//!
//! The session hands its socket to a spawned driver task and communicates
//! with it through a bounded send queue and an inbound channel. The driver
//! owns heartbeats and the reconnect ladder; callers only ever see
//! `send`/`recv`/`close` and the health flag.
//!
//! States: Connecting → Healthy ↔ Unhealthy → Closed. While Unhealthy the
//! send queue keeps accepting (and retaining) events; they are replayed in
//! order after a successful reconnect. Transitions to Closed release any
//! still-queued events; they are never delivered after close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{handshake::client::Request, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use crate::errors::RelayError;
use crate::models::event;
use crate::models::session_config::SessionFingerprint;
use crate::proxy::minter::EphemeralCredential;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const MAX_BACKOFF_SECS: u64 = 30;
pub const SEND_QUEUE_CAPACITY: usize = 256;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionHealth {
    Connecting,
    Healthy,
    Unhealthy,
    Closed,
}

/// Why a session reached the terminal Closed state. The router picks the
/// client-facing close code off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Upstream performed a clean WebSocket close.
    Clean,
    /// The reconnect ladder ran out of attempts.
    Exhausted,
    /// `close()` was called on this side.
    Local,
}

// ── Send queue ────────────────────────────────────────────────

#[derive(Debug)]
struct SendQueue {
    events: VecDeque<Value>,
    closed: bool,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            closed: false,
        }
    }

    /// Push an event, evicting under pressure. Returns the evicted event.
    ///
    /// Eviction prefers the oldest pending audio append so control events
    /// survive; only a queue with no audio left drops its oldest event.
    fn push(&mut self, event_value: Value, capacity: usize) -> Option<Value> {
        self.events.push_back(event_value);
        if self.events.len() <= capacity {
            return None;
        }
        if let Some(pos) = self
            .events
            .iter()
            .position(|e| event::event_type(e) == Some("input_audio_buffer.append"))
        {
            return self.events.remove(pos);
        }
        self.events.pop_front()
    }
}

// ── Shared state between handle and driver ────────────────────

struct Shared {
    id: Uuid,
    health: Mutex<SessionHealth>,
    queue: Mutex<SendQueue>,
    queue_notify: Notify,
    close_notify: Notify,
    dropped: AtomicU64,
    reconnect_attempts: AtomicU32,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Shared {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            health: Mutex::new(SessionHealth::Connecting),
            queue: Mutex::new(SendQueue::new()),
            queue_notify: Notify::new(),
            close_notify: Notify::new(),
            dropped: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            close_reason: Mutex::new(None),
        }
    }

    fn set_health(&self, next: SessionHealth) {
        let mut health = self.health.lock().unwrap();
        if *health == next {
            return;
        }
        tracing::info!(
            session_id = %self.id,
            from = ?*health,
            to = ?next,
            "upstream session state"
        );
        *health = next;
    }

    fn is_closing(&self) -> bool {
        self.queue.lock().unwrap().closed
    }

    /// Terminal transition: record the reason, release queued events.
    fn finish(&self, reason: CloseReason) {
        *self.close_reason.lock().unwrap() = Some(reason);
        let released = {
            let mut queue = self.queue.lock().unwrap();
            queue.closed = true;
            let n = queue.events.len();
            queue.events.clear();
            n
        };
        if released > 0 {
            tracing::info!(session_id = %self.id, released, "released queued events on close");
        }
        self.set_health(SessionHealth::Closed);
    }
}

// ── Session handle ────────────────────────────────────────────

pub struct UpstreamSession {
    shared: Arc<Shared>,
    fingerprint: SessionFingerprint,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Value>>,
}

impl UpstreamSession {
    /// Dial the upstream WebSocket and start the driver task. Returns once
    /// the opening handshake has completed.
    pub async fn open(
        ws_url: &str,
        credential: EphemeralCredential,
        fingerprint: SessionFingerprint,
    ) -> Result<Arc<Self>, RelayError> {
        let id = Uuid::new_v4();
        let shared = Arc::new(Shared::new(id));

        let ws = dial(ws_url, credential.secret()).await?;
        tracing::info!(session_id = %id, url = %ws_url, "upstream connected");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        tokio::spawn(drive(
            ws,
            shared.clone(),
            inbound_tx,
            ws_url.to_string(),
            credential,
        ));

        Ok(Arc::new(Self {
            shared,
            fingerprint,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn fingerprint(&self) -> &SessionFingerprint {
        &self.fingerprint
    }

    /// Enqueue an outbound event. Non-blocking: while the session is
    /// reconnecting the event is retained for replay; a full queue evicts
    /// per the drop-oldest policy and bumps the drop counter.
    pub fn send(&self, event_value: Value) -> Result<(), RelayError> {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.closed {
                return Err(RelayError::SessionClosed);
            }
            if let Some(evicted) = queue.push(event_value, SEND_QUEUE_CAPACITY) {
                let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = %self.shared.id,
                    evicted_type = event::event_type(&evicted).unwrap_or("?"),
                    total_dropped = total,
                    "send queue full, evicted oldest pending event"
                );
            }
        }
        self.shared.queue_notify.notify_one();
        Ok(())
    }

    /// Next upstream event, in upstream order. `None` once the session has
    /// reached Closed and the channel drained.
    pub async fn recv(&self) -> Option<Value> {
        self.inbound.lock().await.recv().await
    }

    /// Initiate a clean close. Idempotent.
    pub fn close(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.closed {
                return;
            }
            queue.closed = true;
        }
        self.shared.close_notify.notify_one();
        self.shared.queue_notify.notify_one();
    }

    pub fn health(&self) -> SessionHealth {
        *self.shared.health.lock().unwrap()
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == SessionHealth::Healthy
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shared.close_reason.lock().unwrap()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().unwrap().events.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }
}

// ── Socket plumbing ───────────────────────────────────────────

async fn dial(url: &str, secret: &str) -> Result<WsStream, RelayError> {
    let request = Request::builder()
        .uri(url)
        .header("Authorization", format!("Bearer {}", secret))
        .header("OpenAI-Beta", "realtime=v1")
        .header("User-Agent", "realtime-relay/0.1")
        .body(())
        .map_err(|e| RelayError::UpstreamFailed(format!("bad upstream request: {}", e)))?;

    let (ws, _resp) = connect_async_tls_with_config(request, None, false, None)
        .await
        .map_err(|e| RelayError::UpstreamFailed(format!("upstream dial failed: {}", e)))?;
    Ok(ws)
}

/// Drain the send queue onto the socket, preserving order. Returns false on
/// a send failure; the unsent event is put back at the front for replay.
async fn flush_queue(ws: &mut WsStream, shared: &Shared) -> bool {
    loop {
        let next = { shared.queue.lock().unwrap().events.pop_front() };
        let Some(event_value) = next else {
            return true;
        };
        let text = event_value.to_string();
        if let Err(e) = ws.send(Message::Text(text)).await {
            tracing::warn!(session_id = %shared.id, "upstream send failed, retaining event: {}", e);
            shared.queue.lock().unwrap().events.push_front(event_value);
            return false;
        }
    }
}

/// The driver task. Owns the socket for the session's whole life, including
/// across reconnects. Never panics; every failure becomes a health
/// transition, so a dying driver takes down only its own session.
async fn drive(
    mut ws: WsStream,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<Value>,
    url: String,
    credential: EphemeralCredential,
) {
    let reason = 'session: loop {
        shared.set_health(SessionHealth::Healthy);

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut pong_deadline: Option<Instant> = None;

        // Replay whatever queued up while we were away.
        if shared.is_closing() {
            let _ = ws.send(Message::Close(None)).await;
            break 'session CloseReason::Local;
        }
        if !flush_queue(&mut ws, &shared).await {
            shared.set_health(SessionHealth::Unhealthy);
        } else {
            loop {
                tokio::select! {
                    _ = shared.queue_notify.notified() => {
                        if shared.is_closing() {
                            let _ = ws.send(Message::Close(None)).await;
                            break 'session CloseReason::Local;
                        }
                        if !flush_queue(&mut ws, &shared).await {
                            shared.set_health(SessionHealth::Unhealthy);
                            break;
                        }
                    }
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Value>(&text) {
                                Ok(event_value) => {
                                    tokio::select! {
                                        sent = inbound.send(event_value) => {
                                            if sent.is_err() {
                                                // Receiver gone; nobody will read again.
                                                let _ = ws.send(Message::Close(None)).await;
                                                break 'session CloseReason::Local;
                                            }
                                        }
                                        _ = shared.close_notify.notified() => {
                                            let _ = ws.send(Message::Close(None)).await;
                                            break 'session CloseReason::Local;
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(session_id = %shared.id, "upstream sent invalid JSON: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pong_deadline = None;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break 'session CloseReason::Clean;
                        }
                        Some(Ok(_)) => {} // binary frames are not part of the protocol
                        Some(Err(e)) => {
                            tracing::warn!(session_id = %shared.id, "upstream socket error: {}", e);
                            shared.set_health(SessionHealth::Unhealthy);
                            break;
                        }
                    },
                    _ = heartbeat.tick() => {
                        if ws.send(Message::Ping(Vec::new())).await.is_err() {
                            shared.set_health(SessionHealth::Unhealthy);
                            break;
                        }
                        if pong_deadline.is_none() {
                            pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                        }
                    }
                    _ = async move { tokio::time::sleep_until(pong_deadline.unwrap()).await },
                            if pong_deadline.is_some() => {
                        tracing::warn!(session_id = %shared.id, "heartbeat pong timed out");
                        shared.set_health(SessionHealth::Unhealthy);
                        break;
                    }
                }
            }
        }

        // Unhealthy: walk the reconnect ladder.
        match reconnect(&url, &credential, &shared).await {
            Some(new_ws) => {
                ws = new_ws;
                continue 'session;
            }
            None => {
                if shared.is_closing() {
                    break 'session CloseReason::Local;
                }
                break 'session CloseReason::Exhausted;
            }
        }
    };

    shared.finish(reason);
    // inbound sender drops here; recv() observes Closed after draining.
}

async fn reconnect(
    url: &str,
    credential: &EphemeralCredential,
    shared: &Shared,
) -> Option<WsStream> {
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        let backoff = Duration::from_secs((1u64 << attempt).min(MAX_BACKOFF_SECS));
        tokio::time::sleep(backoff).await;
        if shared.is_closing() {
            return None;
        }
        shared
            .reconnect_attempts
            .store(attempt + 1, Ordering::Relaxed);
        match dial(url, credential.secret()).await {
            Ok(ws) => {
                tracing::info!(
                    session_id = %shared.id,
                    attempt = attempt + 1,
                    "upstream reconnected"
                );
                return Some(ws);
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %shared.id,
                    attempt = attempt + 1,
                    "reconnect attempt failed: {}",
                    e
                );
            }
        }
    }
    None
}
