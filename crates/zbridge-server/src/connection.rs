//! Per-connection send buffer and the registry of live connections.
//!
//! Each connection owns a bounded outbound queue drained by its own writer
//! task, so a slow receiver can never block delivery to other receivers.
//! An overloaded receiver is shed per [`OverflowPolicy`] rather than allowed
//! to grow memory without bound.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use zbridge_core::{AuthBindings, AuthContext, ConnectionId, Identity};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do with a connection whose send queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the overflowing message, keep the connection.
    Drop,
    /// Shed the whole connection. A reason frame is delivered best-effort
    /// before close.
    #[default]
    Disconnect,
}

/// A connected client.
pub struct Connection {
    pub id: ConnectionId,
    pub auth: AuthBindings,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    /// Set once close() is called; no new sends are accepted.
    closing: AtomicBool,
    /// Graceful close: drain the queue (bounded), then close the transport.
    drain: CancellationToken,
    /// Hard disconnect: deliver the stored reason best-effort, then close.
    kill: CancellationToken,
    close_reason: std::sync::Mutex<Option<String>>,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            auth: AuthBindings::default(),
            tx,
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            drain: CancellationToken::new(),
            kill: CancellationToken::new(),
            close_reason: std::sync::Mutex::new(None),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected clients. The single shared entry point for
/// sending, broadcasting, and identity binding.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Mutex<Connection>>>,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
    drain_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(
            DEFAULT_QUEUE_CAPACITY,
            OverflowPolicy::default(),
            DEFAULT_DRAIN_TIMEOUT,
        )
    }
}

impl ConnectionRegistry {
    pub fn new(
        queue_capacity: usize,
        overflow_policy: OverflowPolicy,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            queue_capacity,
            overflow_policy,
            drain_timeout,
        }
    }

    /// Register a new connection and return its ID + queue receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let conn = Arc::new(Mutex::new(Connection::new(id.clone(), tx)));
        self.connections.insert(id.clone(), conn);
        (id, rx)
    }

    /// Remove a connection by ID.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            if let Ok(c) = conn.try_lock() {
                c.connected.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Enqueue a message for one connection without blocking.
    ///
    /// Returns `false` when the message was not accepted: unknown or closing
    /// connection, or a full queue. A full queue logs a backpressure event
    /// and applies the configured [`OverflowPolicy`].
    pub async fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(conn) = self.connections.get(id).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let (tx, kill) = {
            let c = conn.lock().await;
            if c.closing.load(Ordering::Relaxed) || !c.is_connected() {
                return false;
            }
            (c.tx.clone(), c.kill.clone())
        };

        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    policy = ?self.overflow_policy,
                    "Send queue full, backpressure"
                );
                if self.overflow_policy == OverflowPolicy::Disconnect {
                    {
                        let c = conn.lock().await;
                        if let Ok(mut slot) = c.close_reason.lock() {
                            slot.get_or_insert(
                                serde_json::json!({
                                    "event": "disconnect",
                                    "reason": "backpressure_overflow",
                                })
                                .to_string(),
                            );
                        }
                        c.connected.store(false, Ordering::Relaxed);
                    }
                    kill.cancel();
                    self.connections.remove(id);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Forward a frame to every live connection other than the originator.
    /// Per-connection overflow is tolerated here; broadcast fan-out makes no
    /// cross-connection ordering promise.
    pub async fn broadcast_except(&self, origin: &ConnectionId, message: &str) {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| id != origin)
            .collect();
        for id in targets {
            self.send_to(&id, message.to_string()).await;
        }
    }

    /// Graceful close: stop accepting sends and ask the writer to drain the
    /// queue with the bounded timeout, then close the transport.
    pub async fn close(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id).map(|e| Arc::clone(e.value())) {
            let c = conn.lock().await;
            c.closing.store(true, Ordering::Relaxed);
            c.drain.cancel();
        }
        self.connections.remove(id);
    }

    /// Graceful close of every live connection, used at shutdown so queued
    /// messages get their bounded drain before the process exits.
    pub async fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub async fn bind_session_identity(&self, id: &ConnectionId, identity: Identity) {
        if let Some(conn) = self.connections.get(id) {
            conn.lock().await.auth.session = Some(identity);
        }
    }

    pub async fn bind_app_identity(&self, id: &ConnectionId, identity: Identity) {
        if let Some(conn) = self.connections.get(id) {
            conn.lock().await.auth.application = Some(identity);
        }
    }

    /// Drop all identity bindings; returns the context that was in effect.
    pub async fn clear_auth(&self, id: &ConnectionId) -> AuthContext {
        if let Some(conn) = self.connections.get(id) {
            let mut c = conn.lock().await;
            let previous = AuthContext::extract(&c.auth);
            c.auth = AuthBindings::default();
            previous
        } else {
            AuthContext::anonymous()
        }
    }

    /// Normalized identity for a connection; anonymous when unknown.
    pub async fn auth_context(&self, id: &ConnectionId) -> AuthContext {
        match self.connections.get(id) {
            Some(conn) => AuthContext::extract(&conn.lock().await.auth),
            None => AuthContext::anonymous(),
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Remove connections that haven't responded to pings within the
    /// timeout. Returns the IDs that were reaped so the caller can release
    /// whatever else those connections owned.
    pub fn cleanup_dead_connections(&self) -> Vec<ConnectionId> {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter_map(|entry| {
                if let Ok(c) = entry.value().try_lock() {
                    if !c.is_alive() {
                        return Some(c.id.clone());
                    }
                }
                None
            })
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "Cleaned up dead connection");
        }
        dead
    }

    async fn tokens_for(&self, id: &ConnectionId) -> Option<(CancellationToken, CancellationToken)> {
        let conn = self.connections.get(id).map(|e| Arc::clone(e.value()))?;
        let c = conn.lock().await;
        Some((c.drain.clone(), c.kill.clone()))
    }

    #[cfg(test)]
    pub(crate) fn expire_pong(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            if let Ok(c) = conn.try_lock() {
                c.last_pong.store(0, Ordering::Relaxed);
            }
        }
    }
}

/// Drive one WebSocket connection: writer task drains the send queue,
/// reader task forwards inbound frames to the router.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (drain_token, kill_token) = registry
        .tokens_for(&connection_id)
        .await
        .unwrap_or_else(|| (CancellationToken::new(), CancellationToken::new()));
    let drain_timeout = registry.drain_timeout();

    // Keep a handle on the connection entry so the kill-path reason survives
    // unregistration.
    let conn_entry = registry
        .connections
        .get(&connection_id)
        .map(|e| Arc::clone(e.value()));

    // Writer task: drain the queue to the transport one message at a time.
    let writer_cid = connection_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                // Transport write failure is fatal; no retries.
                                tracing::info!(connection_id = %writer_cid, "Transport write failed, tearing down");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = drain_token.cancelled() => {
                    drain_remaining(&mut rx, &mut ws_tx, drain_timeout, &writer_cid).await;
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = kill_token.cancelled() => {
                    // Best-effort reason frame, then close immediately.
                    let reason = conn_entry.as_ref().and_then(|c| {
                        c.try_lock()
                            .ok()
                            .and_then(|c| c.close_reason.lock().ok().and_then(|mut s| s.take()))
                    });
                    if let Some(reason) = reason {
                        let _ = ws_tx.send(WsMessage::Text(reason.into())).await;
                    }
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader task: forward text frames to the router, track pongs.
    let reader_cid = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(conn) = reader_registry.connections.get(&reader_cid) {
                        if let Ok(c) = conn.try_lock() {
                            c.record_pong();
                        }
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum replies automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&connection_id);
}

/// Best-effort drain of queued messages on graceful close. Messages still
/// queued when the timeout elapses are discarded with a warning.
async fn drain_remaining(
    rx: &mut mpsc::Receiver<String>,
    ws_tx: &mut (impl futures::Sink<WsMessage> + Unpin),
    drain_timeout: Duration,
    connection_id: &ConnectionId,
) {
    let deadline = tokio::time::Instant::now() + drain_timeout;
    let mut dropped = 0usize;

    while let Ok(text) = rx.try_recv() {
        if tokio::time::Instant::now() >= deadline {
            dropped += 1;
            continue;
        }
        match tokio::time::timeout_at(deadline, ws_tx.send(WsMessage::Text(text.into()))).await {
            Ok(Ok(())) => {}
            _ => dropped += 1,
        }
    }

    if dropped > 0 {
        tracing::warn!(
            connection_id = %connection_id,
            dropped = dropped,
            "Drain timeout elapsed, discarding queued messages"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_registry(capacity: usize, policy: OverflowPolicy) -> ConnectionRegistry {
        ConnectionRegistry::new(capacity, policy, DEFAULT_DRAIN_TIMEOUT)
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);

        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_to_delivers_in_fifo_order() {
        let registry = ConnectionRegistry::default();
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "first".into()).await);
        assert!(registry.send_to(&id, "second".into()).await);

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let registry = ConnectionRegistry::default();
        let ghost = ConnectionId::new();
        assert!(!registry.send_to(&ghost, "hello".into()).await);
    }

    #[tokio::test]
    async fn overflow_with_drop_policy_keeps_connection() {
        let registry = small_registry(2, OverflowPolicy::Drop);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "1".into()).await);
        assert!(registry.send_to(&id, "2".into()).await);
        // Queue full: the message is dropped but the connection survives.
        assert!(!registry.send_to(&id, "3".into()).await);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn overflow_with_disconnect_policy_sheds_connection() {
        let registry = small_registry(2, OverflowPolicy::Disconnect);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "1".into()).await);
        assert!(registry.send_to(&id, "2".into()).await);
        assert!(!registry.send_to(&id, "3".into()).await);
        // Shed, not left to grow without bound.
        assert_eq!(registry.count(), 0);
        assert!(!registry.send_to(&id, "4".into()).await);
    }

    #[tokio::test]
    async fn broadcast_skips_originator() {
        let registry = ConnectionRegistry::default();
        let (origin, mut origin_rx) = registry.register();
        let (_other, mut other_rx) = registry.register();

        registry.broadcast_except(&origin, "hello").await;

        assert_eq!(other_rx.try_recv().unwrap(), "hello");
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_stops_accepting_sends() {
        let registry = ConnectionRegistry::default();
        let (id, _rx) = registry.register();

        registry.close(&id).await;
        assert!(!registry.send_to(&id, "late".into()).await);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn auth_defaults_to_anonymous() {
        let registry = ConnectionRegistry::default();
        let (id, _rx) = registry.register();
        let ctx = registry.auth_context(&id).await;
        assert!(ctx.is_anonymous());
    }

    #[tokio::test]
    async fn bound_identity_is_extracted() {
        let registry = ConnectionRegistry::default();
        let (id, _rx) = registry.register();

        registry
            .bind_app_identity(
                &id,
                Identity {
                    user_id: "u1".into(),
                    app_name: "crm".into(),
                    role: "clerk".into(),
                },
            )
            .await;

        let ctx = registry.auth_context(&id).await;
        assert_eq!(ctx.user_id, "u1");
        assert!(!ctx.is_anonymous());
    }

    #[tokio::test]
    async fn clear_auth_returns_previous_context() {
        let registry = ConnectionRegistry::default();
        let (id, _rx) = registry.register();

        registry
            .bind_app_identity(
                &id,
                Identity {
                    user_id: "u1".into(),
                    app_name: "crm".into(),
                    role: "clerk".into(),
                },
            )
            .await;

        let previous = registry.clear_auth(&id).await;
        assert_eq!(previous.user_id, "u1");
        assert!(registry.auth_context(&id).await.is_anonymous());
    }

    #[test]
    fn cleanup_dead_connections_removes_expired() {
        let registry = ConnectionRegistry::default();
        let (id, _rx) = registry.register();
        let (_live, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.expire_pong(&id);

        assert_eq!(registry.cleanup_dead_connections(), vec![id]);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn close_all_closes_every_connection() {
        let registry = ConnectionRegistry::default();
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();

        registry.close_all().await;

        assert_eq!(registry.count(), 0);
        assert!(!registry.send_to(&a, "late".into()).await);
        assert!(!registry.send_to(&b, "late".into()).await);
    }

    #[tokio::test]
    async fn tokens_for_waits_out_lock_contention() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (id, _rx) = registry.register();

        let conn = registry
            .connections
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .unwrap();
        let guard = conn.lock().await;

        let task_registry = Arc::clone(&registry);
        let task_id = id.clone();
        let task = tokio::spawn(async move { task_registry.tokens_for(&task_id).await });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        drop(guard);
        let (drain, _kill) = task.await.unwrap().unwrap();

        // The real connection tokens, not disconnected fallbacks.
        registry.close(&id).await;
        assert!(drain.is_cancelled());
    }

    fn collecting_sink() -> (
        Arc<std::sync::Mutex<Vec<WsMessage>>>,
        std::pin::Pin<Box<impl futures::Sink<WsMessage, Error = std::convert::Infallible>>>,
    ) {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_sent = Arc::clone(&sent);
        let sink = Box::pin(futures::sink::unfold((), move |(), msg: WsMessage| {
            let sent = Arc::clone(&sink_sent);
            async move {
                sent.lock().unwrap().push(msg);
                Ok::<_, std::convert::Infallible>(())
            }
        }));
        (sent, sink)
    }

    #[tokio::test]
    async fn drain_remaining_flushes_queue_within_timeout() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.try_send(format!("m{i}")).unwrap();
        }

        let (sent, mut sink) = collecting_sink();
        drain_remaining(
            &mut rx,
            &mut sink,
            DEFAULT_DRAIN_TIMEOUT,
            &ConnectionId::new(),
        )
        .await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        match &sent[0] {
            WsMessage::Text(text) => assert_eq!(text.as_str(), "m0"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn drain_timeout_discards_remaining_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.try_send(format!("m{i}")).unwrap();
        }

        let (sent, mut sink) = collecting_sink();
        drain_remaining(&mut rx, &mut sink, Duration::ZERO, &ConnectionId::new()).await;

        // Deadline already elapsed: everything queued is discarded.
        assert!(sent.lock().unwrap().is_empty());
    }
}
