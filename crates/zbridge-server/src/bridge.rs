//! Pause/resume bridge between step sequences and the transport.
//!
//! A step sequence is written to run straight through, but a gate step may
//! need to wait arbitrarily long for external input. The bridge consumes
//! chunks one at a time, pushes each as a `render_chunk` frame, and parks
//! the sequence in a keyed store when it hits a gate. A later `form_submit`
//! picks the parked sequence back up from exactly where it stopped. No task
//! blocks while a sequence is suspended.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use zbridge_core::envelope::{echo, ok_reply};
use zbridge_core::{ConnectionId, Correlation, StepSequence, WalkerRunId, WalkerSource};

use crate::connection::ConnectionRegistry;

/// Terminal report of one pump pass over a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkerOutcome {
    /// Sequence exhausted; continuation discarded.
    Completed,
    /// Sequence parked at a gate awaiting external input.
    Paused,
    /// Shutdown observed or delivery failed; continuation discarded.
    Aborted,
    /// Resume with nothing suspended. Not an error.
    NoOp,
}

/// Everything needed to keep producing after a gate: the sequence handle,
/// its declarative source, the breadcrumb path walked so far, the original
/// correlation token, and the next chunk counter.
struct SuspendedWalker {
    run_id: WalkerRunId,
    sequence: Box<dyn StepSequence>,
    source: WalkerSource,
    breadcrumb: Vec<String>,
    request_id: Option<Correlation>,
    next_chunk: u64,
    bounce_pending: bool,
}

/// Keyed store of suspended continuations, at most one per connection.
///
/// Starts and resumes for the same connection are serialized through a
/// per-connection pump lock, so two frames racing in cannot interleave
/// their `render_chunk` streams or run two sequences at once.
pub struct ExecutionBridge {
    suspended: DashMap<ConnectionId, SuspendedWalker>,
    pump_locks: DashMap<ConnectionId, Arc<tokio::sync::Mutex<()>>>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl ExecutionBridge {
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            suspended: DashMap::new(),
            pump_locks: DashMap::new(),
            registry,
            shutdown,
        }
    }

    fn pump_lock(&self, connection_id: &ConnectionId) -> Arc<tokio::sync::Mutex<()>> {
        self.pump_locks
            .entry(connection_id.clone())
            .or_default()
            .clone()
    }

    /// Start a fresh sequence for a connection. Any continuation already
    /// suspended there is abandoned, not merged.
    pub async fn start(
        &self,
        connection_id: &ConnectionId,
        sequence: Box<dyn StepSequence>,
        source: WalkerSource,
        request_id: Option<Correlation>,
    ) -> WalkerOutcome {
        let lock = self.pump_lock(connection_id);
        let _pumping = lock.lock().await;

        if self.suspended.remove(connection_id).is_some() {
            tracing::debug!(connection_id = %connection_id, "Replacing suspended walker");
        }
        let run_id = WalkerRunId::new();
        tracing::debug!(connection_id = %connection_id, run_id = %run_id, source = ?source, "Walker starting");
        let walker = SuspendedWalker {
            run_id,
            sequence,
            source,
            breadcrumb: Vec::new(),
            request_id,
            next_chunk: 0,
            bounce_pending: false,
        };
        self.pump(connection_id, walker).await
    }

    /// Resume the connection's suspended continuation, if any. Absent
    /// continuation is a no-op.
    pub async fn resume(&self, connection_id: &ConnectionId) -> WalkerOutcome {
        let lock = self.pump_lock(connection_id);
        let _pumping = lock.lock().await;

        match self.suspended.remove(connection_id) {
            Some((_, walker)) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    run_id = %walker.run_id,
                    source = ?walker.source,
                    position = walker.breadcrumb.last().map(String::as_str).unwrap_or(""),
                    "Resuming suspended walker"
                );
                self.pump(connection_id, walker).await
            }
            None => WalkerOutcome::NoOp,
        }
    }

    /// Drop the connection's continuation without running it. Called on
    /// connection close so abandoned sequences cannot leak.
    pub fn discard(&self, connection_id: &ConnectionId) -> bool {
        self.pump_locks.remove(connection_id);
        self.suspended.remove(connection_id).is_some()
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    /// Pull chunks until the sequence gates, exhausts, aborts, or delivery
    /// fails. The walker lives on the stack while running; it only returns
    /// to the store when parked at a gate.
    async fn pump(
        &self,
        connection_id: &ConnectionId,
        mut walker: SuspendedWalker,
    ) -> WalkerOutcome {
        loop {
            if self.shutdown.is_cancelled() {
                let frame = ok_reply(Value::from("aborted"), walker.request_id.as_ref());
                self.registry
                    .send_to(connection_id, frame.to_string())
                    .await;
                tracing::info!(connection_id = %connection_id, "Walker aborted by shutdown");
                return WalkerOutcome::Aborted;
            }

            let Some(chunk) = walker.sequence.next() else {
                let frame = ok_reply(Value::from("completed"), walker.request_id.as_ref());
                let delivered = self
                    .registry
                    .send_to(connection_id, frame.to_string())
                    .await;
                if delivered && walker.bounce_pending {
                    let nav = serde_json::json!({ "event": "navigate_back" });
                    self.registry.send_to(connection_id, nav.to_string()).await;
                }
                return WalkerOutcome::Completed;
            };

            let chunk_num = walker.next_chunk;
            walker.next_chunk += 1;
            if let Some(key) = chunk.last_key() {
                walker.breadcrumb.push(key.to_string());
            }
            walker.bounce_pending = chunk.bounces_back();

            let mut frame = serde_json::json!({
                "event": "render_chunk",
                "chunk_num": chunk_num,
                "keys": chunk.keys,
                "data": chunk.data,
                "is_gate": chunk.is_gate,
            });
            if let Some(gate_value) = &chunk.gate_value {
                frame["gate"] = gate_value.clone();
            }
            let frame = echo(frame, walker.request_id.as_ref());

            if !self
                .registry
                .send_to(connection_id, frame.to_string())
                .await
            {
                tracing::warn!(connection_id = %connection_id, "Chunk delivery failed, dropping walker");
                return WalkerOutcome::Aborted;
            }

            if chunk.is_gate {
                self.suspended.insert(connection_id.clone(), walker);
                return WalkerOutcome::Paused;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use zbridge_core::{Chunk, ScriptedSequence};

    fn source() -> WalkerSource {
        WalkerSource {
            file: "orders".into(),
            folder: "sales".into(),
            block: "main".into(),
        }
    }

    fn corr() -> Option<Correlation> {
        Some(Correlation {
            key: "_requestId".into(),
            value: serde_json::json!(5),
        })
    }

    fn setup() -> (Arc<ConnectionRegistry>, ExecutionBridge, CancellationToken) {
        let registry = Arc::new(ConnectionRegistry::default());
        let shutdown = CancellationToken::new();
        let bridge = ExecutionBridge::new(Arc::clone(&registry), shutdown.clone());
        (registry, bridge, shutdown)
    }

    fn three_steps_gate_in_middle() -> Box<dyn StepSequence> {
        Box::new(ScriptedSequence::new(vec![
            Chunk::step(vec!["header".into()], serde_json::json!({"n": 1})),
            Chunk::gate(
                vec!["confirm".into()],
                serde_json::json!({"n": 2}),
                Some(serde_json::json!({"form": "f1"})),
            ),
            Chunk::step(vec!["footer".into()], serde_json::json!({"n": 3})),
        ]))
    }

    fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn straight_run_completes() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        let seq = Box::new(ScriptedSequence::new(vec![
            Chunk::step(vec!["a".into()], serde_json::json!({})),
            Chunk::step(vec!["b".into()], serde_json::json!({})),
        ]));
        let outcome = bridge.start(&id, seq, source(), corr()).await;
        assert_eq!(outcome, WalkerOutcome::Completed);
        assert_eq!(bridge.suspended_count(), 0);

        let first = recv_json(&mut rx);
        assert_eq!(first["event"], "render_chunk");
        assert_eq!(first["chunk_num"], 0);
        assert_eq!(first["is_gate"], false);
        assert_eq!(first["_requestId"], 5);

        let second = recv_json(&mut rx);
        assert_eq!(second["chunk_num"], 1);

        let done = recv_json(&mut rx);
        assert_eq!(done["result"], "completed");
        assert_eq!(done["_requestId"], 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn gate_pauses_then_resume_finishes() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        let outcome = bridge
            .start(&id, three_steps_gate_in_middle(), source(), corr())
            .await;
        assert_eq!(outcome, WalkerOutcome::Paused);
        assert_eq!(bridge.suspended_count(), 1);

        let first = recv_json(&mut rx);
        assert_eq!(first["keys"][0], "header");
        assert_eq!(first["is_gate"], false);

        let gate = recv_json(&mut rx);
        assert_eq!(gate["keys"][0], "confirm");
        assert_eq!(gate["is_gate"], true);
        assert_eq!(gate["gate"]["form"], "f1");
        assert!(rx.try_recv().is_err());

        let outcome = bridge.resume(&id).await;
        assert_eq!(outcome, WalkerOutcome::Completed);
        assert_eq!(bridge.suspended_count(), 0);

        // Chunk counter continues from where the gate left off.
        let third = recv_json(&mut rx);
        assert_eq!(third["keys"][0], "footer");
        assert_eq!(third["chunk_num"], 2);
        assert_eq!(third["_requestId"], 5);

        let done = recv_json(&mut rx);
        assert_eq!(done["result"], "completed");
    }

    #[tokio::test]
    async fn resume_without_suspension_is_noop() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        assert_eq!(bridge.resume(&id).await, WalkerOutcome::NoOp);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_resume_is_noop() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        bridge
            .start(&id, three_steps_gate_in_middle(), source(), corr())
            .await;
        assert_eq!(bridge.resume(&id).await, WalkerOutcome::Completed);
        while rx.try_recv().is_ok() {}

        assert_eq!(bridge.resume(&id).await, WalkerOutcome::NoOp);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn consecutive_gates_pause_twice() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        let seq = Box::new(ScriptedSequence::new(vec![
            Chunk::gate(vec!["g1".into()], serde_json::json!({}), None),
            Chunk::gate(vec!["g2".into()], serde_json::json!({}), None),
        ]));
        assert_eq!(
            bridge.start(&id, seq, source(), None).await,
            WalkerOutcome::Paused
        );
        assert_eq!(bridge.resume(&id).await, WalkerOutcome::Paused);
        assert_eq!(bridge.resume(&id).await, WalkerOutcome::Completed);

        let g1 = recv_json(&mut rx);
        assert_eq!(g1["keys"][0], "g1");
        let g2 = recv_json(&mut rx);
        assert_eq!(g2["keys"][0], "g2");
        assert_eq!(g2["chunk_num"], 1);
    }

    #[tokio::test]
    async fn new_start_replaces_suspended_walker() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        bridge
            .start(&id, three_steps_gate_in_middle(), source(), corr())
            .await;
        while rx.try_recv().is_ok() {}

        let replacement = Box::new(ScriptedSequence::new(vec![Chunk::step(
            vec!["fresh".into()],
            serde_json::json!({}),
        )]));
        let outcome = bridge.start(&id, replacement, source(), None).await;
        assert_eq!(outcome, WalkerOutcome::Completed);
        assert_eq!(bridge.suspended_count(), 0);

        let first = recv_json(&mut rx);
        assert_eq!(first["keys"][0], "fresh");
        assert_eq!(first["chunk_num"], 0);

        // The abandoned walker is gone, not resumable.
        while rx.try_recv().is_ok() {}
        assert_eq!(bridge.resume(&id).await, WalkerOutcome::NoOp);
    }

    #[tokio::test]
    async fn bounce_back_marker_emits_navigate_back() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        let seq = Box::new(ScriptedSequence::new(vec![Chunk::step(
            vec!["summary^".into()],
            serde_json::json!({}),
        )]));
        bridge.start(&id, seq, source(), corr()).await;

        let _chunk = recv_json(&mut rx);
        let done = recv_json(&mut rx);
        assert_eq!(done["result"], "completed");

        let nav = recv_json(&mut rx);
        assert_eq!(nav["event"], "navigate_back");
        // Spontaneous frame, no correlation token.
        assert!(nav.get("_requestId").is_none());
    }

    #[tokio::test]
    async fn no_bounce_back_without_marker() {
        let (registry, bridge, _) = setup();
        let (id, mut rx) = registry.register();

        let seq = Box::new(ScriptedSequence::new(vec![Chunk::step(
            vec!["summary".into()],
            serde_json::json!({}),
        )]));
        bridge.start(&id, seq, source(), None).await;

        let _chunk = recv_json(&mut rx);
        let done = recv_json(&mut rx);
        assert_eq!(done["result"], "completed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_aborts_before_next_chunk() {
        let (registry, bridge, shutdown) = setup();
        let (id, mut rx) = registry.register();

        shutdown.cancel();
        let outcome = bridge
            .start(&id, three_steps_gate_in_middle(), source(), corr())
            .await;
        assert_eq!(outcome, WalkerOutcome::Aborted);

        let frame = recv_json(&mut rx);
        assert_eq!(frame["result"], "aborted");
        assert_eq!(frame["_requestId"], 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_failure_drops_walker() {
        let (registry, bridge, _) = setup();
        let (id, _rx) = registry.register();
        registry.unregister(&id);

        let outcome = bridge
            .start(&id, three_steps_gate_in_middle(), source(), corr())
            .await;
        assert_eq!(outcome, WalkerOutcome::Aborted);
        assert_eq!(bridge.suspended_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_starts_never_interleave_chunks() {
        let (registry, bridge, _) = setup();
        let bridge = Arc::new(bridge);
        let (id, mut rx) = registry.register();

        let first = Box::new(ScriptedSequence::new(vec![
            Chunk::step(vec!["first-a".into()], serde_json::json!({})),
            Chunk::step(vec!["first-b".into()], serde_json::json!({})),
        ]));
        let second = Box::new(ScriptedSequence::new(vec![
            Chunk::step(vec!["second-a".into()], serde_json::json!({})),
            Chunk::step(vec!["second-b".into()], serde_json::json!({})),
        ]));

        let b1 = Arc::clone(&bridge);
        let id1 = id.clone();
        let t1 = tokio::spawn(async move { b1.start(&id1, first, source(), None).await });
        let b2 = Arc::clone(&bridge);
        let id2 = id.clone();
        let t2 = tokio::spawn(async move { b2.start(&id2, second, source(), None).await });
        t1.await.unwrap();
        t2.await.unwrap();

        let mut prefixes = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            if frame["event"] == "render_chunk" {
                let key = frame["keys"][0].as_str().unwrap();
                prefixes.push(key.split('-').next().unwrap().to_string());
            }
        }
        assert_eq!(prefixes.len(), 4);
        // One sequence runs to completion before the other begins.
        assert!(
            prefixes == ["first", "first", "second", "second"]
                || prefixes == ["second", "second", "first", "first"],
            "interleaved chunk streams: {prefixes:?}"
        );
        assert_eq!(bridge.suspended_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_start_replaces_gated_walker() {
        let (registry, bridge, _) = setup();
        let bridge = Arc::new(bridge);
        let (id, mut rx) = registry.register();

        let gated = Box::new(ScriptedSequence::new(vec![
            Chunk::gate(vec!["confirm".into()], serde_json::json!({}), None),
            Chunk::step(vec!["after-gate".into()], serde_json::json!({})),
        ]));
        let replacement = Box::new(ScriptedSequence::new(vec![Chunk::step(
            vec!["fresh".into()],
            serde_json::json!({}),
        )]));

        let b1 = Arc::clone(&bridge);
        let id1 = id.clone();
        let t1 = tokio::spawn(async move { b1.start(&id1, gated, source(), None).await });
        let b2 = Arc::clone(&bridge);
        let id2 = id.clone();
        let t2 = tokio::spawn(async move { b2.start(&id2, replacement, source(), None).await });
        t1.await.unwrap();
        t2.await.unwrap();

        // Whichever start ran second owns the connection slot: at most one
        // continuation survives, and the gated walker never both gates and
        // coexists with the replacement.
        assert!(bridge.suspended_count() <= 1);
        bridge.resume(&id).await;
        assert_eq!(bridge.suspended_count(), 0);
        assert_eq!(bridge.resume(&id).await, WalkerOutcome::NoOp);

        let mut keys = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            if frame["event"] == "render_chunk" {
                keys.push(frame["keys"][0].as_str().unwrap().to_string());
            }
        }
        assert!(keys.contains(&"fresh".to_string()));
    }

    #[tokio::test]
    async fn discard_removes_suspension() {
        let (registry, bridge, _) = setup();
        let (id, _rx) = registry.register();

        bridge
            .start(&id, three_steps_gate_in_middle(), source(), corr())
            .await;
        assert_eq!(bridge.suspended_count(), 1);
        assert!(bridge.discard(&id));
        assert!(!bridge.discard(&id));
        assert_eq!(bridge.resume(&id).await, WalkerOutcome::NoOp);
    }
}
