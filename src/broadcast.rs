//! Broadcast transport: batches coalesced changes and bounds their
//! propagation latency.
//!
//! State machine per client session:
//!
//! ```text
//!            queue()                 idle timer (50ms quiet)
//!  ┌──────┐ ────────► ┌────────┐ ──────────────────────► ┌──────────┐
//!  │ Idle │           │ Queued │   max-latency (500ms)    │ Flushing │
//!  └──────┘ ◄──────── └────────┘ ──────────────────────► └──────────┘
//!              sent         ▲ queue() re-arms idle only
//! ```
//!
//! The idle timer is re-armed on every `queue`; the max-latency timer is
//! armed once per burst, so a continuous drag gesture still propagates
//! within a fixed ceiling. Sends are gated on the channel's join state
//! and silently dropped otherwise — correctness is owed to the
//! reconciliation path, not to any individual send.
//!
//! Inbound messages are filtered for self-echo, debounced, merged, and
//! handed to the engine; they never re-trigger an outbound send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::change::{coalesce, Change};
use crate::channel::RealtimeChannel;
use crate::wire::WireMessage;

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Quiet period after the last `queue` before a flush.
    pub idle_delay: Duration,
    /// Hard ceiling from the first queued change of a burst to its send.
    pub max_latency: Duration,
    /// Inbound batches arriving within this window are merged into a
    /// single local-state update.
    pub debounce: Duration,
    /// Encoded payloads above this size are split into multiple sends.
    pub max_payload_bytes: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(50),
            max_latency: Duration::from_millis(500),
            debounce: Duration::from_millis(20),
            max_payload_bytes: 256 * 1024,
        }
    }
}

impl BroadcastConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            idle_delay: Duration::from_millis(20),
            max_latency: Duration::from_millis(100),
            debounce: Duration::from_millis(10),
            max_payload_bytes: 256 * 1024,
        }
    }
}

/// Snapshot of transport counters.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub payloads_split: u64,
    pub batches_received: u64,
}

/// Lock-free counters, read via snapshot.
struct AtomicTransportStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    split: AtomicU64,
    received: AtomicU64,
}

impl AtomicTransportStats {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            split: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }
}

struct PendingState {
    changes: Vec<Change>,
    idle_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
}

struct TransportInner {
    client_id: Uuid,
    board_id: Uuid,
    channel: Arc<dyn RealtimeChannel>,
    config: BroadcastConfig,
    pending: Mutex<PendingState>,
    kick: Notify,
    stats: AtomicTransportStats,
}

/// Outbound batching and inbound debounce for one client session.
pub struct BroadcastTransport {
    inner: Arc<TransportInner>,
    remote_rx: Option<mpsc::Receiver<Vec<Change>>>,
    outbound_task: tokio::task::JoinHandle<()>,
    inbound_task: tokio::task::JoinHandle<()>,
}

impl BroadcastTransport {
    pub fn new(
        client_id: Uuid,
        board_id: Uuid,
        channel: Arc<dyn RealtimeChannel>,
        config: BroadcastConfig,
    ) -> Self {
        let inner = Arc::new(TransportInner {
            client_id,
            board_id,
            channel: channel.clone(),
            config,
            pending: Mutex::new(PendingState {
                changes: Vec::new(),
                idle_deadline: None,
                max_deadline: None,
            }),
            kick: Notify::new(),
            stats: AtomicTransportStats::new(),
        });

        // Subscribe before spawning so no inbound message is missed.
        let subscription = channel.subscribe();
        let (remote_tx, remote_rx) = mpsc::channel(256);

        let outbound_task = tokio::spawn(outbound_loop(inner.clone()));
        let inbound_task = tokio::spawn(inbound_loop(inner.clone(), subscription, remote_tx));

        Self {
            inner,
            remote_rx: Some(remote_rx),
            outbound_task,
            inbound_task,
        }
    }

    /// Take the receiver of merged remote batches (once).
    pub fn take_remote_rx(&mut self) -> Option<mpsc::Receiver<Vec<Change>>> {
        self.remote_rx.take()
    }

    /// Append changes to the pending buffer and (re)arm the timers.
    pub async fn queue(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        {
            let mut pending = self.inner.pending.lock().await;
            pending.changes.extend(changes);
            let buffered = std::mem::take(&mut pending.changes);
            pending.changes = coalesce(buffered);

            let now = Instant::now();
            pending.idle_deadline = Some(now + self.inner.config.idle_delay);
            if pending.max_deadline.is_none() {
                pending.max_deadline = Some(now + self.inner.config.max_latency);
            }
        }
        self.inner.kick.notify_one();
    }

    /// Flush the pending buffer immediately.
    pub async fn flush(&self) {
        send_pending(&self.inner).await;
    }

    /// Number of changes currently buffered.
    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.changes.len()
    }

    /// Snapshot the transport counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.inner.stats.sent.load(Ordering::Relaxed),
            messages_dropped: self.inner.stats.dropped.load(Ordering::Relaxed),
            payloads_split: self.inner.stats.split.load(Ordering::Relaxed),
            batches_received: self.inner.stats.received.load(Ordering::Relaxed),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.inner.client_id
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        self.outbound_task.abort();
        self.inbound_task.abort();
    }
}

/// Timer loop: sleeps until the nearest armed deadline, re-evaluating
/// whenever `queue` kicks it.
async fn outbound_loop(inner: Arc<TransportInner>) {
    loop {
        let deadline = {
            let pending = inner.pending.lock().await;
            match (pending.idle_deadline, pending.max_deadline) {
                (Some(idle), Some(max)) => Some(idle.min(max)),
                (Some(d), None) | (None, Some(d)) => Some(d),
                (None, None) => None,
            }
        };

        match deadline {
            None => inner.kick.notified().await,
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => send_pending(&inner).await,
                    _ = inner.kick.notified() => {}
                }
            }
        }
    }
}

/// Drain, coalesce, and send the pending buffer.
async fn send_pending(inner: &TransportInner) {
    let batch = {
        let mut pending = inner.pending.lock().await;
        pending.idle_deadline = None;
        pending.max_deadline = None;
        std::mem::take(&mut pending.changes)
    };
    if batch.is_empty() {
        return;
    }
    let batch = coalesce(batch);
    if batch.is_empty() {
        return;
    }

    if !inner.channel.is_joined() {
        // Dropped silently: the next user action or timer retries with
        // fresher data, and reconciliation covers the gap.
        inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Channel not joined, dropping batch of {} changes",
            batch.len()
        );
        return;
    }

    let msg = WireMessage::changes(inner.client_id, inner.board_id, batch);
    let encoded_len = match msg.encode() {
        Ok(bytes) => bytes.len(),
        Err(e) => {
            log::warn!("Failed to encode broadcast batch: {e}");
            return;
        }
    };

    if encoded_len > inner.config.max_payload_bytes && msg.changes.len() > 1 {
        let parts = encoded_len.div_ceil(inner.config.max_payload_bytes);
        let group_size = msg.changes.len().div_ceil(parts).max(1);
        log::warn!(
            "Broadcast payload of {encoded_len} bytes exceeds {} byte ceiling, splitting into {} sends",
            inner.config.max_payload_bytes,
            msg.changes.len().div_ceil(group_size),
        );
        inner.stats.split.fetch_add(1, Ordering::Relaxed);
        for group in msg.changes.chunks(group_size) {
            let part = WireMessage::changes(inner.client_id, inner.board_id, group.to_vec());
            send_one(inner, &part).await;
        }
    } else {
        send_one(inner, &msg).await;
    }
}

async fn send_one(inner: &TransportInner, msg: &WireMessage) {
    match inner.channel.send(msg).await {
        Ok(()) => {
            inner.stats.sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Broadcast send failed: {e}");
        }
    }
}

/// Receive loop: filter self-echo, debounce, merge, deliver.
async fn inbound_loop(
    inner: Arc<TransportInner>,
    mut rx: broadcast::Receiver<Arc<WireMessage>>,
    remote_tx: mpsc::Sender<Vec<Change>>,
) {
    let accepts = |msg: &WireMessage| -> bool {
        msg.sender_id != inner.client_id && msg.board_id == inner.board_id
    };

    loop {
        let first = match rx.recv().await {
            Ok(msg) => msg,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Inbound receiver lagged, skipped {skipped} messages");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !accepts(&first) {
            continue;
        }

        let mut batch = first.changes.clone();
        // Debounce: keep absorbing batches until the window goes quiet.
        loop {
            match tokio::time::timeout(inner.config.debounce, rx.recv()).await {
                Ok(Ok(msg)) => {
                    if accepts(&msg) {
                        batch.extend(msg.changes.iter().cloned());
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    log::warn!("Inbound receiver lagged, skipped {skipped} messages");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => break,
            }
        }

        inner.stats.received.fetch_add(1, Ordering::Relaxed);
        let merged = coalesce(batch);
        if merged.is_empty() {
            continue;
        }
        if remote_tx.send(merged).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::clock::FieldClocks;
    use crate::object::{BoardObject, ObjectKind, ObjectPatch};
    use tokio::time::timeout;

    fn update_for(id: Uuid, x: f64) -> Change {
        Change::update(
            id,
            ObjectPatch {
                x: Some(x),
                ..ObjectPatch::default()
            },
            FieldClocks::new(),
        )
    }

    fn transport_pair(
        config: BroadcastConfig,
    ) -> (Arc<LoopbackChannel>, BroadcastTransport, Uuid, Uuid) {
        let channel = Arc::new(LoopbackChannel::new(64));
        let client = Uuid::new_v4();
        let board = Uuid::new_v4();
        let transport = BroadcastTransport::new(client, board, channel.clone(), config);
        (channel, transport, client, board)
    }

    #[tokio::test]
    async fn test_idle_timer_flushes_once() {
        let (channel, transport, _, _) = transport_pair(BroadcastConfig::for_testing());
        let mut rx = channel.subscribe();

        let id = Uuid::new_v4();
        transport.queue(vec![update_for(id, 10.0)]).await;
        transport.queue(vec![update_for(id, 20.0)]).await;

        let msg = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("idle timer should fire")
            .unwrap();
        assert_eq!(msg.changes.len(), 1);
        match &msg.changes[0] {
            Change::Update { patch, .. } => assert_eq!(patch.x, Some(20.0)),
            other => panic!("expected update, got {other:?}"),
        }

        // Nothing further pending
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_updates_within_idle_window_merge_into_one_message() {
        let (channel, transport, _, _) = transport_pair(BroadcastConfig::for_testing());
        let mut rx = channel.subscribe();

        let id = Uuid::new_v4();
        transport.queue(vec![update_for(id, 10.0)]).await;
        transport
            .queue(vec![Change::update(
                id,
                ObjectPatch {
                    y: Some(20.0),
                    ..ObjectPatch::default()
                },
                FieldClocks::new(),
            )])
            .await;

        let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.changes.len(), 1);
        match &msg.changes[0] {
            Change::Update { patch, .. } => {
                assert_eq!(patch.x, Some(10.0));
                assert_eq!(patch.y, Some(20.0));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_latency_bounds_continuous_burst() {
        let config = BroadcastConfig {
            idle_delay: Duration::from_millis(40),
            max_latency: Duration::from_millis(120),
            ..BroadcastConfig::for_testing()
        };
        let (channel, transport, _, _) = transport_pair(config);
        let mut rx = channel.subscribe();

        // Queue faster than the idle delay for ~300ms: only the
        // max-latency ceiling can fire.
        let id = Uuid::new_v4();
        let burst = async {
            for i in 0..20u32 {
                transport.queue(vec![update_for(id, f64::from(i))]).await;
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        };
        let recv = timeout(Duration::from_millis(250), rx.recv());
        let (_, received) = tokio::join!(burst, recv);
        assert!(
            received.is_ok(),
            "max-latency timer must flush during a continuous burst"
        );
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let (channel, transport, _, _) = transport_pair(BroadcastConfig {
            idle_delay: Duration::from_secs(60),
            max_latency: Duration::from_secs(120),
            ..BroadcastConfig::for_testing()
        });
        let mut rx = channel.subscribe();

        transport.queue(vec![update_for(Uuid::new_v4(), 1.0)]).await;
        assert_eq!(transport.pending_len().await, 1);
        transport.flush().await;
        assert_eq!(transport.pending_len().await, 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_not_joined_drops_silently() {
        let (channel, transport, _, _) = transport_pair(BroadcastConfig::for_testing());
        let mut rx = channel.subscribe();
        channel.set_joined(false);

        transport.queue(vec![update_for(Uuid::new_v4(), 1.0)]).await;
        transport.flush().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(transport.stats().messages_sent, 0);
        assert_eq!(transport.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_splits() {
        let config = BroadcastConfig {
            max_payload_bytes: 256,
            ..BroadcastConfig::for_testing()
        };
        let (channel, transport, _, board) = transport_pair(config);
        let mut rx = channel.subscribe();

        // Several creates comfortably exceed 256 encoded bytes.
        let creator = Uuid::new_v4();
        let changes: Vec<Change> = (0..8)
            .map(|_| {
                Change::create(
                    BoardObject::new(ObjectKind::Sticky, board, 0.0, 0.0, creator),
                    FieldClocks::new(),
                )
            })
            .collect();
        transport.queue(changes).await;
        transport.flush().await;

        let mut messages = 0;
        let mut total = 0;
        while let Ok(msg) = rx.try_recv() {
            messages += 1;
            total += msg.changes.len();
        }
        assert!(messages > 1, "payload should be split into multiple sends");
        assert_eq!(total, 8);
        assert!(transport.stats().payloads_split >= 1);
    }

    #[tokio::test]
    async fn test_self_echo_filtered() {
        let (_, mut transport, _, _) = transport_pair(BroadcastConfig::for_testing());
        let mut remote_rx = transport.take_remote_rx().unwrap();

        transport.queue(vec![update_for(Uuid::new_v4(), 1.0)]).await;
        transport.flush().await;

        // Our own message fanned out through the loopback but must not
        // come back as a remote batch.
        let echoed = timeout(Duration::from_millis(100), remote_rx.recv()).await;
        assert!(echoed.is_err(), "own messages must be filtered");
    }

    #[tokio::test]
    async fn test_inbound_debounce_merges_batches() {
        let channel = Arc::new(LoopbackChannel::new(64));
        let board = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut transport = BroadcastTransport::new(
            Uuid::new_v4(),
            board,
            channel.clone(),
            BroadcastConfig {
                debounce: Duration::from_millis(50),
                ..BroadcastConfig::for_testing()
            },
        );
        let mut remote_rx = transport.take_remote_rx().unwrap();

        let id = Uuid::new_v4();
        channel
            .send(&WireMessage::changes(peer, board, vec![update_for(id, 1.0)]))
            .await
            .unwrap();
        channel
            .send(&WireMessage::changes(
                peer,
                board,
                vec![Change::update(
                    id,
                    ObjectPatch {
                        y: Some(2.0),
                        ..ObjectPatch::default()
                    },
                    FieldClocks::new(),
                )],
            ))
            .await
            .unwrap();

        let batch = timeout(Duration::from_secs(1), remote_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Change::Update { patch, .. } => {
                assert_eq!(patch.x, Some(1.0));
                assert_eq!(patch.y, Some(2.0));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_board_filtered() {
        let channel = Arc::new(LoopbackChannel::new(64));
        let board = Uuid::new_v4();
        let mut transport = BroadcastTransport::new(
            Uuid::new_v4(),
            board,
            channel.clone(),
            BroadcastConfig::for_testing(),
        );
        let mut remote_rx = transport.take_remote_rx().unwrap();

        channel
            .send(&WireMessage::changes(
                Uuid::new_v4(),
                Uuid::new_v4(), // different board
                vec![update_for(Uuid::new_v4(), 1.0)],
            ))
            .await
            .unwrap();

        let received = timeout(Duration::from_millis(100), remote_rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_create_then_delete_in_batch_sends_nothing() {
        let (channel, transport, _, board) = transport_pair(BroadcastConfig::for_testing());
        let mut rx = channel.subscribe();

        let object = BoardObject::new(ObjectKind::Rect, board, 0.0, 0.0, Uuid::new_v4());
        let id = object.id;
        transport
            .queue(vec![Change::create(object, FieldClocks::new())])
            .await;
        transport
            .queue(vec![Change::delete(id, FieldClocks::new())])
            .await;
        transport.flush().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err(), "cancelled batch must send nothing");
        assert_eq!(transport.stats().messages_sent, 0);
    }
}
