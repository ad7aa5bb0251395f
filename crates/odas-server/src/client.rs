use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hub::{BroadcastHub, PushChannel, SendOutcome, SubscriberId};

/// Timing for the WebSocket heartbeat.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// A browser connected over WebSocket.
///
/// Published envelopes go into a bounded queue drained by the connection's
/// writer task, so the hub never waits on the socket.
pub struct WsChannel {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<str>>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    timeout: Duration,
}

impl WsChannel {
    pub fn new(max_send_queue: usize, timeout: Duration) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(max_send_queue);
        let channel = Arc::new(Self {
            id: SubscriberId::new(),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            timeout,
        });
        (channel, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }
}

impl PushChannel for WsChannel {
    fn id(&self) -> &SubscriberId {
        &self.id
    }

    fn is_ready(&self) -> bool {
        self.is_connected() && !self.tx.is_closed()
    }

    fn send(&self, text: Arc<str>) -> SendOutcome {
        match self.tx.try_send(text) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    subscriber_id = %self.id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                SendOutcome::NotReady
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        self.is_ready() && now_secs().saturating_sub(last) < self.timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Drive one WebSocket subscriber until either side closes or shutdown fires.
///
/// The writer forwards queued envelopes and pings on every heartbeat tick.
/// The reader only watches for pongs and close frames; anything the browser
/// sends is ignored.
pub async fn handle_ws_connection(
    socket: WebSocket,
    channel: Arc<WsChannel>,
    mut rx: mpsc::Receiver<Arc<str>>,
    hub: Arc<BroadcastHub>,
    heartbeat: Heartbeat,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let id = channel.id().clone();

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(subscriber_id = %writer_id, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_channel = Arc::clone(&channel);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Pong(_) => reader_channel.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let writer_abort = writer.abort_handle();
    let reader_abort = reader.abort_handle();
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
        _ = shutdown.cancelled() => {},
    }
    writer_abort.abort();
    reader_abort.abort();

    channel.mark_disconnected();
    hub.unregister(&id);
    tracing::info!(subscriber_id = %id, "Browser disconnected");
}

/// Start a background task that periodically removes dead subscribers.
pub fn start_cleanup_task(
    hub: Arc<BroadcastHub>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = hub.cleanup_dead();
                    if removed > 0 {
                        tracing::info!(removed = removed, "Dead subscriber cleanup");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
