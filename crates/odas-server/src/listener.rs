use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use odas_core::{Category, FrameDecoder, RelayError, StatusEvent};
use odas_telemetry::{names, MetricsRecorder};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Default per-connection read buffer (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Back-off after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What a listener reports upward.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    /// The category's upstream connection opened or closed.
    Status(StatusEvent),
    /// One decoded frame.
    Frame { category: Category, frame: Value },
}

/// Receives listener output. Called inline on the connection's read task,
/// so implementations must not block.
pub trait SourceSink: Send + Sync + 'static {
    fn on_event(&self, event: SourceEvent);
}

/// TCP accept loop for one telemetry category.
pub struct SourceListener {
    category: Category,
    listener: TcpListener,
    read_buffer_size: usize,
    metrics: Arc<MetricsRecorder>,
}

impl SourceListener {
    /// Bind the category's port. Port 0 picks a free one.
    pub async fn bind(
        category: Category,
        addr: SocketAddr,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self {
            category,
            listener,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            metrics,
        })
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// connection task to report its close.
    pub async fn run(self, sink: Arc<dyn SourceSink>, shutdown: CancellationToken) {
        let category = self.category;
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(category = category.label(), port = addr.port(), "Listening");
        }

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection {
                            category,
                            peer,
                            sink: Arc::clone(&sink),
                            metrics: Arc::clone(&self.metrics),
                            read_buffer_size: self.read_buffer_size,
                        };
                        tracker.spawn(conn.run(stream, shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(category = category.label(), error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!(category = category.label(), "Listener stopped");
    }
}

/// State for one accepted upstream connection.
struct Connection {
    category: Category,
    peer: SocketAddr,
    sink: Arc<dyn SourceSink>,
    metrics: Arc<MetricsRecorder>,
    read_buffer_size: usize,
}

impl Connection {
    async fn run(self, mut stream: TcpStream, shutdown: CancellationToken) {
        let labels = [("category", self.category.as_str())];
        tracing::info!(category = self.category.label(), peer = %self.peer, "Connected");
        self.metrics.counter_inc(names::CONNECTIONS_ACCEPTED, &labels, 1);
        self.metrics.gauge_add(names::CONNECTIONS_ACTIVE, &labels, 1);
        self.sink
            .on_event(SourceEvent::Status(StatusEvent::new(self.category, true)));

        let mut decoder = FrameDecoder::new();
        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = stream.read_buf(decoder.read_buffer(self.read_buffer_size)) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => self.process_chunk(&mut decoder, n),
                Err(e) => {
                    tracing::warn!(
                        category = self.category.label(),
                        peer = %self.peer,
                        error = %e,
                        "Read error"
                    );
                    break;
                }
            }
        }

        if decoder.pending_len() > 0 {
            tracing::debug!(
                category = self.category.label(),
                pending = decoder.pending_len(),
                "Discarding buffered partial frame"
            );
        }
        tracing::info!(
            category = self.category.label(),
            peer = %self.peer,
            frames = decoder.decoded(),
            dropped = decoder.dropped(),
            "Disconnected"
        );
        self.metrics.gauge_add(names::CONNECTIONS_ACTIVE, &labels, -1);
        self.sink
            .on_event(SourceEvent::Status(StatusEvent::new(self.category, false)));
    }

    /// Decode what the last read appended (`received` bytes) and hand every
    /// frame to the sink before returning.
    fn process_chunk(&self, decoder: &mut FrameDecoder, received: usize) {
        let labels = [("category", self.category.as_str())];
        let dropped_before = decoder.dropped();

        let frames = decoder.decode();
        let decoded = frames.len() as u64;
        for frame in frames {
            self.sink.on_event(SourceEvent::Frame {
                category: self.category,
                frame,
            });
        }

        let dropped = decoder.dropped() - dropped_before;
        if dropped > 0 {
            tracing::trace!(category = self.category.label(), dropped, "Skipped malformed frame");
        }
        self.metrics
            .counter_inc(names::BYTES_RECEIVED, &labels, received as u64);
        self.metrics.counter_inc(names::FRAMES_DECODED, &labels, decoded);
        self.metrics.counter_inc(names::FRAMES_DROPPED, &labels, dropped);
    }
}
