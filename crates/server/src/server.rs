//! TCP front end of the bus server
//!
//! Accepts connections and gives each one a reader task and a writer task.
//! The reader frames inbound bytes into whole messages and applies them to
//! the shared [`BusState`](crate::state::BusState); the writer drains a
//! bounded queue, fragmenting each message at the connection's negotiated
//! TUS. A slow or stalled subscriber fills only its own queue; once full,
//! further fan-out to it is dropped with a warning rather than stalling
//! the bus.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tagbus_protocol::{Command, Framer, Message, DEFAULT_PORT, DEFAULT_TUS};

use crate::error::ServerError;
use crate::state::{BusState, Delivery};

/// Bus server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address; loopback unless an external proxy fronts the bus
    pub address: String,

    /// Listen port
    pub port: u16,

    /// Per-connection write queue depth, in messages
    pub queue_depth: usize,

    /// Largest TUS the server will agree to in a hello
    pub max_tus: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            queue_depth: 1024,
            max_tus: DEFAULT_TUS,
        }
    }
}

impl ServerConfig {
    /// Config listening on a specific loopback port
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// The address:port string to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Server counters
#[derive(Debug, Default)]
struct ServerMetrics {
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    sends_dropped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time snapshot of server counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerMetricsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub sends_dropped: u64,
    pub errors: u64,
}

/// Cheap handle for reading server counters after `run()` consumes the server
#[derive(Clone)]
pub struct ServerMetricsHandle {
    metrics: Arc<ServerMetrics>,
}

impl ServerMetricsHandle {
    /// Current counter values
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            connections_active: self.metrics.connections_active.load(Ordering::Relaxed),
            connections_total: self.metrics.connections_total.load(Ordering::Relaxed),
            messages_in: self.metrics.messages_in.load(Ordering::Relaxed),
            messages_out: self.metrics.messages_out.load(Ordering::Relaxed),
            sends_dropped: self.metrics.sends_dropped.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
        }
    }
}

/// The bus server
pub struct BusServer {
    config: ServerConfig,
    state: Arc<Mutex<BusState>>,
    metrics: Arc<ServerMetrics>,
}

impl BusServer {
    /// Create a server; nothing binds until `run`
    pub fn new(config: ServerConfig) -> Self {
        let state = Arc::new(Mutex::new(BusState::new(config.max_tus)));
        Self {
            config,
            state,
            metrics: Arc::new(ServerMetrics::default()),
        }
    }

    /// Handle for reading counters once `run()` has consumed the server
    pub fn metrics_handle(&self) -> ServerMetricsHandle {
        ServerMetricsHandle {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Bind the configured address and serve until cancelled.
    ///
    /// Returns an error only for faults the server cannot survive: a bind
    /// failure, a broken listener, or connection id exhaustion.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: bind_addr.clone(),
                source,
            })?;
        info!(address = %bind_addr, "bus server listening");
        self.run_on(listener, cancel).await
    }

    /// Serve on an already bound listener (lets tests bind port 0)
    pub async fn run_on(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("bus server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let (tx, rx) = mpsc::channel(self.config.queue_depth);
                    let tus = Arc::new(AtomicUsize::new(self.config.max_tus));
                    let conn_id = self
                        .state
                        .lock()
                        .unwrap()
                        .connection_opened(tx, Arc::clone(&tus))?;

                    self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
                    info!(conn_id, peer = %peer, "connection accepted");

                    let state = Arc::clone(&self.state);
                    let metrics = Arc::clone(&self.metrics);
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        handle_connection(state, metrics, conn_id, stream, rx, tus, conn_cancel)
                            .await;
                    });
                }
            }
        }
    }
}

/// Drive one connection to completion, then scrub it from the bus state
async fn handle_connection(
    state: Arc<Mutex<BusState>>,
    metrics: Arc<ServerMetrics>,
    conn_id: u16,
    stream: TcpStream,
    queue_rx: mpsc::Receiver<Message>,
    tus: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id, error = %e, "failed to set TCP_NODELAY");
    }
    let (rd, wr) = stream.into_split();

    let writer = tokio::spawn(write_loop(wr, queue_rx, Arc::clone(&tus), Arc::clone(&metrics)));

    if let Err(e) = read_loop(&state, &metrics, conn_id, rd, Arc::clone(&tus), cancel).await {
        metrics.errors.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id, error = %e, "connection closing on error");
    }

    // Removing the connection drops the bus-held sender; the writer then
    // drains whatever is queued (including a final ERR) and exits.
    state.lock().unwrap().connection_closed(conn_id);
    metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    let _ = writer.await;
    info!(conn_id, "connection closed");
}

/// Read frames, apply them to the state, dispatch the resulting deliveries
async fn read_loop(
    state: &Mutex<BusState>,
    metrics: &ServerMetrics,
    conn_id: u16,
    mut rd: tokio::net::tcp::OwnedReadHalf,
    tus: Arc<AtomicUsize>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    // The shared TUS starts at the configured maximum and only shrinks in
    // the hello, so accepting frames at its current value keeps the read
    // side in agreement with whatever the writer will emit.
    let mut framer = Framer::new(tus.load(Ordering::Relaxed));
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = rd.read_buf(&mut read_buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        loop {
            let message = match framer.next(&mut read_buf) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    // Protocol violation: tell the peer why, then hang up
                    warn!(conn_id, error = %e, "protocol violation");
                    let err = Message::new(
                        Command::Err,
                        0,
                        0,
                        0,
                        Bytes::from(format!("protocol violation: {e}")),
                    );
                    dispatch(state.lock().unwrap().direct(conn_id, err), metrics);
                    return Ok(());
                }
            };

            metrics.messages_in.fetch_add(1, Ordering::Relaxed);
            let deliveries = state.lock().unwrap().handle(conn_id, message);
            dispatch(deliveries, metrics);
        }
    }
}

/// Hand deliveries to their per-connection queues without blocking.
///
/// A full queue means that subscriber is not keeping up; dropping the
/// update is safe because the next SET or a GET resynchronises it.
fn dispatch(deliveries: Vec<Delivery>, metrics: &ServerMetrics) {
    for delivery in deliveries {
        match delivery.tx.try_send(delivery.message) {
            Ok(()) => {
                metrics.messages_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                metrics.sends_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conn_id = delivery.conn_id,
                    command = %message.command,
                    tag_id = message.tag_id,
                    "write queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Connection already tearing down; cleanup handles the rest
            }
        }
    }
}

/// Drain the write queue, fragmenting at the connection's negotiated TUS
async fn write_loop(
    mut wr: tokio::net::tcp::OwnedWriteHalf,
    mut queue_rx: mpsc::Receiver<Message>,
    tus: Arc<AtomicUsize>,
    metrics: Arc<ServerMetrics>,
) {
    let mut write_buf = BytesMut::with_capacity(64 * 1024);

    while let Some(message) = queue_rx.recv().await {
        message.encode_into(tus.load(Ordering::Relaxed), &mut write_buf);

        // Batch whatever else is already queued into one write
        while let Ok(message) = queue_rx.try_recv() {
            message.encode_into(tus.load(Ordering::Relaxed), &mut write_buf);
        }

        if let Err(e) = wr.write_all(&write_buf).await {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "write failed, dropping connection");
            return;
        }
        if let Err(e) = wr.flush().await {
            debug!(error = %e, "flush failed, dropping connection");
            return;
        }
        write_buf.clear();
    }
}
