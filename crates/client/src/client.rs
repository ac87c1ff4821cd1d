//! Embedded bus client
//!
//! Maintains one TCP connection to the bus server on behalf of a
//! [`Registry`]: registers tags, subscribes, publishes locally authored
//! changes by exception, applies remote changes to local tags, and routes
//! request-to-author traffic both ways.
//!
//! # Connection lifecycle
//!
//! 1. Dial (5 s timeout), then send the hello: an ID request for the
//!    reserved `__bus__` tag carrying the proposed TUS in `time_us`.
//! 2. The directed ID reply carries the agreed TUS and this connection's
//!    bus id; on it, every registered tag is announced with ID and
//!    subscribed on the reply.
//! 3. On any read error, close and reconnect with exponential backoff
//!    (100 ms to 30 s, full jitter), then re-run step 1.
//!
//! Reads falling silent for over a minute force a reconnect; a GET
//! heartbeat on `__bus__` keeps a healthy idle link audibly alive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tagbus_protocol::{
    decode_value, Command, Framer, Message, ProtocolError, BUS_TAG, DEFAULT_PORT, DEFAULT_TUS,
    MIN_TUS,
};

use crate::error::ClientError;
use crate::queue::{Outbound, SendQueue};
use crate::tag::{LinkCmd, Registry, Tag};

/// Bus client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bus server host (loopback in production)
    pub address: String,

    /// Bus server port
    pub port: u16,

    /// TCP connect timeout
    pub dial_timeout: Duration,

    /// Reconnect when nothing has been read for this long
    pub read_silence: Duration,

    /// GET heartbeat period on the `__bus__` tag
    pub heartbeat_interval: Duration,

    /// First reconnect delay; doubles up to `backoff_ceiling`
    pub backoff_floor: Duration,

    /// Largest reconnect delay
    pub backoff_ceiling: Duration,

    /// Outbound queue capacity before coalescing starts evicting
    pub queue_capacity: usize,

    /// Transmit-unit size proposed in the hello
    pub tus: usize,

    /// Enable TCP keepalive probes
    pub keepalive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            dial_timeout: Duration::from_secs(5),
            read_silence: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            backoff_floor: Duration::from_millis(100),
            backoff_ceiling: Duration::from_secs(30),
            queue_capacity: 1024,
            tus: DEFAULT_TUS,
            keepalive: true,
        }
    }
}

impl ClientConfig {
    /// Config pointed at a specific port on loopback
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Set the server address
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the proposed transmit-unit size
    #[must_use]
    pub fn with_tus(mut self, tus: usize) -> Self {
        self.tus = tus.clamp(MIN_TUS, DEFAULT_TUS);
        self
    }

    /// The host:port string to dial
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Counters kept by the client, shared with [`ClientMetricsHandle`]
#[derive(Debug, Default)]
struct ClientMetrics {
    connects: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time snapshot of client counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMetricsSnapshot {
    pub connects: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub errors: u64,
}

/// Cheap handle for reading client counters after `run()` consumes the client
#[derive(Clone)]
pub struct ClientMetricsHandle {
    metrics: Arc<ClientMetrics>,
}

impl ClientMetricsHandle {
    /// Current counter values
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            connects: self.metrics.connects.load(Ordering::Relaxed),
            messages_in: self.metrics.messages_in.load(Ordering::Relaxed),
            messages_out: self.metrics.messages_out.load(Ordering::Relaxed),
            bytes_in: self.metrics.bytes_in.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
        }
    }
}

/// What the hello exchange established for this connection
struct Hello {
    /// Server-assigned connection id
    conn_id: u16,
    /// Agreed transmit-unit size
    tus: usize,
    /// Tag id of `__bus__`, the heartbeat target
    bus_tag_id: u16,
}

/// Per-connection state, discarded on reconnect
struct Session {
    framer: Framer,
    read_buf: BytesMut,
    write_buf: BytesMut,
    name_to_id: HashMap<String, u16>,
    tags_by_id: HashMap<u16, Tag>,
    subscribed: HashSet<u16>,
    hello: Option<Hello>,
    last_read: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            framer: Framer::new(DEFAULT_TUS),
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::new(),
            name_to_id: HashMap::new(),
            tags_by_id: HashMap::new(),
            subscribed: HashSet::new(),
            hello: None,
            last_read: Instant::now(),
        }
    }
}

/// The per-process bus client.
///
/// Create once per [`Registry`] and hand to `run()` on a task; tags keep
/// working locally while the connection is down, with the newest value per
/// tag queued for delivery.
pub struct BusClient {
    registry: Registry,
    config: ClientConfig,
    cmd_rx: mpsc::UnboundedReceiver<LinkCmd>,
    queue: SendQueue,
    metrics: Arc<ClientMetrics>,
}

impl BusClient {
    /// Create a client attached to `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyAttached`] if the registry already has
    /// a bus client - one per process is the deal.
    pub fn new(registry: &Registry, config: ClientConfig) -> Result<Self, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !registry.attach_link(tx) {
            return Err(ClientError::AlreadyAttached);
        }
        let queue = SendQueue::new(config.queue_capacity);
        Ok(Self {
            registry: registry.clone(),
            config,
            cmd_rx: rx,
            queue,
            metrics: Arc::new(ClientMetrics::default()),
        })
    }

    /// Handle for reading counters once `run()` has consumed the client
    pub fn metrics_handle(&self) -> ClientMetricsHandle {
        ClientMetricsHandle {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Run until cancelled, reconnecting with backoff on any failure
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ClientError> {
        let address = self.config.server_address();
        let mut backoff = self.config.backoff_floor;

        loop {
            // Changes made while disconnected coalesce into the queue
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.handle_cmd(cmd, false);
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.dial(&address, &cancel).await {
                Ok(Some(stream)) => {
                    self.metrics.connects.fetch_add(1, Ordering::Relaxed);
                    backoff = self.config.backoff_floor;
                    match self.session(stream, &cancel).await {
                        Ok(()) => return Ok(()), // cancelled
                        Err(e) => {
                            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(%address, error = %e, "bus connection lost");
                        }
                    }
                }
                Ok(None) => return Ok(()), // cancelled mid-dial
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%address, error = %e, "bus connect failed");
                }
            }

            // Full jitter: anywhere between zero and the current ceiling
            let wait = backoff.mul_f64(rand::random::<f64>());
            debug!(delay_ms = wait.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
            backoff = (backoff * 2).min(self.config.backoff_ceiling);
        }
    }

    /// Connect with the dial timeout; `Ok(None)` means cancelled
    async fn dial(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TcpStream>, ClientError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            dialed = timeout(self.config.dial_timeout, TcpStream::connect(address)) => {
                match dialed {
                    Ok(Ok(stream)) => Ok(Some(stream)),
                    Ok(Err(source)) => Err(ClientError::Connect {
                        address: address.to_string(),
                        source,
                    }),
                    Err(_) => Err(ClientError::DialTimeout {
                        address: address.to_string(),
                    }),
                }
            }
        }
    }

    /// Drive one established connection until it fails or we are cancelled
    async fn session(
        &mut self,
        mut stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.configure_socket(&stream);
        let mut session = Session::new();

        // Hello: ID request for __bus__ with our proposed TUS in time_us
        Message::new(
            Command::Id,
            0,
            self.config.tus as u64,
            0,
            Bytes::copy_from_slice(BUS_TAG.as_bytes()),
        )
        .encode_into(DEFAULT_TUS, &mut session.write_buf);

        let (mut rd, mut wr) = stream.split();
        wr.write_all(&session.write_buf).await?;
        session.write_buf.clear();
        info!(address = %self.config.server_address(), "connected to bus, hello sent");

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Best-effort flush of whatever is already queued
                    let _ = self.flush(&mut session, &mut wr).await;
                    return Ok(());
                }

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    let hello_done = session.hello.is_some();
                    self.handle_cmd(cmd, hello_done);
                    while let Ok(cmd) = self.cmd_rx.try_recv() {
                        self.handle_cmd(cmd, hello_done);
                    }
                }

                read = rd.read_buf(&mut session.read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(ClientError::ConnectionClosed);
                    }
                    session.last_read = Instant::now();
                    self.metrics.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    while let Some(message) = session.framer.next(&mut session.read_buf)? {
                        self.handle_message(message, &mut session)?;
                    }
                }

                _ = ticker.tick() => {
                    let idle = session.last_read.elapsed();
                    if idle > self.config.read_silence {
                        return Err(ClientError::ReadSilence { idle });
                    }
                    if let Some(hello) = &session.hello {
                        self.queue.push(Outbound::Control(Message::new(
                            Command::Get, hello.bus_tag_id, 0, 0, Bytes::new(),
                        )));
                    }
                }
            }

            self.flush(&mut session, &mut wr).await?;
        }
    }

    /// Process one command from the registry's tags
    fn handle_cmd(&mut self, cmd: LinkCmd, hello_done: bool) {
        match cmd {
            LinkCmd::Register { name } => {
                // Before the hello completes the registration sweep will
                // pick the tag up from the registry anyway.
                if hello_done {
                    self.queue.push(Outbound::Control(id_request(&name)));
                }
            }
            LinkCmd::Publish {
                name,
                value,
                time_us,
            } => self.queue.push_set(name, value, time_us),
            LinkCmd::Rta { name, value } => self.queue.push(Outbound::Rta { name, value }),
        }
    }

    /// Apply one inbound message to local state
    fn handle_message(&mut self, msg: Message, session: &mut Session) -> Result<(), ClientError> {
        self.metrics.messages_in.fetch_add(1, Ordering::Relaxed);
        match msg.command {
            Command::Id => {
                let name = std::str::from_utf8(&msg.payload)
                    .map_err(ProtocolError::from)?
                    .to_string();

                if name == BUS_TAG {
                    // Only the directed hello reply carries our connection
                    // id; broadcast copies of other hellos carry zero.
                    if session.hello.is_none() && msg.bus_id != 0 {
                        let ceiling = self.config.tus.max(MIN_TUS);
                        let tus = (msg.time_us as usize).clamp(MIN_TUS, ceiling);
                        session.hello = Some(Hello {
                            conn_id: msg.bus_id,
                            tus,
                            bus_tag_id: msg.tag_id,
                        });
                        info!(conn_id = msg.bus_id, tus, "bus hello complete");
                        for tag in self.registry.tags() {
                            self.queue.push(Outbound::Control(id_request(tag.name())));
                            // Locally authored values (configured inits, or
                            // anything set while disconnected) go up as soon
                            // as the id lands.
                            if tag.bus_id() == 0 {
                                if let Some(value) = tag.value() {
                                    self.queue.push_set(
                                        tag.name().to_string(),
                                        value,
                                        tag.time_us(),
                                    );
                                }
                            }
                        }
                    }
                    return Ok(());
                }

                session.name_to_id.insert(name.clone(), msg.tag_id);
                if let Some(tag) = self.registry.get(&name) {
                    tag.set_wire_id(msg.tag_id);
                    session.tags_by_id.insert(msg.tag_id, tag);
                    if session.subscribed.insert(msg.tag_id) {
                        self.queue.push(Outbound::Control(Message::new(
                            Command::Sub,
                            msg.tag_id,
                            0,
                            0,
                            Bytes::new(),
                        )));
                    }
                }
            }

            Command::Set => {
                let Some(tag) = session.tags_by_id.get(&msg.tag_id) else {
                    trace!(tag_id = msg.tag_id, "SET for unknown tag id");
                    return Ok(());
                };
                // Empty payload: the server has no value for this tag yet
                let Some(value) = decode_value(&msg.payload)? else {
                    return Ok(());
                };
                // Stamp the remote authorship before callbacks run so the
                // publish path knows this change already crossed the bus.
                let bus_id = match msg.bus_id {
                    0 => session.hello.as_ref().map_or(0, |h| h.conn_id),
                    id => id,
                };
                if let Err(e) = tag.set_from_bus(value, msg.time_us, bus_id) {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(tag = tag.name(), error = %e, "dropping bus update");
                }
            }

            Command::Rta => {
                let Some(tag) = session.tags_by_id.get(&msg.tag_id) else {
                    trace!(tag_id = msg.tag_id, "RTA for unknown tag id");
                    return Ok(());
                };
                if let Some(value) = decode_value(&msg.payload)? {
                    tag.handle_rta(value);
                }
            }

            Command::Err => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tag_id = msg.tag_id,
                    text = %String::from_utf8_lossy(&msg.payload),
                    "bus server error"
                );
            }

            Command::Get | Command::Sub => {
                warn!(command = %msg.command, "unexpected command from server");
            }
        }
        Ok(())
    }

    /// Write out every queued message whose tag id is known
    async fn flush(
        &mut self,
        session: &mut Session,
        wr: &mut WriteHalf<'_>,
    ) -> Result<(), ClientError> {
        let Some(hello) = &session.hello else {
            return Ok(());
        };
        let tus = hello.tus;

        let name_to_id = &session.name_to_id;
        while let Some(message) = self.queue.pop_ready(|name| name_to_id.get(name).copied()) {
            message.encode_into(tus, &mut session.write_buf);
            self.metrics.messages_out.fetch_add(1, Ordering::Relaxed);
        }

        if !session.write_buf.is_empty() {
            wr.write_all(&session.write_buf).await?;
            wr.flush().await?;
            session.write_buf.clear();
        }
        Ok(())
    }

    /// Best-effort socket tuning; failures are logged, never fatal
    fn configure_socket(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        if self.config.keepalive {
            let sock_ref = SockRef::from(stream);
            let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
            #[cfg(target_os = "linux")]
            let keepalive = keepalive.with_interval(Duration::from_secs(10));
            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                debug!(error = %e, "failed to set TCP keepalive");
            }
        }
    }
}

/// ID request announcing (or asking about) a tag name
fn id_request(name: &str) -> Message {
    Message::new(
        Command::Id,
        0,
        0,
        0,
        Bytes::copy_from_slice(name.as_bytes()),
    )
}
