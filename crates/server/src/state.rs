//! Bus state: the name/id maps, last-value store and subscriber sets
//!
//! All message semantics live here as pure in-memory transitions so they
//! can be tested without sockets. [`BusState::handle`] consumes one inbound
//! message and returns the messages to deliver, each paired with its
//! target's queue sender; the network layer dispatches them after the
//! state lock is released.
//!
//! The store is type-opaque: tag values are kept and forwarded as the raw
//! type-tagged payload bytes, exactly as the author framed them. Only
//! clients interpret values.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tagbus_protocol::{Command, Message, BUS_TAG, MIN_TUS};

use crate::error::ServerError;

/// A message to deliver and the connection queue to put it on
pub(crate) struct Delivery {
    pub conn_id: u16,
    pub tx: mpsc::Sender<Message>,
    pub message: Message,
}

/// What the server knows about one connection
pub(crate) struct ConnRecord {
    /// Sender side of the connection's bounded write queue
    tx: mpsc::Sender<Message>,
    /// Negotiated transmit-unit size, shared with the writer task
    tus: Arc<AtomicUsize>,
}

/// One tag as the bus sees it
pub(crate) struct TagRecord {
    name: String,
    /// Raw type-tagged value payload; empty until first SET
    value: Bytes,
    time_us: u64,
    /// Connection that authored the current value; 0 = never set
    author: u16,
    subscribers: HashSet<u16>,
}

impl TagRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            value: Bytes::new(),
            time_us: 0,
            author: 0,
            subscribers: HashSet::new(),
        }
    }

    /// A directed SET carrying the stored value (empty when never set)
    fn snapshot(&self, tag_id: u16) -> Message {
        Message::new(
            Command::Set,
            tag_id,
            self.time_us,
            self.author,
            self.value.clone(),
        )
    }
}

/// The whole bus: maps, store, subscriptions, connections
pub(crate) struct BusState {
    names: HashMap<String, u16>,
    tags: HashMap<u16, TagRecord>,
    next_tag_id: u16,
    connections: HashMap<u16, ConnRecord>,
    next_conn_id: u16,
    max_tus: usize,
}

impl BusState {
    pub(crate) fn new(max_tus: usize) -> Self {
        Self {
            names: HashMap::new(),
            tags: HashMap::new(),
            next_tag_id: 1,
            connections: HashMap::new(),
            next_conn_id: 1,
            max_tus: max_tus.max(MIN_TUS),
        }
    }

    /// Register a new connection, assigning the next 16-bit id.
    ///
    /// Ids are never reused; wrapping the space is fatal for the whole
    /// server process.
    pub(crate) fn connection_opened(
        &mut self,
        tx: mpsc::Sender<Message>,
        tus: Arc<AtomicUsize>,
    ) -> Result<u16, ServerError> {
        if self.next_conn_id == u16::MAX {
            return Err(ServerError::ConnectionIdsExhausted);
        }
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.connections.insert(conn_id, ConnRecord { tx, tus });
        Ok(conn_id)
    }

    /// Drop a connection and all its subscriptions. Values it authored
    /// stay; RTA to them fails until someone authors again.
    pub(crate) fn connection_closed(&mut self, conn_id: u16) {
        self.connections.remove(&conn_id);
        for tag in self.tags.values_mut() {
            tag.subscribers.remove(&conn_id);
        }
    }

    /// Number of live connections
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Apply one inbound message and produce the deliveries it causes.
    ///
    /// Anything a peer can get wrong at this level (unknown tag, no RTA
    /// author) is answered with an ERR delivery; protocol violations are
    /// the framing layer's to raise.
    pub(crate) fn handle(&mut self, conn_id: u16, msg: Message) -> Vec<Delivery> {
        match msg.command {
            Command::Id => self.handle_id(conn_id, msg),
            Command::Set => self.handle_set(conn_id, msg),
            Command::Get => self.handle_get(conn_id, msg),
            Command::Sub => self.handle_sub(conn_id, msg),
            Command::Rta => self.handle_rta(conn_id, msg),
            Command::Err => {
                warn!(
                    conn_id,
                    text = %String::from_utf8_lossy(&msg.payload),
                    "ERR from client"
                );
                Vec::new()
            }
        }
    }

    /// ID: look up or allocate, then broadcast the mapping to every
    /// connection so no peer needs to ask again.
    ///
    /// The requester's copy of a `__bus__` ID doubles as the hello reply:
    /// it carries the negotiated TUS in `time_us` and the requester's own
    /// connection id in `bus_id`. Broadcast copies carry zeroes there.
    fn handle_id(&mut self, conn_id: u16, msg: Message) -> Vec<Delivery> {
        let name = match std::str::from_utf8(&msg.payload) {
            Ok(name) if !name.is_empty() => name.to_string(),
            _ => {
                return self.err_to(conn_id, msg.tag_id, "ID with unusable name");
            }
        };

        let tag_id = match self.names.get(&name) {
            Some(&id) => id,
            None => {
                if self.next_tag_id == u16::MAX {
                    warn!(name = %name, "tag id space exhausted");
                    return self.err_to(conn_id, 0, "tag id space exhausted");
                }
                let id = self.next_tag_id;
                self.next_tag_id += 1;
                self.names.insert(name.clone(), id);
                self.tags.insert(id, TagRecord::new(name.clone()));
                debug!(name = %name, tag_id = id, "tag created");
                id
            }
        };

        let hello = name == BUS_TAG;
        let payload = Bytes::from(name.into_bytes());
        let mut deliveries = Vec::with_capacity(self.connections.len());
        for (&target, conn) in &self.connections {
            let mut reply = Message::new(Command::Id, tag_id, 0, 0, payload.clone());
            if hello && target == conn_id {
                let proposed = msg.time_us as usize;
                let tus = proposed.clamp(MIN_TUS, self.max_tus);
                conn.tus.store(tus, Ordering::Relaxed);
                reply.time_us = tus as u64;
                reply.bus_id = conn_id;
            }
            deliveries.push(Delivery {
                conn_id: target,
                tx: conn.tx.clone(),
                message: reply,
            });
        }
        deliveries
    }

    /// SET: store unless stale, then fan out to every subscriber other
    /// than the author. A zero `bus_id` is replaced by the sender's
    /// connection id so peers can filter their own writes.
    fn handle_set(&mut self, conn_id: u16, msg: Message) -> Vec<Delivery> {
        let Some(tag) = self.tags.get_mut(&msg.tag_id) else {
            return self.err_to(conn_id, msg.tag_id, "SET unknown tag");
        };

        if msg.time_us < tag.time_us {
            // Stale write: dropped without comment
            return Vec::new();
        }

        let author = if msg.bus_id == 0 { conn_id } else { msg.bus_id };
        tag.value = msg.payload.clone();
        tag.time_us = msg.time_us;
        tag.author = author;

        let forward = Message::new(Command::Set, msg.tag_id, msg.time_us, author, msg.payload);
        let mut deliveries = Vec::new();
        for &subscriber in &tag.subscribers {
            if subscriber == author {
                continue;
            }
            if let Some(conn) = self.connections.get(&subscriber) {
                deliveries.push(Delivery {
                    conn_id: subscriber,
                    tx: conn.tx.clone(),
                    message: forward.clone(),
                });
            }
        }
        deliveries
    }

    /// GET: directed SET with the stored value, empty when never set
    fn handle_get(&mut self, conn_id: u16, msg: Message) -> Vec<Delivery> {
        let Some(tag) = self.tags.get(&msg.tag_id) else {
            return self.err_to(conn_id, msg.tag_id, "GET unknown tag");
        };
        self.deliver_to(conn_id, tag.snapshot(msg.tag_id))
    }

    /// SUB: join the subscriber set and receive the current value at once
    fn handle_sub(&mut self, conn_id: u16, msg: Message) -> Vec<Delivery> {
        let Some(tag) = self.tags.get_mut(&msg.tag_id) else {
            return self.err_to(conn_id, msg.tag_id, "SUB unknown tag");
        };
        tag.subscribers.insert(conn_id);
        let snapshot = tag.snapshot(msg.tag_id);
        self.deliver_to(conn_id, snapshot)
    }

    /// RTA: forward to the tag's current author, with the requester's
    /// connection id in `bus_id` so the author can address its reply
    fn handle_rta(&mut self, conn_id: u16, msg: Message) -> Vec<Delivery> {
        let Some(tag) = self.tags.get(&msg.tag_id) else {
            return self.err_to(conn_id, msg.tag_id, "RTA unknown tag");
        };
        let author = tag.author;
        if author == 0 {
            return self.err_to(conn_id, msg.tag_id, "RTA tag has no author");
        }
        let Some(conn) = self.connections.get(&author) else {
            debug!(tag = %tag.name, author, "RTA author connection is gone");
            return self.err_to(conn_id, msg.tag_id, "RTA author connection is gone");
        };
        vec![Delivery {
            conn_id: author,
            tx: conn.tx.clone(),
            message: Message::new(Command::Rta, msg.tag_id, msg.time_us, conn_id, msg.payload),
        }]
    }

    /// Address one message at a single connection, used by the network
    /// layer for the ERR that precedes closing a violating connection
    pub(crate) fn direct(&self, conn_id: u16, message: Message) -> Vec<Delivery> {
        self.deliver_to(conn_id, message)
    }

    /// One directed message, if the target still exists
    fn deliver_to(&self, conn_id: u16, message: Message) -> Vec<Delivery> {
        match self.connections.get(&conn_id) {
            Some(conn) => vec![Delivery {
                conn_id,
                tx: conn.tx.clone(),
                message,
            }],
            None => Vec::new(),
        }
    }

    /// Directed ERR with a diagnostic text
    fn err_to(&self, conn_id: u16, tag_id: u16, text: &str) -> Vec<Delivery> {
        debug!(conn_id, tag_id, text, "bus error reply");
        self.deliver_to(
            conn_id,
            Message::new(
                Command::Err,
                tag_id,
                0,
                0,
                Bytes::from(format!("{text} {tag_id}")),
            ),
        )
    }
}
