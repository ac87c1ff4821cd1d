//! Tags and the per-process tag registry
//!
//! A [`Tag`] is the fundamental unit of state on the bus: a named, typed
//! value with a microsecond timestamp and the identity of the connection
//! that authored it. Tags are singletons by name within a [`Registry`];
//! creating the same name twice hands back the same instance.
//!
//! # Callbacks
//!
//! Change callbacks run synchronously, in registration order, before the
//! change is queued for the bus. A callback that writes its own tag fails
//! with [`TagError::ReentrantSet`]; writing *other* tags from a callback is
//! the normal chaining mechanism. Callbacks must not block and must not
//! panic - a panicking callback poisons the tag's firing guard.
//!
//! # Authorship
//!
//! `bus_id` 0 means "authored in this process, never crossed the bus".
//! Locally authored changes are handed to the attached bus client after
//! callbacks have run; changes that arrived from the bus carry the remote
//! connection's id and are never re-published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::warn;

use tagbus_protocol::{TagKind, TagValue, RTA_ID_KEY};

use crate::error::TagError;

/// Microseconds since the Unix epoch, the bus timestamp convention
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Commands flowing from tags to the attached bus client
#[derive(Debug)]
pub(crate) enum LinkCmd {
    /// A tag was created after the client attached
    Register { name: String },
    /// A locally authored change to publish
    Publish {
        name: String,
        value: TagValue,
        time_us: u64,
    },
    /// An outbound request-to-author
    Rta { name: String, value: TagValue },
}

/// The channel a registry's tags use to reach the bus client
pub(crate) struct Link {
    pub(crate) tx: mpsc::UnboundedSender<LinkCmd>,
    next_rta: AtomicU16,
}

impl Link {
    fn new(tx: mpsc::UnboundedSender<LinkCmd>) -> Self {
        Self {
            tx,
            next_rta: AtomicU16::new(1),
        }
    }

    /// Next requester cookie; 0 is reserved for broadcast replies
    fn next_cookie(&self) -> u16 {
        loop {
            let cookie = self.next_rta.fetch_add(1, Ordering::Relaxed);
            if cookie != 0 {
                return cookie;
            }
        }
    }
}

/// Display and engineering metadata attached from configuration.
///
/// Transported with the tag, never interpreted on the hot path - except
/// `deadband`, which suppresses sub-threshold numeric changes, and the
/// min/max limits which let a change at a limit bypass the deadband.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMeta {
    /// Free-text description
    pub desc: String,
    /// Engineering units, e.g. "m³/s"
    pub units: Option<String>,
    /// Decimal places for display
    pub dp: Option<u32>,
    /// Lower display/engineering limit
    pub min: Option<f64>,
    /// Upper display/engineering limit
    pub max: Option<f64>,
    /// Ordered state labels for int tags
    pub multi: Option<Vec<String>>,
    /// Display format hint
    pub format: Option<String>,
    /// Suppress numeric changes smaller than this
    pub deadband: Option<f64>,
}

/// Handle returned by [`Tag::add_callback`], used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

type ChangeHandler = Arc<dyn Fn(&Tag) + Send + Sync>;
type RtaHandler = Arc<dyn Fn(&Tag, TagValue) + Send + Sync>;

struct CallbackEntry {
    id: u64,
    filter_bus_id: u16,
    handler: ChangeHandler,
}

struct TagState {
    value: Option<TagValue>,
    time_us: u64,
    bus_id: u16,
    /// Set while callbacks for this tag are running
    firing: bool,
    next_callback: u64,
    callbacks: Vec<CallbackEntry>,
    rta_handler: Option<RtaHandler>,
}

struct TagInner {
    name: String,
    kind: TagKind,
    registry: Weak<RegistryInner>,
    wire_id: AtomicU16,
    meta: Mutex<TagMeta>,
    state: Mutex<TagState>,
}

/// A named, typed, bus-distributed value.
///
/// `Tag` is a cheap handle; clones refer to the same underlying state.
#[derive(Clone)]
pub struct Tag {
    inner: Arc<TagInner>,
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("id", &self.id())
            .finish()
    }
}

impl Tag {
    /// Tag name, unique process- and bus-wide
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declared scalar type
    pub fn kind(&self) -> TagKind {
        self.inner.kind
    }

    /// Bus-assigned 16-bit id, 0 until the bus has assigned one
    pub fn id(&self) -> u16 {
        self.inner.wire_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_wire_id(&self, id: u16) {
        self.inner.wire_id.store(id, Ordering::Release);
    }

    /// Current value, `None` until first set
    pub fn value(&self) -> Option<TagValue> {
        self.inner.state.lock().unwrap().value.clone()
    }

    /// Microsecond timestamp of the last accepted set
    pub fn time_us(&self) -> u64 {
        self.inner.state.lock().unwrap().time_us
    }

    /// Connection id that authored the current value; 0 means local
    pub fn bus_id(&self) -> u16 {
        self.inner.state.lock().unwrap().bus_id
    }

    /// Copy of the attached metadata
    pub fn metadata(&self) -> TagMeta {
        self.inner.meta.lock().unwrap().clone()
    }

    /// Attach metadata from configuration
    pub fn set_metadata(&self, meta: TagMeta) -> Result<(), TagError> {
        if meta.deadband.is_some() && !self.inner.kind.is_numeric() {
            return Err(TagError::DeadbandNotNumeric {
                tag: self.inner.name.clone(),
            });
        }
        *self.inner.meta.lock().unwrap() = meta;
        Ok(())
    }

    /// Set the value, stamped with the current time, authored locally
    pub fn set(&self, value: impl Into<TagValue>) -> Result<(), TagError> {
        self.apply(value.into(), now_us(), 0)
    }

    /// Set the value with an explicit timestamp, authored locally
    pub fn set_at(&self, value: impl Into<TagValue>, time_us: u64) -> Result<(), TagError> {
        self.apply(value.into(), time_us, 0)
    }

    /// Set the value as delivered from the bus
    pub fn set_from_bus(
        &self,
        value: TagValue,
        time_us: u64,
        bus_id: u16,
    ) -> Result<(), TagError> {
        self.apply(value, time_us, bus_id)
    }

    /// Register a change callback.
    ///
    /// The handler runs for every accepted change whose authoring bus id
    /// matches `filter_bus_id`, or unconditionally when the filter is 0.
    /// Handlers run in registration order and receive the tag itself.
    pub fn add_callback(
        &self,
        filter_bus_id: u16,
        handler: impl Fn(&Tag) + Send + Sync + 'static,
    ) -> CallbackId {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_callback;
        state.next_callback += 1;
        state.callbacks.push(CallbackEntry {
            id,
            filter_bus_id,
            handler: Arc::new(handler),
        });
        CallbackId(id)
    }

    /// Remove a previously registered change callback
    pub fn remove_callback(&self, id: CallbackId) {
        let mut state = self.inner.state.lock().unwrap();
        state.callbacks.retain(|cb| cb.id != id.0);
    }

    /// Install the request-to-author handler, at most one per tag.
    ///
    /// The process holding the handler is expected to author the tag; the
    /// bus routes RTA messages to whichever connection last set it. The
    /// handler answers by setting the tag's value, which travels back as an
    /// ordinary SET.
    pub fn set_rta_handler(
        &self,
        handler: impl Fn(&Tag, TagValue) + Send + Sync + 'static,
    ) -> Result<(), TagError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.rta_handler.is_some() {
            return Err(TagError::RtaHandlerInstalled {
                tag: self.inner.name.clone(),
            });
        }
        state.rta_handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Remove the request-to-author handler
    pub fn clear_rta_handler(&self) {
        self.inner.state.lock().unwrap().rta_handler = None;
    }

    /// Send a request-to-author for this tag via the attached bus client.
    ///
    /// Mapping-shaped values get a monotonically increasing requester
    /// cookie injected under `"__rta_id__"` unless the caller supplied one;
    /// other kinds are sent untouched. Returns the cookie so the caller can
    /// match the authored reply.
    pub fn rta(&self, value: impl Into<TagValue>) -> Result<u16, TagError> {
        let registry = self.inner.registry.upgrade().ok_or(TagError::NotConnected)?;
        let link = registry.link.get().ok_or(TagError::NotConnected)?;
        let mut cookie = link.next_cookie();

        let value = match value.into() {
            TagValue::Json(serde_json::Value::Object(mut map)) => {
                // A caller-supplied cookie wins; otherwise stamp ours
                match map.get(RTA_ID_KEY).and_then(serde_json::Value::as_u64) {
                    Some(supplied) => cookie = supplied as u16,
                    None => {
                        map.insert(RTA_ID_KEY.to_string(), serde_json::Value::from(cookie));
                    }
                }
                TagValue::Json(serde_json::Value::Object(map))
            }
            other => other,
        };

        link.tx
            .send(LinkCmd::Rta {
                name: self.inner.name.clone(),
                value,
            })
            .map_err(|_| TagError::NotConnected)?;
        Ok(cookie)
    }

    /// Deliver an inbound RTA value to the handler, if one is installed
    pub(crate) fn handle_rta(&self, value: TagValue) {
        let handler = self.inner.state.lock().unwrap().rta_handler.clone();
        match handler {
            Some(handler) => handler(self, value),
            None => warn!(tag = %self.inner.name, "RTA for tag without a handler"),
        }
    }

    /// Core set path: validate, store, fire callbacks, hand to the bus.
    fn apply(&self, value: TagValue, time_us: u64, bus_id: u16) -> Result<(), TagError> {
        let value = self.coerce(value)?;

        let fired = {
            let mut state = self.inner.state.lock().unwrap();
            if state.firing {
                return Err(TagError::ReentrantSet {
                    tag: self.inner.name.clone(),
                });
            }
            // Stale write: older than what we already hold. Silent no-op.
            if time_us < state.time_us {
                return Ok(());
            }
            if self.within_deadband(&state, &value) {
                return Ok(());
            }

            state.value = Some(value.clone());
            state.time_us = time_us;
            state.bus_id = bus_id;

            let fired: Vec<ChangeHandler> = state
                .callbacks
                .iter()
                .filter(|cb| cb.filter_bus_id == 0 || cb.filter_bus_id == bus_id)
                .map(|cb| Arc::clone(&cb.handler))
                .collect();
            state.firing = true;
            fired
        };

        for handler in fired {
            handler(self);
        }
        self.inner.state.lock().unwrap().firing = false;

        // Only locally authored changes leave the process; anything with a
        // non-zero bus_id already crossed the bus once.
        if bus_id == 0 {
            if let Some(registry) = self.inner.registry.upgrade() {
                if let Some(link) = registry.link.get() {
                    let _ = link.tx.send(LinkCmd::Publish {
                        name: self.inner.name.clone(),
                        value,
                        time_us,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate a value against the declared type, with the numeric
    /// widening the reference data model allows.
    fn coerce(&self, value: TagValue) -> Result<TagValue, TagError> {
        match (value, self.inner.kind) {
            (TagValue::Int(i), TagKind::Float) => Ok(TagValue::Float(i as f64)),
            (TagValue::Float(f), TagKind::Int) => {
                warn!(tag = %self.inner.name, "coercing float to int");
                Ok(TagValue::Int(f as i64))
            }
            (value, kind) if value.matches(kind) => Ok(value),
            (value, kind) => Err(TagError::TypeMismatch {
                tag: self.inner.name.clone(),
                declared: kind,
                offered: value.kind_name(),
            }),
        }
    }

    /// True when a numeric change is inside the configured deadband.
    ///
    /// A change landing on the min/max limit always passes, so an operator
    /// sees the limit reached even under a wide deadband.
    fn within_deadband(&self, state: &TagState, value: &TagValue) -> bool {
        let meta = self.inner.meta.lock().unwrap();
        let (Some(deadband), Some(current), Some(new)) = (
            meta.deadband,
            state.value.as_ref().and_then(TagValue::as_f64),
            value.as_f64(),
        ) else {
            return false;
        };
        let at_limit = meta.min.is_some_and(|min| new <= min)
            || meta.max.is_some_and(|max| new >= max);
        !at_limit && (new - current).abs() <= deadband
    }
}

struct RegistryInner {
    tags: Mutex<HashMap<String, Tag>>,
    link: OnceLock<Link>,
}

/// Per-process registry of tag singletons.
///
/// An explicit context object rather than a process global, so tests can
/// run several buses side by side. Clones share the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tags: Mutex::new(HashMap::new()),
                link: OnceLock::new(),
            }),
        }
    }

    /// Get or create the tag `name` with the declared type.
    ///
    /// Returns the existing instance when the name is already registered
    /// with the same type; a different type is a programming error.
    pub fn tag(&self, name: &str, kind: TagKind) -> Result<Tag, TagError> {
        let mut tags = self.inner.tags.lock().unwrap();
        if let Some(existing) = tags.get(name) {
            if existing.kind() != kind {
                return Err(TagError::Redeclared {
                    tag: name.to_string(),
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            return Ok(existing.clone());
        }

        let tag = Tag {
            inner: Arc::new(TagInner {
                name: name.to_string(),
                kind,
                registry: Arc::downgrade(&self.inner),
                wire_id: AtomicU16::new(0),
                meta: Mutex::new(TagMeta::default()),
                state: Mutex::new(TagState {
                    value: None,
                    time_us: 0,
                    bus_id: 0,
                    firing: false,
                    next_callback: 0,
                    callbacks: Vec::new(),
                    rta_handler: None,
                }),
            }),
        };
        tags.insert(name.to_string(), tag.clone());

        // Tell the attached bus client about the late arrival
        if let Some(link) = self.inner.link.get() {
            let _ = link.tx.send(LinkCmd::Register {
                name: name.to_string(),
            });
        }
        Ok(tag)
    }

    /// Look up an existing tag by name
    pub fn get(&self, name: &str) -> Option<Tag> {
        self.inner.tags.lock().unwrap().get(name).cloned()
    }

    /// Snapshot of every registered tag
    pub fn tags(&self) -> Vec<Tag> {
        self.inner.tags.lock().unwrap().values().cloned().collect()
    }

    /// Number of registered tags
    pub fn len(&self) -> usize {
        self.inner.tags.lock().unwrap().len()
    }

    /// True when no tags are registered
    pub fn is_empty(&self) -> bool {
        self.inner.tags.lock().unwrap().is_empty()
    }

    /// Attach the bus client's command channel. Only one client may ever
    /// attach to a registry; returns false if one already has.
    pub(crate) fn attach_link(&self, tx: mpsc::UnboundedSender<LinkCmd>) -> bool {
        self.inner.link.set(Link::new(tx)).is_ok()
    }
}

#[cfg(test)]
#[path = "tag_test.rs"]
mod tag_test;
