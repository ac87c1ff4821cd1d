//! Bounded, coalescing outbound queue
//!
//! The bus is a last-value store, so when the queue backs up only the
//! newest SET per tag matters: a fresh SET replaces any queued one for the
//! same tag, and overflow evicts the oldest queued SET. The latest value
//! for a tag is never the one dropped.
//!
//! Entries for tags whose bus id is still unknown stay queued until the ID
//! reply lands; [`SendQueue::pop_ready`] skips over them.

use std::collections::VecDeque;

use tracing::warn;

use tagbus_protocol::{value_payload, Command, Message, TagValue};

/// One queued outbound item
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A locally authored value, resolved to a tag id at send time
    Set {
        name: String,
        value: TagValue,
        time_us: u64,
    },
    /// A request-to-author, resolved to a tag id at send time
    Rta { name: String, value: TagValue },
    /// A fully formed message (ID, SUB, GET)
    Control(Message),
}

/// Bounded outbound queue with per-tag SET coalescing
pub(crate) struct SendQueue {
    entries: VecDeque<Outbound>,
    capacity: usize,
    dropped: u64,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue a SET, replacing any queued SET for the same tag
    pub(crate) fn push_set(&mut self, name: String, value: TagValue, time_us: u64) {
        let queued = self.entries.iter().position(|entry| match entry {
            Outbound::Set { name: queued, .. } => *queued == name,
            _ => false,
        });
        if let Some(index) = queued {
            self.entries[index] = Outbound::Set {
                name,
                value,
                time_us,
            };
            return;
        }
        self.push(Outbound::Set {
            name,
            value,
            time_us,
        });
    }

    /// Queue any outbound item, evicting on overflow
    pub(crate) fn push(&mut self, item: Outbound) {
        self.entries.push_back(item);
        if self.entries.len() <= self.capacity {
            return;
        }

        // Evict the oldest SET, but never the entry just pushed; control
        // messages only go as a last resort.
        let last = self.entries.len() - 1;
        let victim = self
            .entries
            .iter()
            .take(last)
            .position(|entry| matches!(entry, Outbound::Set { .. }))
            .unwrap_or(0);
        if let Some(evicted) = self.entries.remove(victim) {
            self.dropped += 1;
            warn!(?evicted, "outbound queue full, dropping oldest entry");
        }
    }

    /// Take the first entry whose tag id is known, as a wire message.
    ///
    /// `resolve` maps a tag name to its bus id; entries that do not resolve
    /// yet are left queued in place.
    pub(crate) fn pop_ready(
        &mut self,
        resolve: impl Fn(&str) -> Option<u16>,
    ) -> Option<Message> {
        let index = self.entries.iter().position(|entry| match entry {
            Outbound::Control(_) => true,
            Outbound::Set { name, .. } | Outbound::Rta { name, .. } => resolve(name).is_some(),
        })?;

        match self.entries.remove(index)? {
            Outbound::Control(message) => Some(message),
            Outbound::Set {
                name,
                value,
                time_us,
            } => {
                let tag_id = resolve(&name)?;
                Some(Message::new(
                    Command::Set,
                    tag_id,
                    time_us,
                    0,
                    value_payload(&value),
                ))
            }
            Outbound::Rta { name, value } => {
                let tag_id = resolve(&name)?;
                Some(Message::new(
                    Command::Rta,
                    tag_id,
                    0,
                    0,
                    value_payload(&value),
                ))
            }
        }
    }

    /// Entries waiting, ready or not
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total entries evicted on overflow since creation
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}
