//! Consumer flow-control state and the join-ordered registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::Position;

use super::cursor::Entry;
use super::runtime::SendCompletion;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerName(String);

impl ConsumerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConsumerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsumerName({})", self.0)
    }
}

impl fmt::Display for ConsumerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One dispatched batch, in position order.
#[derive(Clone, Debug)]
pub struct SendBatch {
    pub entries: Vec<Entry>,
    pub total_messages: usize,
    pub total_bytes: usize,
}

impl SendBatch {
    pub fn new(entries: Vec<Entry>) -> Self {
        let total_messages = entries.len();
        let total_bytes = entries.iter().map(|e| e.payload.len()).sum();
        Self {
            entries,
            total_messages,
            total_bytes,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("send to consumer `{consumer}` failed: {reason}")]
pub struct TransportError {
    pub consumer: ConsumerName,
    pub reason: String,
}

/// Outbound edge towards one consumer.
///
/// `send_messages` must not block; completion is signalled exactly once,
/// possibly from another thread, and hops back onto the subscription
/// thread through the handle inside [`SendCompletion`].
pub trait ConsumerTransport: Send {
    fn send_messages(&mut self, batch: SendBatch, completion: SendCompletion);

    /// Called when the dispatcher turns the consumer away (for example a
    /// join offered to a closed dispatcher).
    fn disconnect(&mut self) {}

    /// Tells the consumer the position up to which the stream had already
    /// been handed out when it joined.
    fn on_joined(&mut self, _fence: Position) {}
}

pub struct ConsumerState {
    name: ConsumerName,
    transport: Box<dyn ConsumerTransport>,
    available_permits: i64,
    unacked_messages: u64,
    max_unacked_messages: u64,
    blocked: bool,
    pending_acks: BTreeMap<Position, u32>,
}

impl ConsumerState {
    pub fn new(
        name: ConsumerName,
        transport: Box<dyn ConsumerTransport>,
        max_unacked_messages: u64,
    ) -> Self {
        Self {
            name,
            transport,
            available_permits: 0,
            unacked_messages: 0,
            max_unacked_messages,
            blocked: false,
            pending_acks: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &ConsumerName {
        &self.name
    }

    pub fn available_permits(&self) -> i64 {
        self.available_permits
    }

    pub fn unacked_messages(&self) -> u64 {
        self.unacked_messages
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    /// Dispatch credit: flow permits capped by the unacked headroom.
    /// `max_unacked_messages == 0` means the cap is off.
    pub fn effective_permits(&self) -> usize {
        let mut permits = self.available_permits.max(0);
        if self.max_unacked_messages > 0 {
            let headroom = self.max_unacked_messages.saturating_sub(self.unacked_messages);
            permits = permits.min(headroom as i64);
        }
        permits as usize
    }

    pub fn grant_permits(&mut self, permits: u32) {
        self.available_permits += i64::from(permits);
    }

    /// Accounts for a dispatched batch: burns permits, raises the unacked
    /// count, and remembers each position until it is acknowledged.
    pub fn record_sent(&mut self, sent: impl IntoIterator<Item = (Position, u32)>) {
        for (position, hash) in sent {
            self.available_permits -= 1;
            self.unacked_messages += 1;
            self.pending_acks.insert(position, hash);
        }
    }

    /// Clears acknowledged positions; unknown positions are ignored.
    pub fn record_acked(&mut self, positions: &[Position]) {
        for position in positions {
            if self.pending_acks.remove(position).is_some() {
                self.unacked_messages = self.unacked_messages.saturating_sub(1);
            }
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub(crate) fn take_pending_acks(&mut self) -> BTreeMap<Position, u32> {
        self.unacked_messages = 0;
        std::mem::take(&mut self.pending_acks)
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn ConsumerTransport {
        self.transport.as_mut()
    }
}

impl fmt::Debug for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerState")
            .field("name", &self.name)
            .field("available_permits", &self.available_permits)
            .field("unacked_messages", &self.unacked_messages)
            .field("max_unacked_messages", &self.max_unacked_messages)
            .field("blocked", &self.blocked)
            .field("pending_acks", &self.pending_acks.len())
            .finish()
    }
}

/// Live consumers in join order.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    join_order: Vec<ConsumerName>,
    states: BTreeMap<ConsumerName, ConsumerState>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer; hands the state back when the name is taken.
    pub fn insert(&mut self, state: ConsumerState) -> Result<(), ConsumerState> {
        if self.states.contains_key(state.name()) {
            return Err(state);
        }
        self.join_order.push(state.name().clone());
        self.states.insert(state.name().clone(), state);
        Ok(())
    }

    pub fn remove(&mut self, name: &ConsumerName) -> Option<ConsumerState> {
        let state = self.states.remove(name)?;
        self.join_order.retain(|n| n != name);
        Some(state)
    }

    pub fn get(&self, name: &ConsumerName) -> Option<&ConsumerState> {
        self.states.get(name)
    }

    pub fn get_mut(&mut self, name: &ConsumerName) -> Option<&mut ConsumerState> {
        self.states.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.join_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.join_order.is_empty()
    }

    /// Consumers in the order they joined.
    pub fn iter(&self) -> impl Iterator<Item = &ConsumerState> {
        self.join_order.iter().filter_map(|name| self.states.get(name))
    }
}
