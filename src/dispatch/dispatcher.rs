//! Sticky-key dispatcher: grouping, fencing, admission, and replay
//! scheduling over one subscription.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use crate::config::{KeySharedConfig, KeySharedMode};
use crate::position::Position;
use crate::rangeset::PositionRangeSet;
use crate::selector::{HashRange, SelectorError, StickyKeySelector};

use super::consumer::{ConsumerName, ConsumerRegistry, ConsumerState, ConsumerTransport, SendBatch, TransportError};
use super::cursor::{Cursor, CursorError, Entry, Ledger, ReadType};
use super::redelivery::RedeliveryTracker;
use super::runtime::{DispatchHandle, SendCompletion};

/// Decides whether a joining consumer must be fenced behind the current
/// last-sent position. The default keeps the original heuristic: fence
/// only when more than one entry sits between the first unacknowledged
/// message and the read position.
pub type JoinFencePredicate = Box<dyn Fn(&dyn Cursor) -> bool + Send>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("consumer `{0}` is already registered")]
    DuplicateConsumer(ConsumerName),

    #[error("consumer `{0}` is not registered")]
    UnknownConsumer(ConsumerName),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("position accounting invariant broken: {reason}")]
    Invariant { reason: String },

    #[error("subscription runtime is gone")]
    Terminated,
}

/// Routes entries to competing consumers while keeping each sticky key in
/// position order.
///
/// All methods run on the subscription thread; state is single-owner and
/// never locked. Reads and sends complete asynchronously through
/// [`DispatchHandle`] signals that land back on the same thread.
pub struct StickyKeyDispatcher {
    subscription: String,
    config: KeySharedConfig,
    selector: StickyKeySelector,
    consumers: ConsumerRegistry,
    redelivery: RedeliveryTracker,
    /// Joined-while-in-flight consumers and their fences, in join order.
    /// Fences are non-decreasing along the queue.
    recently_joined: VecDeque<(ConsumerName, Position)>,
    last_sent_position: Option<Position>,
    individually_sent: PositionRangeSet,
    stuck_on_replays: bool,
    have_pending_read: bool,
    pending_send_groups: usize,
    closed: bool,
    cursor: Box<dyn Cursor>,
    ledger: Box<dyn Ledger>,
    handle: DispatchHandle,
    join_fence_predicate: JoinFencePredicate,
}

impl StickyKeyDispatcher {
    pub fn new(
        subscription: impl Into<String>,
        config: KeySharedConfig,
        cursor: Box<dyn Cursor>,
        ledger: Box<dyn Ledger>,
        handle: DispatchHandle,
    ) -> Self {
        let selector = StickyKeySelector::for_config(&config);
        Self {
            subscription: subscription.into(),
            config,
            selector,
            consumers: ConsumerRegistry::new(),
            redelivery: RedeliveryTracker::new(),
            recently_joined: VecDeque::new(),
            last_sent_position: None,
            individually_sent: PositionRangeSet::new(),
            stuck_on_replays: false,
            have_pending_read: false,
            pending_send_groups: 0,
            closed: false,
            cursor,
            ledger,
            handle,
            join_fence_predicate: Box::new(|cursor| cursor.entries_since_first_unacked() > 1),
        }
    }

    pub fn with_join_fence_predicate(mut self, predicate: JoinFencePredicate) -> Self {
        self.join_fence_predicate = predicate;
        self
    }

    /// Registers a consumer with the registry and the selector.
    ///
    /// A selector refusal rolls the registration back and surfaces the
    /// error. On a closed dispatcher the consumer is disconnected and the
    /// call returns cleanly.
    pub fn add_consumer(
        &mut self,
        name: ConsumerName,
        claims: Vec<HashRange>,
        mut transport: Box<dyn ConsumerTransport>,
        max_unacked_messages: u64,
    ) -> Result<(), DispatchError> {
        if self.closed {
            tracing::warn!(
                subscription = %self.subscription,
                consumer = %name,
                "dispatcher is closed, disconnecting joining consumer"
            );
            transport.disconnect();
            return Ok(());
        }
        let state = ConsumerState::new(name.clone(), transport, max_unacked_messages);
        if self.consumers.insert(state).is_err() {
            return Err(DispatchError::DuplicateConsumer(name));
        }
        if let Err(err) = self.selector.add_consumer(&name, &claims) {
            self.consumers.remove(&name);
            return Err(err.into());
        }
        if !self.config.allow_out_of_order_delivery {
            let fence = self
                .update_if_needed_and_get_last_sent()
                .or_else(|| self.cursor.mark_deleted_position());
            if let Some(fence) = fence {
                if let Some(state) = self.consumers.get_mut(&name) {
                    state.transport_mut().on_joined(fence);
                }
                // the first consumer, or a fully acked stream, needs no fence
                if self.consumers.len() > 1 && (self.join_fence_predicate)(self.cursor.as_ref()) {
                    self.recently_joined.push_back((name, fence));
                }
            }
        }
        Ok(())
    }

    /// Unregisters a consumer: selector first, then the registry.
    ///
    /// Removing from the registry moves the consumer's pending acks into
    /// the redelivery tracker; were the selector still routing to it,
    /// those replays would be swallowed by a dead consumer.
    pub fn remove_consumer(&mut self, name: &ConsumerName) -> Result<(), DispatchError> {
        self.selector.remove_consumer(name);
        let Some(mut state) = self.consumers.remove(name) else {
            return Err(DispatchError::UnknownConsumer(name.clone()));
        };
        for (position, hash) in state.take_pending_acks() {
            self.redelivery.add(position, hash);
        }
        if !self.config.allow_out_of_order_delivery {
            self.recently_joined.retain(|(joined, _)| joined != name);
            if self.consumers.len() == 1 {
                self.recently_joined.clear();
            } else if self.consumers.is_empty() {
                // rewind and reset-cursor flows drop every consumer and
                // re-send; stale send tracking would suppress that
                self.last_sent_position = None;
                self.individually_sent.clear();
            }
            let retired = self.retire_recently_joined();
            if retired || !self.redelivery.is_empty() {
                self.read_more_entries();
            }
        }
        Ok(())
    }

    /// Issues the next read: replay candidates first, a normal read
    /// otherwise. Never blocks; at most one read is in flight.
    pub fn read_more_entries(&mut self) {
        if self.closed || self.have_pending_read || self.consumers.is_empty() {
            return;
        }
        let candidates = self.messages_to_replay_now(self.config.replay_batch_size);
        if !candidates.is_empty() {
            let replayable = self.filter_replay_candidates(candidates);
            if !replayable.is_empty() {
                self.have_pending_read = true;
                let completion = self.handle.clone();
                let skipped = self.cursor.async_replay_entries(&replayable, completion);
                for position in skipped {
                    self.redelivery.remove(position);
                }
                return;
            }
        }
        if self.has_consumers_needing_normal_read() {
            self.have_pending_read = true;
            let completion = self.handle.clone();
            self.cursor
                .async_read_entries(self.config.read_batch_size, completion);
        }
    }

    /// Entry point for completed reads of either type.
    pub fn on_entries_read(&mut self, read_type: ReadType, result: Result<Vec<Entry>, CursorError>) {
        self.have_pending_read = false;
        if self.closed {
            return;
        }
        let entries = match result {
            Ok(entries) => entries,
            Err(CursorError::Closed) => {
                tracing::info!(
                    subscription = %self.subscription,
                    "cursor closed, shutting down dispatch"
                );
                self.closed = true;
                return;
            }
            Err(err) => {
                tracing::warn!(
                    subscription = %self.subscription,
                    ?read_type,
                    "read failed, retrying on the next cycle: {err}"
                );
                return;
            }
        };
        match self.try_send_messages(read_type, entries) {
            Ok(true) => self.read_more_entries(),
            Ok(false) => {}
            Err(err) => {
                tracing::error!(
                    subscription = %self.subscription,
                    "terminating dispatch: {err}"
                );
                self.closed = true;
            }
        }
    }

    /// Completion of one consumer's send; once every in-flight send has
    /// completed, the next read is issued.
    pub fn on_send_complete(&mut self, consumer: &ConsumerName, result: Result<(), TransportError>) {
        if self.closed {
            return;
        }
        if let Err(err) = result {
            tracing::warn!(
                subscription = %self.subscription,
                consumer = %consumer,
                "send failed: {err}"
            );
        }
        self.pending_send_groups = self.pending_send_groups.saturating_sub(1);
        if self.pending_send_groups == 0 {
            self.read_more_entries();
        }
    }

    /// The cursor's mark-delete position moved: retire fences it has
    /// passed, drop acknowledged replay candidates, and resume reading.
    pub fn on_mark_delete_advanced(&mut self) {
        if self.closed {
            return;
        }
        if let Some(mark_delete) = self.cursor.mark_deleted_position() {
            self.redelivery.remove_all_up_to(mark_delete);
        }
        if !self.recently_joined.is_empty() && self.retire_recently_joined() {
            self.read_more_entries();
        }
    }

    /// Flow-control credit granted by a consumer.
    pub fn consumer_flow(&mut self, consumer: &ConsumerName, additional_permits: u32) {
        if self.closed {
            return;
        }
        if let Some(state) = self.consumers.get_mut(consumer) {
            state.grant_permits(additional_permits);
        }
        self.read_more_entries();
    }

    /// Transport backpressure toggle; unblocking resumes reading.
    pub fn set_consumer_blocked(&mut self, consumer: &ConsumerName, blocked: bool) {
        if self.closed {
            return;
        }
        if let Some(state) = self.consumers.get_mut(consumer) {
            state.set_blocked(blocked);
        }
        if !blocked {
            self.read_more_entries();
        }
    }

    /// Acknowledgements observed for a consumer's pending messages.
    pub fn on_messages_acked(&mut self, consumer: &ConsumerName, positions: &[Position]) {
        if self.closed {
            return;
        }
        if let Some(state) = self.consumers.get_mut(consumer) {
            state.record_acked(positions);
        }
        self.read_more_entries();
    }

    /// Marks the dispatcher closed before anything else changes; later
    /// signals become no-ops and joining consumers are turned away.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let names: Vec<ConsumerName> = self.consumers.iter().map(|c| c.name().clone()).collect();
        for name in &names {
            if let Some(state) = self.consumers.get_mut(name) {
                state.transport_mut().disconnect();
            }
        }
    }

    fn try_send_messages(
        &mut self,
        read_type: ReadType,
        entries: Vec<Entry>,
    ) -> Result<bool, DispatchError> {
        if entries.is_empty() {
            return Ok(true);
        }
        if self.consumers.is_empty() {
            drop(entries);
            self.cursor.rewind();
            return Ok(false);
        }

        if !self.config.allow_out_of_order_delivery {
            // A deferred position older than this whole batch must reach
            // its consumer first; discard the batch and let the read loop
            // issue the replay.
            if read_type == ReadType::Normal
                && let Some(first_replay) = self.messages_to_replay_now(1).first().copied()
                && first_replay < entries[0].position
            {
                tracing::debug!(
                    subscription = %self.subscription,
                    replay = %first_replay,
                    batch_first = %entries[0].position,
                    "discarding read to preserve order, replay follows"
                );
                for entry in entries {
                    self.redelivery.add(entry.position, entry.sticky_key_hash());
                }
                return Ok(true);
            }

            self.update_if_needed_and_get_last_sent();
            if self.last_sent_position.is_none() && self.cursor.mark_deleted_position().is_some() {
                let individually_sent = &mut self.individually_sent;
                self.last_sent_position =
                    self.cursor.individually_deleted_ranges(&mut |lower, upper| {
                        individually_sent.add_open_closed(
                            lower.ledger_id,
                            lower.entry_id,
                            upper.ledger_id,
                            upper.entry_id,
                        );
                        true
                    });
            }
        }

        let mut grouped: BTreeMap<ConsumerName, Vec<Entry>> = BTreeMap::new();
        let mut hashes_by_consumer: BTreeMap<ConsumerName, BTreeSet<u32>> = BTreeMap::new();
        for entry in entries {
            let hash = entry.sticky_key_hash();
            match self.selector.select(hash) {
                Some(consumer) => {
                    let consumer = consumer.clone();
                    hashes_by_consumer
                        .entry(consumer.clone())
                        .or_default()
                        .insert(hash);
                    grouped.entry(consumer).or_default().push(entry);
                }
                None => {
                    self.redelivery.add(entry.position, hash);
                }
            }
        }

        let group_count = grouped.len();
        let mut total_messages_sent = 0usize;
        let mut groups_in_flight = 0usize;

        for (consumer, group) in grouped {
            let Some(state) = self.consumers.get(&consumer) else {
                for entry in &group {
                    self.redelivery.add(entry.position, entry.sticky_key_hash());
                }
                continue;
            };
            let permits = state.effective_permits();
            let positions: Vec<Position> = group.iter().map(|e| e.position).collect();
            let hashes = hashes_by_consumer.get(&consumer).cloned();
            let take =
                self.restricted_max_entries(&consumer, &positions, permits, read_type, hashes.as_ref());
            tracing::trace!(
                subscription = %self.subscription,
                consumer = %consumer,
                take,
                offered = group.len(),
                ?read_type,
                "admission"
            );

            if take < group.len() {
                for entry in &group[take..] {
                    self.redelivery.add(entry.position, entry.sticky_key_hash());
                }
            }
            if take == 0 {
                continue;
            }
            let mut batch = group;
            batch.truncate(take);

            let mut sent_records = Vec::with_capacity(batch.len());
            for entry in &batch {
                if read_type == ReadType::Replay {
                    self.redelivery.remove(entry.position);
                }
                if !self.config.allow_out_of_order_delivery {
                    let position = entry.position;
                    let above_last_sent =
                        self.last_sent_position.is_none_or(|last| position > last);
                    if above_last_sent
                        && !self
                            .individually_sent
                            .contains(position.ledger_id, position.entry_id)
                    {
                        let previous = self.ledger.previous_position(position);
                        self.individually_sent.add_open_closed(
                            previous.ledger_id,
                            previous.entry_id,
                            position.ledger_id,
                            position.entry_id,
                        );
                    }
                }
                sent_records.push((entry.position, entry.sticky_key_hash()));
            }

            let send = SendBatch::new(batch);
            total_messages_sent += send.total_messages;
            let completion = SendCompletion::new(consumer.clone(), self.handle.clone());
            let Some(state) = self.consumers.get_mut(&consumer) else {
                continue;
            };
            state.record_sent(sent_records);
            state.transport_mut().send_messages(send, completion);
            groups_in_flight += 1;
        }

        if !self.config.allow_out_of_order_delivery {
            self.advance_last_sent_position()?;
        }

        self.pending_send_groups += groups_in_flight;

        if total_messages_sent == 0 && self.recently_joined.is_empty() {
            // Every key in this batch routes to a busy consumer. Move on
            // and read the next batch instead of replaying these entries
            // at the same wall, unless recently-joined consumers are
            // waiting on the mark-delete, where looking ahead only widens
            // the backlog.
            self.stuck_on_replays = true;
            return Ok(true);
        }
        Ok(group_count > 0 && groups_in_flight == 0)
    }

    /// Longest admissible prefix for one consumer: permits, the
    /// redelivery hash fence on normal reads, then the recently-joined
    /// fence (tightened to the oldest fence for replays).
    fn restricted_max_entries(
        &mut self,
        consumer: &ConsumerName,
        positions: &[Position],
        permits: usize,
        read_type: ReadType,
        sticky_hashes: Option<&BTreeSet<u32>>,
    ) -> usize {
        let max_messages = positions.len().min(permits);
        if max_messages == 0 {
            return 0;
        }
        if read_type == ReadType::Normal
            && sticky_hashes
                .is_some_and(|hashes| self.redelivery.contains_sticky_key_hashes(hashes))
        {
            // older entries for one of these keys wait in the redelivery
            // tracker; sending now would reorder the key
            return 0;
        }
        if self.config.allow_out_of_order_delivery {
            return max_messages;
        }
        self.retire_recently_joined();
        let Some(mut fence) = self.recently_joined_fence(consumer) else {
            return max_messages;
        };
        if read_type == ReadType::Replay
            && let Some((_, oldest)) = self.recently_joined.front()
            && *oldest < fence
        {
            // a replayed entry may predate this consumer's join and still
            // belong to an older joiner's in-flight window
            fence = *oldest;
        }
        for (i, position) in positions.iter().take(max_messages).enumerate() {
            if *position > fence {
                return i;
            }
        }
        max_messages
    }

    /// Promotes `last_sent_position` over every individually-sent range
    /// contiguous with it in the durable log, draining the range set.
    fn advance_last_sent_position(&mut self) -> Result<(), DispatchError> {
        let Some(mut last_sent) = self.last_sent_position else {
            return Ok(());
        };
        if let Some(first) = self.individually_sent.first_range()
            && first.upper() <= last_sent
        {
            self.individually_sent.remove_at_most(last_sent);
        }
        let Some(range) = self.individually_sent.first_range() else {
            return Ok(());
        };
        let connected = range.lower() <= last_sent
            || self.ledger.entries_between(last_sent, range.lower()) == 0;
        if !connected {
            return Ok(());
        }
        let mut new_last_sent = range.upper();
        let mut after = self.ledger.next_valid_position(new_last_sent);
        if let Some(last_confirmed) = self.ledger.last_confirmed_entry() {
            // connected ranges can sit in consecutive ledgers, eg
            // (2:10..3:15] stored as (2:10..2:15],(3:-1..3:15]
            while after <= last_confirmed {
                if self
                    .individually_sent
                    .contains(after.ledger_id, after.entry_id)
                {
                    let run = self
                        .individually_sent
                        .range_containing(after.ledger_id, after.entry_id)
                        .ok_or_else(|| DispatchError::Invariant {
                            reason: format!("{after} is contained but has no containing range"),
                        })?;
                    new_last_sent = run.upper();
                    after = self.ledger.next_valid_position(new_last_sent);
                    continue;
                }
                break;
            }
        }
        if last_sent < new_last_sent {
            last_sent = new_last_sent;
            self.last_sent_position = Some(last_sent);
        }
        self.individually_sent.remove_at_most(last_sent);
        Ok(())
    }

    /// Replay candidates for the next read; when the previous cycle got
    /// stuck on replays, yields nothing once so the loop reads forward.
    fn messages_to_replay_now(&mut self, max: usize) -> BTreeSet<Position> {
        if self.stuck_on_replays {
            self.stuck_on_replays = false;
            BTreeSet::new()
        } else {
            self.redelivery.positions_to_replay(max)
        }
    }

    /// Drops replay candidates that would be discarded anyway: unroutable
    /// hashes, consumers without permits, and positions beyond a fence.
    fn filter_replay_candidates(&mut self, src: BTreeSet<Position>) -> BTreeSet<Position> {
        if self.config.allow_out_of_order_delivery || src.is_empty() {
            return src;
        }
        let mut result = BTreeSet::new();
        let mut grouped: BTreeMap<ConsumerName, Vec<Position>> = BTreeMap::new();
        for position in src {
            let Some(hash) = self.redelivery.hash_of(position) else {
                result.insert(position);
                continue;
            };
            if let Some(consumer) = self.selector.select(hash) {
                grouped.entry(consumer.clone()).or_default().push(position);
            }
        }
        for (consumer, positions) in grouped {
            let Some(state) = self.consumers.get(&consumer) else {
                continue;
            };
            let permits = state.effective_permits();
            if permits == 0 {
                continue;
            }
            let take =
                self.restricted_max_entries(&consumer, &positions, permits, ReadType::Replay, None);
            result.extend(positions.into_iter().take(take));
        }
        result
    }

    /// True when some live consumer can take entries from a normal read:
    /// unblocked, unfenced, and holding permits.
    fn has_consumers_needing_normal_read(&self) -> bool {
        self.consumers.iter().any(|c| {
            !c.is_blocked()
                && c.available_permits() > 0
                && (self.config.allow_out_of_order_delivery
                    || self.recently_joined_fence(c.name()).is_none())
        })
    }

    /// Removes fence entries at or below the mark-delete position; the
    /// queue is fence-ordered, so the scan stops at the first survivor.
    fn retire_recently_joined(&mut self) -> bool {
        let Some(mark_delete) = self.cursor.mark_deleted_position() else {
            return false;
        };
        let mut retired = false;
        while let Some((_, fence)) = self.recently_joined.front() {
            if *fence <= mark_delete {
                self.recently_joined.pop_front();
                retired = true;
            } else {
                break;
            }
        }
        retired
    }

    fn update_if_needed_and_get_last_sent(&mut self) -> Option<Position> {
        let last = self.last_sent_position?;
        if let Some(mark_delete) = self.cursor.mark_deleted_position()
            && mark_delete > last
        {
            self.last_sent_position = Some(mark_delete);
        }
        self.last_sent_position
    }

    fn recently_joined_fence(&self, consumer: &ConsumerName) -> Option<Position> {
        self.recently_joined
            .iter()
            .find(|(joined, _)| joined == consumer)
            .map(|(_, fence)| *fence)
    }

    pub fn key_shared_mode(&self) -> KeySharedMode {
        self.config.key_shared_mode
    }

    pub fn allow_out_of_order(&self) -> bool {
        self.config.allow_out_of_order_delivery
    }

    /// Whether this subscription can serve a consumer asking for `other`.
    pub fn matches_policy(&self, other: &KeySharedConfig) -> bool {
        self.config.same_policy(other)
    }

    pub fn consumer_key_hash_ranges(&self) -> BTreeMap<ConsumerName, Vec<HashRange>> {
        self.selector.consumer_key_hash_ranges()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn consumer(&self, name: &ConsumerName) -> Option<&ConsumerState> {
        self.consumers.get(name)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn last_sent_position(&self) -> Option<Position> {
        self.last_sent_position
    }

    pub fn individually_sent_positions(&self) -> &PositionRangeSet {
        &self.individually_sent
    }

    pub fn redelivery_tracker(&self) -> &RedeliveryTracker {
        &self.redelivery
    }

    pub fn recently_joined_consumers(&self) -> Vec<(ConsumerName, Position)> {
        self.recently_joined.iter().cloned().collect()
    }

    pub fn has_pending_read(&self) -> bool {
        self.have_pending_read
    }
}
