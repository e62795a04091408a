//! Mock ledger, cursor, and transport rig for dispatcher tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Receiver;

use keystream::{
    ConsumerName, ConsumerTransport, Cursor, DispatchHandle, DispatchSignal, Entry, HashRange,
    KeySharedConfig, Ledger, Position, ReadType, SendBatch, SendCompletion, StickyKeyDispatcher,
    sticky_key_hash, signal_channel,
};

/// Durable log with contiguous entries `0..=last` per ledger id.
#[derive(Clone, Debug)]
pub struct ScriptedLedger {
    last_entry: BTreeMap<u64, i64>,
}

impl ScriptedLedger {
    pub fn new(last_entry: impl IntoIterator<Item = (u64, i64)>) -> Self {
        Self {
            last_entry: last_entry.into_iter().collect(),
        }
    }

    fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        self.last_entry
            .iter()
            .flat_map(|(&ledger, &last)| (0..=last).map(move |entry| Position::new(ledger, entry)))
    }
}

impl Ledger for ScriptedLedger {
    fn previous_position(&self, p: Position) -> Position {
        if p.entry_id > 0 {
            return Position::new(p.ledger_id, p.entry_id - 1);
        }
        match self.last_entry.range(..p.ledger_id).next_back() {
            Some((&ledger, &last)) => Position::new(ledger, last),
            None => Position::before_first(p.ledger_id),
        }
    }

    fn next_valid_position(&self, p: Position) -> Position {
        match self.last_entry.get(&p.ledger_id) {
            Some(&last) if p.entry_id < last => Position::new(p.ledger_id, p.entry_id + 1),
            _ => match self.last_entry.range(p.ledger_id + 1..).next() {
                Some((&ledger, _)) => Position::new(ledger, 0),
                None => Position::new(p.ledger_id, p.entry_id + 1),
            },
        }
    }

    fn last_confirmed_entry(&self) -> Option<Position> {
        self.last_entry
            .iter()
            .next_back()
            .map(|(&ledger, &last)| Position::new(ledger, last))
    }

    fn entries_between(&self, lower_open: Position, upper_closed: Position) -> u64 {
        self.positions()
            .filter(|p| *p > lower_open && *p <= upper_closed)
            .count() as u64
    }
}

#[derive(Debug, Default)]
pub struct CursorScript {
    pub mark_delete: Option<Position>,
    pub individually_acked: Vec<(Position, Position)>,
    pub entries_since_first_unacked: u64,
    pub scripted_reads: VecDeque<Vec<Entry>>,
    pub read_requests: Vec<usize>,
    pub replay_requests: Vec<BTreeSet<Position>>,
    pub unreplayable: BTreeSet<Position>,
    pub rewound: usize,
}

/// Cursor double with shared interior state; clone one half into the
/// dispatcher and keep the other for scripting and assertions.
#[derive(Clone, Default)]
pub struct MockCursor {
    state: Arc<Mutex<CursorScript>>,
}

impl MockCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mark_delete(mark_delete: Position) -> Self {
        let cursor = Self::new();
        cursor.script().mark_delete = Some(mark_delete);
        cursor
    }

    pub fn script(&self) -> MutexGuard<'_, CursorScript> {
        self.state.lock().expect("cursor script lock")
    }

    pub fn set_mark_delete(&self, mark_delete: Position) {
        self.script().mark_delete = Some(mark_delete);
    }

    pub fn push_read(&self, entries: Vec<Entry>) {
        self.script().scripted_reads.push_back(entries);
    }

    pub fn read_request_count(&self) -> usize {
        self.script().read_requests.len()
    }

    pub fn replay_requests(&self) -> Vec<BTreeSet<Position>> {
        self.script().replay_requests.clone()
    }

    pub fn rewound(&self) -> usize {
        self.script().rewound
    }
}

impl Cursor for MockCursor {
    fn async_read_entries(&mut self, max_entries: usize, completion: DispatchHandle) {
        let batch = {
            let mut script = self.script();
            script.read_requests.push(max_entries);
            script.scripted_reads.pop_front()
        };
        if let Some(entries) = batch {
            completion.entries_read(ReadType::Normal, Ok(entries));
        }
    }

    fn async_replay_entries(
        &mut self,
        positions: &BTreeSet<Position>,
        _completion: DispatchHandle,
    ) -> BTreeSet<Position> {
        let mut script = self.script();
        script.replay_requests.push(positions.clone());
        positions.intersection(&script.unreplayable).copied().collect()
    }

    fn mark_deleted_position(&self) -> Option<Position> {
        self.script().mark_delete
    }

    fn individually_deleted_ranges(
        &self,
        visit: &mut dyn FnMut(Position, Position) -> bool,
    ) -> Option<Position> {
        let script = self.script();
        for (lower, upper) in &script.individually_acked {
            if !visit(*lower, *upper) {
                break;
            }
        }
        script.mark_delete
    }

    fn entries_since_first_unacked(&self) -> u64 {
        self.script().entries_since_first_unacked
    }

    fn rewind(&mut self) {
        self.script().rewound += 1;
    }
}

#[derive(Default)]
pub struct TransportLog {
    pub batches: Vec<Vec<Position>>,
    pub pending: Vec<SendCompletion>,
    pub disconnected: bool,
    pub joined_at: Option<Position>,
}

/// Transport double recording batches; completions are held until the
/// test resolves them (or resolved inline with `auto_complete`).
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportLog>>,
    auto_complete: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportLog::default())),
            auto_complete: false,
        }
    }

    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::new()
        }
    }

    pub fn log(&self) -> MutexGuard<'_, TransportLog> {
        self.state.lock().expect("transport log lock")
    }

    pub fn batches(&self) -> Vec<Vec<Position>> {
        self.log().batches.clone()
    }

    pub fn delivered(&self) -> Vec<Position> {
        self.log().batches.iter().flatten().copied().collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.log().disconnected
    }

    pub fn joined_at(&self) -> Option<Position> {
        self.log().joined_at
    }

    pub fn complete_all(&self) {
        let pending: Vec<SendCompletion> = self.log().pending.drain(..).collect();
        for completion in pending {
            completion.done(Ok(()));
        }
    }
}

impl ConsumerTransport for MockTransport {
    fn send_messages(&mut self, batch: SendBatch, completion: SendCompletion) {
        let mut log = self.log();
        log.batches
            .push(batch.entries.iter().map(|e| e.position).collect());
        if self.auto_complete {
            drop(log);
            completion.done(Ok(()));
        } else {
            log.pending.push(completion);
        }
    }

    fn disconnect(&mut self) {
        self.log().disconnected = true;
    }

    fn on_joined(&mut self, fence: Position) {
        self.log().joined_at = Some(fence);
    }
}

/// Dispatcher plus its collaborators, driven directly on the test thread.
pub struct Rig {
    pub dispatcher: StickyKeyDispatcher,
    pub signals: Receiver<DispatchSignal>,
    pub cursor: MockCursor,
}

impl Rig {
    pub fn new(config: KeySharedConfig, ledger: ScriptedLedger, cursor: MockCursor) -> Self {
        let (handle, signals) = signal_channel();
        let dispatcher = StickyKeyDispatcher::new(
            "test-sub",
            config,
            Box::new(cursor.clone()),
            Box::new(ledger),
            handle,
        );
        Self {
            dispatcher,
            signals,
            cursor,
        }
    }

    pub fn add_consumer(&mut self, name: &str, transport: &MockTransport, permits: u32) {
        self.dispatcher
            .add_consumer(
                ConsumerName::new(name),
                Vec::new(),
                Box::new(transport.clone()),
                0,
            )
            .expect("add consumer");
        if permits > 0 {
            self.dispatcher
                .consumer_flow(&ConsumerName::new(name), permits);
        }
    }

    pub fn add_consumer_with_claims(
        &mut self,
        name: &str,
        claims: Vec<HashRange>,
        transport: &MockTransport,
        permits: u32,
    ) {
        self.dispatcher
            .add_consumer(
                ConsumerName::new(name),
                claims,
                Box::new(transport.clone()),
                0,
            )
            .expect("add consumer");
        if permits > 0 {
            self.dispatcher
                .consumer_flow(&ConsumerName::new(name), permits);
        }
    }

    /// Feeds every queued signal back into the dispatcher, in order.
    pub fn pump(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                DispatchSignal::EntriesRead { read_type, result } => {
                    self.dispatcher.on_entries_read(read_type, result);
                }
                DispatchSignal::SendComplete { consumer, result } => {
                    self.dispatcher.on_send_complete(&consumer, result);
                }
                DispatchSignal::MarkDeleteAdvanced => self.dispatcher.on_mark_delete_advanced(),
                DispatchSignal::ConsumerFlow { consumer, permits } => {
                    self.dispatcher.consumer_flow(&consumer, permits);
                }
                DispatchSignal::MessagesAcked { consumer, positions } => {
                    self.dispatcher.on_messages_acked(&consumer, &positions);
                }
                DispatchSignal::AddConsumer { .. } | DispatchSignal::RemoveConsumer { .. } => {}
                DispatchSignal::ReadMore => self.dispatcher.read_more_entries(),
                DispatchSignal::Close => self.dispatcher.close(),
            }
        }
    }
}

pub fn entry(ledger: u64, entry_id: i64, key: &str) -> Entry {
    Entry::new(
        Position::new(ledger, entry_id),
        key.as_bytes().to_vec(),
        format!("payload-{ledger}-{entry_id}").into_bytes(),
    )
}

/// Finds a key whose sticky hash lands inside `range`; keys are searched
/// deterministically so tests stay stable.
pub fn key_in_range(range: &HashRange) -> String {
    (0u32..)
        .map(|i| format!("key-{i}"))
        .find(|key| range.contains(sticky_key_hash(key.as_bytes())))
        .expect("key search space exhausted")
}

pub fn position(ledger: u64, entry_id: i64) -> Position {
    Position::new(ledger, entry_id)
}

pub fn name(consumer: &str) -> ConsumerName {
    ConsumerName::new(consumer)
}
