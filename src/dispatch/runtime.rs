//! Per-subscription ordered executor.
//!
//! One worker thread owns the dispatcher and drains a signal channel in
//! arrival order, so every mutation of dispatch state happens on that
//! thread. Cursors and transports get a [`DispatchHandle`] and hop their
//! completions back through it.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::KeySharedConfig;
use crate::position::Position;
use crate::selector::HashRange;

use super::consumer::{ConsumerName, ConsumerTransport, TransportError};
use super::cursor::{Cursor, CursorError, Entry, Ledger, ReadType};
use super::dispatcher::{DispatchError, StickyKeyDispatcher};

/// One unit of work for the subscription thread.
pub enum DispatchSignal {
    EntriesRead {
        read_type: ReadType,
        result: Result<Vec<Entry>, CursorError>,
    },
    SendComplete {
        consumer: ConsumerName,
        result: Result<(), TransportError>,
    },
    MarkDeleteAdvanced,
    ConsumerFlow {
        consumer: ConsumerName,
        permits: u32,
    },
    MessagesAcked {
        consumer: ConsumerName,
        positions: Vec<Position>,
    },
    AddConsumer {
        name: ConsumerName,
        claims: Vec<HashRange>,
        transport: Box<dyn ConsumerTransport>,
        max_unacked_messages: u64,
        reply: Sender<Result<(), DispatchError>>,
    },
    RemoveConsumer {
        name: ConsumerName,
        reply: Sender<Result<(), DispatchError>>,
    },
    ReadMore,
    Close,
}

/// Cloneable sender half of the subscription channel.
///
/// Sends never block; a send after the runtime is gone is dropped, which
/// makes late completions of a closed subscription no-ops.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<DispatchSignal>,
}

impl DispatchHandle {
    pub fn entries_read(&self, read_type: ReadType, result: Result<Vec<Entry>, CursorError>) {
        self.send(DispatchSignal::EntriesRead { read_type, result });
    }

    pub fn send_complete(&self, consumer: ConsumerName, result: Result<(), TransportError>) {
        self.send(DispatchSignal::SendComplete { consumer, result });
    }

    pub fn mark_delete_advanced(&self) {
        self.send(DispatchSignal::MarkDeleteAdvanced);
    }

    pub fn consumer_flow(&self, consumer: ConsumerName, permits: u32) {
        self.send(DispatchSignal::ConsumerFlow { consumer, permits });
    }

    pub fn messages_acked(&self, consumer: ConsumerName, positions: Vec<Position>) {
        self.send(DispatchSignal::MessagesAcked { consumer, positions });
    }

    pub fn read_more(&self) {
        self.send(DispatchSignal::ReadMore);
    }

    pub fn send(&self, signal: DispatchSignal) {
        let _ = self.tx.send(signal);
    }
}

/// Builds a detached signal channel, for embedding the dispatcher in a
/// caller-owned loop or driving it directly in tests.
pub fn signal_channel() -> (DispatchHandle, Receiver<DispatchSignal>) {
    let (tx, rx) = channel::unbounded();
    (DispatchHandle { tx }, rx)
}

/// Completion token for one consumer send; must be resolved exactly once.
pub struct SendCompletion {
    consumer: ConsumerName,
    handle: DispatchHandle,
}

impl SendCompletion {
    pub fn new(consumer: ConsumerName, handle: DispatchHandle) -> Self {
        Self { consumer, handle }
    }

    pub fn consumer(&self) -> &ConsumerName {
        &self.consumer
    }

    pub fn done(self, result: Result<(), TransportError>) {
        self.handle.send_complete(self.consumer, result);
    }
}

/// Owns the subscription thread; dropping it closes the dispatcher and
/// joins the worker.
pub struct SubscriptionRuntime {
    handle: DispatchHandle,
    worker: Option<JoinHandle<()>>,
}

impl SubscriptionRuntime {
    pub fn spawn(
        subscription: impl Into<String>,
        config: KeySharedConfig,
        cursor: Box<dyn Cursor>,
        ledger: Box<dyn Ledger>,
    ) -> Self {
        let (handle, rx) = signal_channel();
        let dispatcher =
            StickyKeyDispatcher::new(subscription, config, cursor, ledger, handle.clone());
        let worker = thread::spawn(move || run_loop(dispatcher, rx));
        Self {
            handle,
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Registers a consumer and waits for the dispatcher's verdict.
    pub fn add_consumer(
        &self,
        name: ConsumerName,
        claims: Vec<HashRange>,
        transport: Box<dyn ConsumerTransport>,
        max_unacked_messages: u64,
    ) -> Result<(), DispatchError> {
        let (reply, verdict) = channel::bounded(1);
        self.handle.send(DispatchSignal::AddConsumer {
            name,
            claims,
            transport,
            max_unacked_messages,
            reply,
        });
        verdict.recv().unwrap_or(Err(DispatchError::Terminated))
    }

    pub fn remove_consumer(&self, name: ConsumerName) -> Result<(), DispatchError> {
        let (reply, verdict) = channel::bounded(1);
        self.handle
            .send(DispatchSignal::RemoveConsumer { name, reply });
        verdict.recv().unwrap_or(Err(DispatchError::Terminated))
    }

    pub fn close(self) {}
}

impl Drop for SubscriptionRuntime {
    fn drop(&mut self) {
        self.handle.send(DispatchSignal::Close);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!("subscription worker panicked");
        }
    }
}

fn run_loop(mut dispatcher: StickyKeyDispatcher, signals: Receiver<DispatchSignal>) {
    while let Ok(signal) = signals.recv() {
        match signal {
            DispatchSignal::EntriesRead { read_type, result } => {
                dispatcher.on_entries_read(read_type, result);
            }
            DispatchSignal::SendComplete { consumer, result } => {
                dispatcher.on_send_complete(&consumer, result);
            }
            DispatchSignal::MarkDeleteAdvanced => dispatcher.on_mark_delete_advanced(),
            DispatchSignal::ConsumerFlow { consumer, permits } => {
                dispatcher.consumer_flow(&consumer, permits);
            }
            DispatchSignal::MessagesAcked { consumer, positions } => {
                dispatcher.on_messages_acked(&consumer, &positions);
            }
            DispatchSignal::AddConsumer {
                name,
                claims,
                transport,
                max_unacked_messages,
                reply,
            } => {
                let _ = reply.send(dispatcher.add_consumer(
                    name,
                    claims,
                    transport,
                    max_unacked_messages,
                ));
            }
            DispatchSignal::RemoveConsumer { name, reply } => {
                let _ = reply.send(dispatcher.remove_consumer(&name));
            }
            DispatchSignal::ReadMore => dispatcher.read_more_entries(),
            DispatchSignal::Close => {
                dispatcher.close();
                break;
            }
        }
    }
}
