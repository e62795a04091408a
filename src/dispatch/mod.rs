//! Sticky-key dispatch: consumers, redelivery, the cursor seam, the
//! dispatcher itself, and the per-subscription runtime.

pub mod consumer;
pub mod cursor;
pub mod dispatcher;
pub mod redelivery;
pub mod runtime;

pub use consumer::{
    ConsumerName, ConsumerRegistry, ConsumerState, ConsumerTransport, SendBatch, TransportError,
};
pub use cursor::{Cursor, CursorError, Entry, Ledger, ReadType};
pub use dispatcher::{DispatchError, JoinFencePredicate, StickyKeyDispatcher};
pub use redelivery::RedeliveryTracker;
pub use runtime::{
    DispatchHandle, DispatchSignal, SendCompletion, SubscriptionRuntime, signal_channel,
};
