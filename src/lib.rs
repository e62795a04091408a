#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod position;
pub mod rangeset;
pub mod selector;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at crate root for convenience
pub use crate::config::{KeySharedConfig, KeySharedMode};
pub use crate::dispatch::{
    ConsumerName, ConsumerRegistry, ConsumerState, ConsumerTransport, Cursor, CursorError,
    DispatchError, DispatchHandle, DispatchSignal, Entry, JoinFencePredicate, Ledger, ReadType,
    RedeliveryTracker, SendBatch, SendCompletion, StickyKeyDispatcher, SubscriptionRuntime,
    TransportError, signal_channel,
};
pub use crate::position::{ENTRY_BEFORE_FIRST, Position, PositionRange};
pub use crate::rangeset::PositionRangeSet;
pub use crate::selector::{
    HashRange, KEY_HASH_RANGE_SIZE, SelectorError, StickyKeySelector, sticky_key_hash,
};
