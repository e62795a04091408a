//! Cursor and ledger seams consumed by the dispatcher.

use std::collections::BTreeSet;

use bytes::Bytes;
use thiserror::Error;

use crate::position::Position;
use crate::selector::sticky_key_hash;

use super::runtime::DispatchHandle;

/// Whether a batch came from a fresh cursor read or a replay of
/// previously deferred positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadType {
    Normal,
    Replay,
}

/// An atomic unit of the log. Payload and key are refcounted; releasing
/// an entry is dropping it.
#[derive(Clone, Debug)]
pub struct Entry {
    pub position: Position,
    pub sticky_key: Bytes,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(position: Position, sticky_key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            position,
            sticky_key: sticky_key.into(),
            payload: payload.into(),
        }
    }

    pub fn sticky_key_hash(&self) -> u32 {
        sticky_key_hash(&self.sticky_key)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is closed")]
    Closed,

    #[error("cursor has no mark-delete position yet")]
    NotReady,

    #[error("cursor read failed: {reason}")]
    ReadFailed { reason: String },
}

/// Subscription cursor over the durable log.
///
/// Reads and replays complete asynchronously: the implementation delivers
/// the batch through the supplied handle, which enqueues it onto the
/// subscription thread. The remaining operations answer from the
/// cursor's own state and must not block.
pub trait Cursor: Send {
    /// Requests up to `max_entries` entries past the read position,
    /// delivered as a [`ReadType::Normal`] batch.
    fn async_read_entries(&mut self, max_entries: usize, completion: DispatchHandle);

    /// Schedules a replay read for `positions`, delivered as a
    /// [`ReadType::Replay`] batch. Returns the subset that can no longer
    /// be replayed (already acknowledged).
    fn async_replay_entries(
        &mut self,
        positions: &BTreeSet<Position>,
        completion: DispatchHandle,
    ) -> BTreeSet<Position>;

    /// Highest position such that every entry at or below it is
    /// acknowledged, or `None` when the cursor cannot tell.
    fn mark_deleted_position(&self) -> Option<Position>;

    /// Visits the individually-acknowledged gaps above the mark-delete
    /// position as `(open lower, closed upper)` pairs, ascending, stopping
    /// early when the visitor returns `false`. Returns the mark-delete
    /// position the gaps are relative to.
    fn individually_deleted_ranges(
        &self,
        visit: &mut dyn FnMut(Position, Position) -> bool,
    ) -> Option<Position>;

    /// Entries between the first unacknowledged message and the read
    /// position; input to the join-fence heuristic.
    fn entries_since_first_unacked(&self) -> u64;

    /// Moves the read position back to the mark-delete position.
    fn rewind(&mut self);
}

/// Navigation over the durable log backing the cursor.
pub trait Ledger: Send {
    /// The valid position immediately before `p`; at a ledger's first
    /// entry this is the previous ledger's last entry, or the open-lower
    /// sentinel when there is none.
    fn previous_position(&self, p: Position) -> Position;

    /// The valid position immediately after `p`, hopping to the next
    /// ledger's entry 0 past the end of a ledger.
    fn next_valid_position(&self, p: Position) -> Position;

    /// Highest durable position, or `None` for an empty log.
    fn last_confirmed_entry(&self) -> Option<Position>;

    /// Number of durable entries in `(lower, upper]`.
    fn entries_between(&self, lower_open: Position, upper_closed: Position) -> u64;
}
