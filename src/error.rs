use thiserror::Error;

use crate::dispatch::{CursorError, DispatchError, TransportError};
use crate::selector::SelectorError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry on a later read cycle may help.
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; callers that care about one
/// boundary should match on that boundary's error directly.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // bad claims, duplicate registrations, broken invariants:
            // resubmitting the same call cannot succeed
            Error::Selector(_) => Transience::Permanent,
            Error::Dispatch(DispatchError::Invariant { .. }) => Transience::Permanent,
            Error::Dispatch(DispatchError::DuplicateConsumer(_)) => Transience::Permanent,
            Error::Dispatch(DispatchError::Selector(_)) => Transience::Permanent,
            Error::Dispatch(DispatchError::UnknownConsumer(_)) => Transience::Permanent,
            Error::Dispatch(DispatchError::Terminated) => Transience::Permanent,
            Error::Cursor(CursorError::Closed) => Transience::Permanent,
            // the next read cycle retries these
            Error::Cursor(CursorError::NotReady) => Transience::Retryable,
            Error::Cursor(CursorError::ReadFailed { .. }) => Transience::Retryable,
            Error::Transport(_) => Transience::Retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ConsumerName;

    #[test]
    fn transport_failures_are_retryable() {
        let err = Error::from(TransportError {
            consumer: ConsumerName::new("c1"),
            reason: "broken pipe".into(),
        });
        assert!(err.transience().is_retryable());
    }

    #[test]
    fn invariant_violations_are_permanent() {
        let err = Error::from(DispatchError::Invariant {
            reason: "probe".into(),
        });
        assert_eq!(err.transience(), Transience::Permanent);
    }

    #[test]
    fn cursor_close_is_permanent_but_read_failures_retry() {
        assert_eq!(
            Error::from(CursorError::Closed).transience(),
            Transience::Permanent
        );
        assert!(
            Error::from(CursorError::ReadFailed {
                reason: "io".into()
            })
            .transience()
            .is_retryable()
        );
    }
}
