use thiserror::Error;

use crate::graph::EngineError;

/// Errors returned by splice requests.
///
/// On the direct path these reach the caller.  On the blocking path they are
/// only observable through [`SpliceObserver::splice_failed`] and the log.
///
/// [`SpliceObserver::splice_failed`]: crate::capability::SpliceObserver::splice_failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpliceError {
    #[error("backend does not support {0} splicing")]
    Unsupported(&'static str),

    #[error("{0} is already part of a graph")]
    AlreadyAttached(String),

    #[error("{0} is not attached to this fixture")]
    NotAttached(String),

    #[error("{node} has no {pad} pad")]
    MissingPad { node: String, pad: &'static str },

    #[error("fixture {fixture} is not a {expected} fixture")]
    WrongFixture {
        fixture: String,
        expected: &'static str,
    },

    #[error("fixture {0} has no upstream link")]
    Detached(String),

    #[error("fixture {0} is inconsistent and refuses further splices")]
    Inconsistent(String),

    #[error("block request for {0} was dropped by the engine")]
    Abandoned(String),

    #[error("splice coordinator has shut down")]
    CoordinatorGone,

    #[error(transparent)]
    Engine(#[from] EngineError),
}
