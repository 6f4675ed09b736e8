//! Capability interfaces and splice notifications.
//!
//! A player backend declares what it can splice by returning the matching
//! trait object from [`SpliceBackend`].  The free functions here check the
//! capability before any splice operation exists, so an unsupported request
//! never touches the graph.
//!
//! Observers receive `inserted` / `pre-remove` per kind plus `splice-failed`.
//! [`ChannelObserver`] turns those callbacks into [`SpliceEvent`]s on a tokio
//! channel.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::graph::Element;
use crate::splice::{SpliceError, SpliceKind, SpliceStatus};

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Serial filter insertion and removal.
pub trait FilterSplice: Send + Sync {
    fn add_filter(&self, element: &Element) -> Result<SpliceStatus, SpliceError>;
    fn remove_filter(&self, element: &Element) -> Result<SpliceStatus, SpliceError>;
}

/// Tee branch attachment and detachment.
pub trait TeeSplice: Send + Sync {
    fn add_branch(&self, element: &Element) -> Result<SpliceStatus, SpliceError>;
    fn remove_branch(&self, element: &Element) -> Result<SpliceStatus, SpliceError>;
}

/// What a backend supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub filter: bool,
    pub tee: bool,
}

/// A player backend, queried for its splice capabilities.
pub trait SpliceBackend: Send + Sync {
    fn filter_splice(&self) -> Option<&dyn FilterSplice> {
        None
    }

    fn tee_splice(&self) -> Option<&dyn TeeSplice> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            filter: self.filter_splice().is_some(),
            tee: self.tee_splice().is_some(),
        }
    }
}

// Compile-time assertion: the capability traits must stay object-safe.
const _: fn() = || {
    fn _assert(_: &dyn SpliceBackend, _: &dyn FilterSplice, _: &dyn TeeSplice) {}
};

fn filters(backend: &dyn SpliceBackend) -> Result<&dyn FilterSplice, SpliceError> {
    backend
        .filter_splice()
        .ok_or(SpliceError::Unsupported("filter"))
}

fn tees(backend: &dyn SpliceBackend) -> Result<&dyn TeeSplice, SpliceError> {
    backend.tee_splice().ok_or(SpliceError::Unsupported("tee"))
}

pub fn add_filter(
    backend: &dyn SpliceBackend,
    element: &Element,
) -> Result<SpliceStatus, SpliceError> {
    filters(backend)?.add_filter(element)
}

pub fn remove_filter(
    backend: &dyn SpliceBackend,
    element: &Element,
) -> Result<SpliceStatus, SpliceError> {
    filters(backend)?.remove_filter(element)
}

pub fn add_branch(
    backend: &dyn SpliceBackend,
    element: &Element,
) -> Result<SpliceStatus, SpliceError> {
    tees(backend)?.add_branch(element)
}

pub fn remove_branch(
    backend: &dyn SpliceBackend,
    element: &Element,
) -> Result<SpliceStatus, SpliceError> {
    tees(backend)?.remove_branch(element)
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Receives splice notifications.  All methods default to no-ops.
///
/// Called on the thread completing the splice (the caller on the direct
/// path, the coordinator's blocking pool otherwise) with flow still paused
/// for `*_pre_remove`.  Implementations must return promptly.
pub trait SpliceObserver: Send + Sync {
    fn filter_inserted(&self, _element: &Element) {}
    fn filter_pre_remove(&self, _element: &Element) {}
    fn tee_inserted(&self, _element: &Element) {}
    fn tee_pre_remove(&self, _element: &Element) {}
    fn splice_failed(&self, _element: &Element, _kind: SpliceKind, _error: &SpliceError) {}
}

/// Owned form of an observer callback.  Carries element names, not handles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SpliceEvent {
    FilterInserted { element: String },
    FilterPreRemove { element: String },
    TeeInserted { element: String },
    TeePreRemove { element: String },
    SpliceFailed {
        element: String,
        kind: SpliceKind,
        reason: String,
    },
}

/// Forwards every notification as a [`SpliceEvent`].
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SpliceEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SpliceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SpliceEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl SpliceObserver for ChannelObserver {
    fn filter_inserted(&self, element: &Element) {
        self.send(SpliceEvent::FilterInserted {
            element: element.name().to_string(),
        });
    }

    fn filter_pre_remove(&self, element: &Element) {
        self.send(SpliceEvent::FilterPreRemove {
            element: element.name().to_string(),
        });
    }

    fn tee_inserted(&self, element: &Element) {
        self.send(SpliceEvent::TeeInserted {
            element: element.name().to_string(),
        });
    }

    fn tee_pre_remove(&self, element: &Element) {
        self.send(SpliceEvent::TeePreRemove {
            element: element.name().to_string(),
        });
    }

    fn splice_failed(&self, element: &Element, kind: SpliceKind, error: &SpliceError) {
        self.send(SpliceEvent::SpliceFailed {
            element: element.name().to_string(),
            kind,
            reason: error.to_string(),
        });
    }
}
