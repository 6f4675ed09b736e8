//! Stable attachment points for splices.
//!
//! A [`Fixture`] is a small always-present sub-graph that optional stages
//! attach to:
//!
//! ```text
//! filter fixture:   ─▶ [container: sink ─▶ convert-in ─▶ marker ─▶ src] ─▶
//! tee fixture:      ─▶ tee ─┬─▶ (main path)
//!                           └─▶ (branches, one request pad each)
//! ```
//!
//! Each fixture also owns the single-operation-in-flight slot that serialises
//! concurrent splice requests against it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::graph::{Engine, EngineError, NodeId, PadId};

use super::error::SpliceError;
use super::operation::SpliceOperation;

/// What a fixture hosts and where new stages attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKind {
    /// Filters are spliced in immediately upstream of `marker`.
    Filter { marker: NodeId },
    /// Branches hang off request pads of `tee`.
    Tee { tee: NodeId },
}

#[derive(Default)]
struct Slot {
    busy: bool,
    backlog: VecDeque<SpliceOperation>,
}

pub struct Fixture {
    name: String,
    kind: FixtureKind,
    container: NodeId,
    input_pad: PadId,
    slot: Mutex<Slot>,
    inconsistent: AtomicBool,
}

impl Fixture {
    /// Describe a filter fixture: `container` exposes a `sink` ghost pad and
    /// holds `marker`.
    pub fn filter(
        engine: &dyn Engine,
        name: &str,
        container: NodeId,
        marker: NodeId,
    ) -> Result<Arc<Self>, SpliceError> {
        if engine.parent(marker) != Some(container) {
            return Err(EngineError::NotAChild {
                node: marker,
                container,
            }
            .into());
        }
        let input_pad = engine
            .static_pad(container, "sink")
            .ok_or_else(|| SpliceError::MissingPad {
                node: name.to_string(),
                pad: "sink",
            })?;
        Ok(Arc::new(Self::new(
            name,
            FixtureKind::Filter { marker },
            container,
            input_pad,
        )))
    }

    /// Describe a tee fixture.  Branches are added to the tee's container.
    pub fn tee(engine: &dyn Engine, name: &str, tee: NodeId) -> Result<Arc<Self>, SpliceError> {
        let container = engine
            .parent(tee)
            .ok_or_else(|| SpliceError::Detached(name.to_string()))?;
        let input_pad = engine
            .static_pad(tee, "sink")
            .ok_or_else(|| SpliceError::MissingPad {
                node: name.to_string(),
                pad: "sink",
            })?;
        Ok(Arc::new(Self::new(
            name,
            FixtureKind::Tee { tee },
            container,
            input_pad,
        )))
    }

    fn new(name: &str, kind: FixtureKind, container: NodeId, input_pad: PadId) -> Self {
        Self {
            name: name.to_string(),
            kind,
            container,
            input_pad,
            slot: Mutex::new(Slot::default()),
            inconsistent: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FixtureKind {
        self.kind
    }

    /// Container new sub-containers are added to.
    pub fn container(&self) -> NodeId {
        self.container
    }

    /// The fixture's input pad.  Its peer is the block point.
    pub fn input_pad(&self) -> PadId {
        self.input_pad
    }

    pub fn marker(&self) -> Result<NodeId, SpliceError> {
        match self.kind {
            FixtureKind::Filter { marker } => Ok(marker),
            FixtureKind::Tee { .. } => Err(SpliceError::WrongFixture {
                fixture: self.name.clone(),
                expected: "filter",
            }),
        }
    }

    pub fn tee_node(&self) -> Result<NodeId, SpliceError> {
        match self.kind {
            FixtureKind::Tee { tee } => Ok(tee),
            FixtureKind::Filter { .. } => Err(SpliceError::WrongFixture {
                fixture: self.name.clone(),
                expected: "tee",
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Consistency flag
    // -----------------------------------------------------------------------

    /// A rollback failed and the main path may be broken.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_inconsistent(&self) {
        if !self.inconsistent.swap(true, Ordering::SeqCst) {
            log::error!("splice: fixture {} flagged inconsistent", self.name);
        }
    }

    // -----------------------------------------------------------------------
    // Operation slot
    // -----------------------------------------------------------------------

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the slot for `op`, or queue `op` behind the operation holding it.
    ///
    /// Returns the operation back when the caller now owns the slot.
    pub(crate) fn try_claim(&self, op: SpliceOperation) -> Option<SpliceOperation> {
        let mut slot = self.lock_slot();
        if slot.busy {
            slot.backlog.push_back(op);
            None
        } else {
            slot.busy = true;
            Some(op)
        }
    }

    /// Hand the slot to the next queued operation, or free it.
    pub(crate) fn next_queued(&self) -> Option<SpliceOperation> {
        let mut slot = self.lock_slot();
        let next = slot.backlog.pop_front();
        if next.is_none() {
            slot.busy = false;
        }
        next
    }

    /// Whether an operation currently holds the slot.
    pub fn in_flight(&self) -> bool {
        self.lock_slot().busy
    }

    /// Operations waiting for the slot.
    pub fn backlog_len(&self) -> usize {
        self.lock_slot().backlog.len()
    }
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("container", &self.container)
            .field("inconsistent", &self.is_inconsistent())
            .finish()
    }
}
