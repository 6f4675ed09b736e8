//! The owned context of one splice, from request to completion.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::graph::{Element, Event, PadId, RunState};

use super::error::SpliceError;
use super::fixture::Fixture;
use super::host::SpliceHost;
use super::state::SpliceState;
use super::{filter, tee};

// ---------------------------------------------------------------------------
// SpliceKind
// ---------------------------------------------------------------------------

/// Which graph surgery an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpliceKind {
    AddFilter,
    RemoveFilter,
    AddBranch,
    RemoveBranch,
}

impl SpliceKind {
    /// `true` for the two insertions.
    pub fn is_insert(self) -> bool {
        matches!(self, SpliceKind::AddFilter | SpliceKind::AddBranch)
    }

    pub fn label(self) -> &'static str {
        match self {
            SpliceKind::AddFilter => "add-filter",
            SpliceKind::RemoveFilter => "remove-filter",
            SpliceKind::AddBranch => "add-branch",
            SpliceKind::RemoveBranch => "remove-branch",
        }
    }
}

impl fmt::Display for SpliceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// SpliceOperation
// ---------------------------------------------------------------------------

/// One pending or running splice.
///
/// Holds a reference on the owning host, the fixture and the target element
/// for its whole life.  Those references are taken when the operation is
/// built, before any block request, and go away when it is dropped in
/// [`SpliceState::Done`], on whichever thread completes it.
pub struct SpliceOperation {
    owner: Arc<SpliceHost>,
    fixture: Arc<Fixture>,
    target: Element,
    kind: SpliceKind,
    blocking: bool,
    state: SpliceState,
}

impl SpliceOperation {
    pub(crate) fn new(
        owner: &Arc<SpliceHost>,
        fixture: &Arc<Fixture>,
        target: &Element,
        kind: SpliceKind,
        blocking: bool,
    ) -> Self {
        Self {
            owner: Arc::clone(owner),
            fixture: Arc::clone(fixture),
            target: target.clone(),
            kind,
            blocking,
            state: SpliceState::Idle,
        }
    }

    pub fn kind(&self) -> SpliceKind {
        self.kind
    }

    /// Whether flow is paused around the surgery.
    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /// Switch a direct request to the blocking path before it is issued.
    pub(crate) fn require_blocking(&mut self) {
        debug_assert_eq!(self.state, SpliceState::Idle);
        self.blocking = true;
    }

    pub fn state(&self) -> SpliceState {
        self.state
    }

    pub fn target(&self) -> &Element {
        &self.target
    }

    pub fn fixture(&self) -> &Arc<Fixture> {
        &self.fixture
    }

    pub(crate) fn owner(&self) -> &Arc<SpliceHost> {
        &self.owner
    }

    pub(crate) fn advance(&mut self, next: SpliceState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal splice transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!(
            "splice: {} {} on {}: {} -> {}",
            self.kind,
            self.target.name(),
            self.fixture.name(),
            self.state.label(),
            next.label()
        );
        self.state = next;
    }

    /// Perform the surgery.  `blocked` is the paused pad on the blocking
    /// path, `None` on the direct path.
    ///
    /// On the blocking path flow is always released before returning,
    /// whatever the outcome.
    pub(crate) fn apply(&mut self, blocked: Option<PadId>) -> Result<(), SpliceError> {
        self.advance(SpliceState::Mutating);

        let owner = Arc::clone(&self.owner);
        let engine = owner.engine();
        let run_state = if blocked.is_some() {
            RunState::Playing
        } else {
            RunState::Paused
        };

        let outcome = match self.kind {
            SpliceKind::AddFilter => {
                filter::insert(engine, &self.fixture, &self.target, run_state).map(Some)
            }
            SpliceKind::AddBranch => tee::attach(
                engine,
                &self.fixture,
                &self.target,
                owner.branch(),
                run_state,
            )
            .map(Some),
            SpliceKind::RemoveFilter => filter::locate(engine, &self.fixture, &self.target)
                .and_then(|attached| {
                    owner.notify(|o| o.filter_pre_remove(&self.target));
                    filter::remove(engine, &self.fixture, &self.target, attached)
                })
                .map(|()| None),
            SpliceKind::RemoveBranch => tee::locate(engine, &self.fixture, &self.target)
                .and_then(|attached| {
                    owner.notify(|o| o.tee_pre_remove(&self.target));
                    tee::detach(engine, &self.fixture, &self.target, attached)
                })
                .map(|()| None),
        };

        if let Some(pad) = blocked {
            if let Ok(Some(entry)) = &outcome {
                if let Err(e) = engine.send_event(*entry, Event::Resync) {
                    log::warn!("splice: resync into {entry} failed: {e}");
                }
            }
            self.advance(SpliceState::UnblockRequested);
            if let Err(e) = engine.unblock(pad) {
                log::warn!("splice: unblocking {pad} failed: {e}");
            }
        }

        if outcome.is_ok() {
            match self.kind {
                SpliceKind::AddFilter => owner.notify(|o| o.filter_inserted(&self.target)),
                SpliceKind::AddBranch => owner.notify(|o| o.tee_inserted(&self.target)),
                SpliceKind::RemoveFilter | SpliceKind::RemoveBranch => {}
            }
        }

        outcome.map(|_| ())
    }
}

impl Drop for SpliceOperation {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            log::warn!(
                "splice: {} {} on {} dropped while {}",
                self.kind,
                self.target.name(),
                self.fixture.name(),
                self.state.label()
            );
        }
    }
}

impl fmt::Debug for SpliceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpliceOperation")
            .field("kind", &self.kind)
            .field("target", &self.target.name())
            .field("fixture", &self.fixture.name())
            .field("blocking", &self.blocking)
            .field("state", &self.state)
            .finish()
    }
}
