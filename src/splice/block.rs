//! Block/unblock primitive: how a splice gets flow out of its way.
//!
//! ```text
//! begin_splice ──claim fixture slot──┬─ busy ──▶ queued (Queued)
//!                                    │
//!                                    ├─ blocking/flowing ▶ request_block(peer of input pad)
//!                                    │                      │  (caller returns: Pending)
//!                                    │     streaming thread ▼
//!                                    │     PendingSplice::blocked ──▶ coordinator ──▶ apply
//!                                    │
//!                                    └─ direct ──▶ apply inline (Applied / Err)
//!
//! settle: release references, then start whatever queued on the fixture
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::graph::{BlockTarget, BlockWaiter, Element, PadId};

use super::coordinator::CoordinatorMsg;
use super::error::SpliceError;
use super::fixture::Fixture;
use super::host::SpliceHost;
use super::operation::{SpliceKind, SpliceOperation};
use super::state::SpliceState;

/// What became of a splice request by the time the call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpliceStatus {
    /// The surgery is complete.
    Applied,
    /// A pad block was requested; the coordinator finishes the surgery.
    Pending,
    /// Another operation holds the fixture; this one runs after it.
    Queued,
    /// No output graph exists yet; the request is remembered until one does.
    Deferred,
}

enum Issued {
    Pending,
    Refused(SpliceError),
    Ran(SpliceOperation, Result<(), SpliceError>),
}

/// Start a splice of `target` on `fixture`.
///
/// With `use_blocking`, or whenever the host is flowing at dispatch, the
/// surgery waits for a streaming thread to confirm the block and runs on the
/// coordinator; failures are then only reported through observers and the
/// log.  Otherwise the surgery is complete (or has failed) when this returns.
pub fn begin_splice(
    owner: &Arc<SpliceHost>,
    fixture: &Arc<Fixture>,
    target: &Element,
    kind: SpliceKind,
    use_blocking: bool,
) -> Result<SpliceStatus, SpliceError> {
    if fixture.is_inconsistent() {
        return Err(SpliceError::Inconsistent(fixture.name().to_string()));
    }

    let op = SpliceOperation::new(owner, fixture, target, kind, use_blocking);
    let Some(op) = fixture.try_claim(op) else {
        log::debug!(
            "splice: {kind} {} queued behind the operation in flight on {} ({} waiting)",
            target.name(),
            fixture.name(),
            fixture.backlog_len()
        );
        return Ok(SpliceStatus::Queued);
    };

    match issue(op) {
        Issued::Pending => Ok(SpliceStatus::Pending),
        Issued::Refused(e) => Err(e),
        Issued::Ran(op, outcome) => {
            let result = outcome.clone().map(|()| SpliceStatus::Applied);
            settle(op, outcome, false);
            result
        }
    }
}

/// Run `op` now (direct) or ask for the block it needs.
///
/// The path is chosen here rather than when the request was made, so an
/// operation that waited in the backlog sees the current flow state.
fn issue(mut op: SpliceOperation) -> Issued {
    if !op.blocking() {
        let host = Arc::clone(op.owner());
        match host.direct_pass() {
            Some(_pass) => {
                let outcome = op.apply(None);
                return Issued::Ran(op, outcome);
            }
            None => {
                log::debug!(
                    "splice: output is flowing; {} {} takes the blocking path",
                    op.kind(),
                    op.target().name()
                );
                op.require_blocking();
            }
        };
    }

    let engine = op.owner().engine_handle();
    let Some(block_pad) = engine.peer(op.fixture().input_pad()) else {
        let err = SpliceError::Detached(op.fixture().name().to_string());
        return Issued::Ran(op, Err(err));
    };

    op.advance(SpliceState::BlockRequested);
    log::debug!("splice: requesting block on {block_pad}");
    let tx = op.owner().coordinator();
    let waiter = BlockWaiter::new(Box::new(PendingSplice { op, tx }));
    match engine.request_block(block_pad, waiter) {
        Ok(()) => Issued::Pending,
        Err(e) => Issued::Refused(e.into()),
    }
}

/// Complete `op`, then drain the fixture's backlog until it is empty or an
/// operation goes asynchronous.
///
/// `report` sends failures to observers; it is false only when the caller
/// receives the error directly.
pub(crate) fn settle(op: SpliceOperation, outcome: Result<(), SpliceError>, report: bool) {
    let fixture = Arc::clone(op.fixture());
    finish(op, outcome, report);

    while let Some(next) = fixture.next_queued() {
        match issue(next) {
            Issued::Ran(op, outcome) => finish(op, outcome, true),
            Issued::Pending => break,
            Issued::Refused(e) => {
                log::warn!("splice: queued operation on {} refused: {e}", fixture.name());
                break;
            }
        }
    }
}

fn finish(mut op: SpliceOperation, outcome: Result<(), SpliceError>, report: bool) {
    if let Err(e) = &outcome {
        log::warn!(
            "splice: {} {} on {} failed: {e}",
            op.kind(),
            op.target().name(),
            op.fixture().name()
        );
        if report {
            let kind = op.kind();
            op.owner()
                .notify(|o| o.splice_failed(op.target(), kind, e));
        }
    }
    op.advance(SpliceState::Done);
}

// ---------------------------------------------------------------------------
// PendingSplice
// ---------------------------------------------------------------------------

/// The [`BlockTarget`] carried by a splice's block request.
///
/// Runs on the streaming thread, so it only forwards the operation to the
/// coordinator.
struct PendingSplice {
    op: SpliceOperation,
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
}

impl BlockTarget for PendingSplice {
    fn blocked(self: Box<Self>, pad: PadId) {
        let PendingSplice { op, tx } = *self;
        if let Err(mpsc::error::SendError(msg)) = tx.send(CoordinatorMsg::Blocked { pad, op }) {
            log::error!("splice: coordinator gone; releasing {pad} untouched");
            let op = msg.into_operation();
            if let Err(e) = op.owner().engine().unblock(pad) {
                log::warn!("splice: unblocking {pad} failed: {e}");
            }
            settle(op, Err(SpliceError::CoordinatorGone), true);
        }
    }

    fn abandoned(self: Box<Self>) {
        let PendingSplice { op, tx } = *self;
        if let Err(mpsc::error::SendError(msg)) = tx.send(CoordinatorMsg::Abandoned(op)) {
            let op = msg.into_operation();
            let err = SpliceError::Abandoned(op.target().name().to_string());
            settle(op, Err(err), true);
        }
    }
}
