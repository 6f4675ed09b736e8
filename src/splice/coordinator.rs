//! Splice coordinator: the single task that performs blocked surgery.
//!
//! Streaming threads never touch the graph structure.  When one of them hits
//! a pad blocked for a splice it sends the owned operation here and parks;
//! the coordinator runs the surgery (which unblocks the pad) and completes
//! the operation.
//!
//! ```text
//! CoordinatorMsg::Blocked { pad, op }
//!   └─▶ spawn_blocking(op.apply(Some(pad)))   [Blocked → Mutating → UnblockRequested]
//!         └─▶ settle(op)                      [Done, next queued operation issued]
//!
//! CoordinatorMsg::Abandoned(op)
//!   └─▶ settle(op, Err(Abandoned))           [Done, splice-failed reported]
//! ```
//!
//! Messages are handled one at a time, in arrival order.

use tokio::sync::mpsc;

use crate::graph::PadId;

use super::block::settle;
use super::error::SpliceError;
use super::operation::SpliceOperation;
use super::state::SpliceState;

/// Messages from block targets to the coordinator.
pub enum CoordinatorMsg {
    /// `pad` is blocked on behalf of `op`.
    Blocked { pad: PadId, op: SpliceOperation },
    /// The engine dropped `op`'s block request.
    Abandoned(SpliceOperation),
}

impl CoordinatorMsg {
    pub(crate) fn into_operation(self) -> SpliceOperation {
        match self {
            CoordinatorMsg::Blocked { op, .. } | CoordinatorMsg::Abandoned(op) => op,
        }
    }
}

/// Receiving end of the splice channel.
///
/// Create it with [`SpliceHost::new`](super::SpliceHost::new), then call
/// [`run`](Self::run) inside a tokio task.
pub struct SpliceCoordinator {
    rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
}

impl SpliceCoordinator {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<CoordinatorMsg>) -> Self {
        Self { rx }
    }

    /// Run until every sender (the host and all pending operations) is gone.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            // Surgery is synchronous engine work and may wait on engine
            // locks, so it runs on the blocking pool.
            let handled = tokio::task::spawn_blocking(move || handle(msg)).await;
            if let Err(e) = handled {
                log::error!("splice: coordinator job failed: {e}");
            }
        }

        log::info!("splice: channel closed, coordinator shutting down");
    }
}

fn handle(msg: CoordinatorMsg) {
    match msg {
        CoordinatorMsg::Blocked { pad, mut op } => {
            op.advance(SpliceState::Blocked);
            let outcome = op.apply(Some(pad));
            settle(op, outcome, true);
        }
        CoordinatorMsg::Abandoned(op) => {
            log::warn!(
                "splice: block request for {} on {} was abandoned",
                op.target().name(),
                op.fixture().name()
            );
            let err = SpliceError::Abandoned(op.target().name().to_string());
            settle(op, Err(err), true);
        }
    }
}
