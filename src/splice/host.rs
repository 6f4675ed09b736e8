use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::capability::SpliceObserver;
use crate::config::BranchConfig;
use crate::graph::Engine;

use super::coordinator::{CoordinatorMsg, SpliceCoordinator};

/// Everything a splice needs from its owner: the engine, branch queue
/// settings, the observers to notify and the coordinator to hand block
/// confirmations to.
///
/// Every [`SpliceOperation`](super::SpliceOperation) holds a reference on
/// its host until it completes.
pub struct SpliceHost {
    engine: Arc<dyn Engine>,
    branch: BranchConfig,
    observers: Mutex<Vec<Arc<dyn SpliceObserver>>>,
    coordinator: mpsc::UnboundedSender<CoordinatorMsg>,
    gate: Mutex<FlowGate>,
    gate_idle: Condvar,
}

/// Whether the output is moving data, and how many direct splices are
/// running against that assumption.
#[derive(Default)]
struct FlowGate {
    flowing: bool,
    direct: usize,
}

impl SpliceHost {
    /// Create a host and the coordinator serving it.
    ///
    /// The coordinator does nothing until [`SpliceCoordinator::run`] is
    /// spawned on a tokio runtime.
    pub fn new(engine: Arc<dyn Engine>, branch: BranchConfig) -> (Arc<Self>, SpliceCoordinator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            engine,
            branch,
            observers: Mutex::new(Vec::new()),
            coordinator: tx,
            gate: Mutex::new(FlowGate::default()),
            gate_idle: Condvar::new(),
        });
        (host, SpliceCoordinator::new(rx))
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn engine_handle(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    pub fn branch(&self) -> BranchConfig {
        self.branch
    }

    /// Register an observer for inserted / pre-remove / failed notifications.
    pub fn subscribe(&self, observer: Arc<dyn SpliceObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Call `f` on every observer.  No lock is held while observers run.
    pub(crate) fn notify(&self, f: impl Fn(&dyn SpliceObserver)) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }

    pub(crate) fn coordinator(&self) -> mpsc::UnboundedSender<CoordinatorMsg> {
        self.coordinator.clone()
    }

    fn gate(&self) -> MutexGuard<'_, FlowGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether splices dispatched now take the blocking path.
    pub fn is_flowing(&self) -> bool {
        self.gate().flowing
    }

    /// Change the flow state, running `apply` (the engine state change)
    /// once no direct splice is in progress.
    ///
    /// Direct splices cannot start while `apply` runs.  If `apply` fails the
    /// flow state is left as it was.
    pub fn set_flowing<T, E>(
        &self,
        flowing: bool,
        apply: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut gate = self.gate();
        while gate.direct > 0 {
            gate = self
                .gate_idle
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let out = apply()?;
        gate.flowing = flowing;
        Ok(out)
    }

    /// Enter a direct splice, or `None` if the output is flowing and the
    /// splice must block instead.  Flow cannot start until the pass drops.
    pub(crate) fn direct_pass(&self) -> Option<DirectPass<'_>> {
        let mut gate = self.gate();
        if gate.flowing {
            return None;
        }
        gate.direct += 1;
        Some(DirectPass { host: self })
    }
}

/// A direct splice in progress; see [`SpliceHost::direct_pass`].
pub(crate) struct DirectPass<'a> {
    host: &'a SpliceHost,
}

impl Drop for DirectPass<'_> {
    fn drop(&mut self) {
        let mut gate = self.host.gate();
        gate.direct -= 1;
        if gate.direct == 0 {
            self.host.gate_idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    #[test]
    fn direct_passes_close_once_flowing() {
        let (host, _coordinator) = SpliceHost::new(MemoryGraph::new(), BranchConfig::default());
        assert!(!host.is_flowing());
        {
            let _a = host.direct_pass().unwrap();
            let _b = host.direct_pass().unwrap();
        }
        host.set_flowing(true, || Ok::<_, ()>(())).unwrap();
        assert!(host.is_flowing());
        assert!(host.direct_pass().is_none());
    }

    #[test]
    fn failed_state_change_keeps_flow_state() {
        let (host, _coordinator) = SpliceHost::new(MemoryGraph::new(), BranchConfig::default());
        assert_eq!(host.set_flowing(true, || Err::<(), _>("refused")), Err("refused"));
        assert!(!host.is_flowing());
        assert!(host.direct_pass().is_some());
    }

    #[test]
    fn flow_waits_for_direct_splice() {
        let (host, _coordinator) = SpliceHost::new(MemoryGraph::new(), BranchConfig::default());
        let pass = host.direct_pass().unwrap();

        let started = std::thread::scope(|s| {
            let starter = s.spawn(|| {
                host.set_flowing(true, || Ok::<_, ()>(std::time::Instant::now()))
                    .unwrap()
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            let released = std::time::Instant::now();
            drop(pass);
            (released, starter.join().unwrap())
        });
        assert!(started.1 >= started.0);
    }
}
