//! In-process streaming engine.
//!
//! [`MemoryGraph`] implements [`Engine`] with real data flow so splices can be
//! exercised against live streaming threads:
//!
//! * buffers are pushed into a pad by a streaming thread and travel through
//!   links, ghost pads and request pads;
//! * a pad with a pending block request resolves its [`BlockWaiter`] on the
//!   first streaming thread that reaches it, then parks that thread until
//!   [`Engine::unblock`] is called;
//! * every queue element runs its own consumer thread while it is
//!   [`RunState::Paused`] or above, which makes a queue a thread boundary;
//! * a paused node prerolls: buffers reaching it wait at its input until it
//!   plays, so nothing moves through a paused graph;
//! * sinks record what reaches them through a shared [`SinkProbe`].
//!
//! It also carries the instrumentation the splice tests need: call counters
//! ([`GraphStats`]), link/unlink/state-change fault injection, an event log, chain walking and a
//! serialisable [`GraphSnapshot`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::queue::BranchQueue;
use super::{
    BlockWaiter, Buffer, Element, ElementSpec, Engine, EngineError, Event, Item, NodeId,
    PadDirection, PadId, RunState,
};

// ---------------------------------------------------------------------------
// FlowError
// ---------------------------------------------------------------------------

/// Why an item could not be delivered downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The pad leads nowhere.
    #[error("pad is not linked")]
    NotLinked,

    /// The receiving node is stopped or shutting down.
    #[error("downstream is flushing")]
    Flushing,
}

// ---------------------------------------------------------------------------
// SinkProbe
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProbeInner {
    buffers: u64,
    events: Vec<Event>,
    last: Option<Buffer>,
    stalled: bool,
    flushing: bool,
}

/// Shared view of what a sink element has consumed.
///
/// [`stall`](Self::stall) makes the sink stop consuming (the thread feeding
/// it parks inside the sink), which is how tests model a slow branch
/// consumer.
#[derive(Default)]
pub struct SinkProbe {
    inner: Mutex<ProbeInner>,
    changed: Condvar,
}

impl SinkProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(&self, item: Item) -> Result<(), FlowError> {
        let mut inner = self.lock();
        while inner.stalled && !inner.flushing {
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.flushing {
            return Err(FlowError::Flushing);
        }
        match item {
            Item::Buffer(buffer) => {
                inner.buffers += 1;
                inner.last = Some(buffer);
            }
            Item::Event(event) => inner.events.push(event),
        }
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    fn set_flushing(&self, flushing: bool) {
        self.lock().flushing = flushing;
        self.changed.notify_all();
    }

    /// Stop consuming until [`resume`](Self::resume).
    pub fn stall(&self) {
        self.lock().stalled = true;
    }

    pub fn resume(&self) {
        self.lock().stalled = false;
        self.changed.notify_all();
    }

    /// Number of buffers consumed so far.
    pub fn buffers(&self) -> u64 {
        self.lock().buffers
    }

    /// Events consumed so far, in order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Most recent buffer consumed.
    pub fn last_buffer(&self) -> Option<Buffer> {
        self.lock().last.clone()
    }

    /// Wait until at least `count` buffers have been consumed.
    ///
    /// Returns `false` on timeout.
    pub fn wait_for_buffers(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.buffers < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// GraphStats / GraphSnapshot
// ---------------------------------------------------------------------------

/// Counters of engine primitive calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub block_requests: u64,
    pub blocks_confirmed: u64,
    pub unblocks: u64,
    pub links: u64,
    pub link_failures: u64,
    pub unlinks: u64,
    pub events_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PadSnapshot {
    pub id: PadId,
    pub name: String,
    pub direction: PadDirection,
    pub peer: Option<PadId>,
    pub ghost_target: Option<PadId>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub kind: &'static str,
    pub parent: Option<NodeId>,
    pub state: RunState,
    pub pads: Vec<PadSnapshot>,
}

/// Serialisable picture of the whole graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub stats: GraphStats,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

enum PadBlock {
    Idle,
    Requested(BlockWaiter),
    Blocked,
}

struct PadData {
    name: String,
    node: NodeId,
    direction: PadDirection,
    peer: Option<PadId>,
    ghost_target: Option<PadId>,
    request: bool,
    block: PadBlock,
}

#[derive(Clone)]
enum Behaviour {
    Bin,
    Source,
    Identity,
    Gain(f32),
    Tee,
    Queue(Arc<BranchQueue<Item>>),
    Sink(Arc<SinkProbe>),
}

impl Behaviour {
    fn kind(&self) -> &'static str {
        match self {
            Behaviour::Bin => "bin",
            Behaviour::Source => "source",
            Behaviour::Identity => "identity",
            Behaviour::Gain(_) => "gain",
            Behaviour::Tee => "tee",
            Behaviour::Queue(_) => "queue",
            Behaviour::Sink(_) => "sink",
        }
    }
}

struct NodeData {
    name: String,
    behaviour: Behaviour,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    pads: Vec<PadId>,
    state: RunState,
    next_request: u32,
    /// Epoch of the running queue consumer thread, if any.
    task_epoch: Option<u64>,
}

/// Injected failures for one primitive: `allow` calls succeed, then the
/// next `refuse` calls are refused.
#[derive(Default)]
struct FaultBudget {
    allow: usize,
    refuse: usize,
}

impl FaultBudget {
    fn refuse_next(&mut self) -> bool {
        if self.allow > 0 {
            self.allow -= 1;
            false
        } else if self.refuse > 0 {
            self.refuse -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Faults {
    links: FaultBudget,
    unlinks: FaultBudget,
    state_changes: FaultBudget,
}

#[derive(Default)]
struct GraphState {
    nodes: BTreeMap<NodeId, NodeData>,
    pads: BTreeMap<PadId, PadData>,
    next_id: u64,
    name_counters: HashMap<&'static str, u32>,
    stats: GraphStats,
    faults: Faults,
    events: Vec<(PadId, Event)>,
}

impl GraphState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn auto_name(&mut self, kind: &'static str) -> String {
        let counter = self.name_counters.entry(kind).or_insert(0);
        let name = format!("{kind}{counter}");
        *counter += 1;
        name
    }

    fn node(&self, id: NodeId) -> Result<&NodeData, EngineError> {
        self.nodes.get(&id).ok_or(EngineError::NoSuchNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeData, EngineError> {
        self.nodes.get_mut(&id).ok_or(EngineError::NoSuchNode(id))
    }

    fn pad(&self, id: PadId) -> Result<&PadData, EngineError> {
        self.pads.get(&id).ok_or(EngineError::NoSuchPad(id))
    }

    fn add_pad(&mut self, node: NodeId, name: &str, direction: PadDirection) -> PadId {
        let id = PadId(self.alloc_id());
        self.pads.insert(
            id,
            PadData {
                name: name.to_string(),
                node,
                direction,
                peer: None,
                ghost_target: None,
                request: false,
                block: PadBlock::Idle,
            },
        );
        if let Some(data) = self.nodes.get_mut(&node) {
            data.pads.push(id);
        }
        id
    }

    fn find_pad(&self, node: NodeId, name: &str) -> Option<PadId> {
        let data = self.nodes.get(&node)?;
        data.pads
            .iter()
            .copied()
            .find(|pad| self.pads.get(pad).is_some_and(|p| p.name == name))
    }

    /// Follow sink-side ghost pads down to the pad of a real element.
    fn descend(&self, mut pad: PadId) -> PadId {
        while let Some(target) = self.pads.get(&pad).and_then(|p| p.ghost_target) {
            pad = target;
        }
        pad
    }

    /// The src ghost pad on the parent bin that exposes `pad`, if any.
    fn exposing_ghost(&self, pad: PadId) -> Option<PadId> {
        let owner = self.pads.get(&pad)?.node;
        let parent = self.nodes.get(&owner)?.parent?;
        self.nodes.get(&parent)?.pads.iter().copied().find(|candidate| {
            self.pads
                .get(candidate)
                .is_some_and(|p| p.ghost_target == Some(pad) && p.direction == PadDirection::Src)
        })
    }

    /// The real sink pad that data leaving `src` lands on, ignoring blocks.
    fn downstream_of(&self, src: PadId) -> Option<PadId> {
        let mut pad = src;
        loop {
            match self.pads.get(&pad)?.peer {
                Some(peer) => return Some(self.descend(peer)),
                None => pad = self.exposing_ghost(pad)?,
            }
        }
    }

    fn is_blocked(&self, pad: PadId) -> bool {
        matches!(
            self.pads.get(&pad).map(|p| &p.block),
            Some(PadBlock::Blocked)
        )
    }

    fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            if let Some(data) = self.nodes.get(&out[i]) {
                out.extend(data.children.iter().copied());
            }
            i += 1;
        }
        out
    }

    fn unlink_pad(&mut self, pad: PadId) {
        let peer = self.pads.get_mut(&pad).and_then(|p| p.peer.take());
        if let Some(peer) = peer {
            if let Some(p) = self.pads.get_mut(&peer) {
                p.peer = None;
            }
            self.stats.unlinks += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryGraph
// ---------------------------------------------------------------------------

/// Thread-safe in-memory streaming graph.
///
/// Always held behind an `Arc` (queue consumer threads keep a weak handle
/// back to the graph).
pub struct MemoryGraph {
    me: Weak<MemoryGraph>,
    state: Mutex<GraphState>,
    unblocked: Condvar,
}

impl MemoryGraph {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| MemoryGraph {
            me: me.clone(),
            state: Mutex::new(GraphState::default()),
            unblocked: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Data flow
    // -----------------------------------------------------------------------

    /// Push a buffer out of `src`.  Called by streaming threads.
    ///
    /// Parks the calling thread while any pad on the way is blocked.
    pub fn push(&self, src: PadId, buffer: Buffer) -> Result<(), FlowError> {
        self.forward(src, Item::Buffer(buffer))
    }

    fn forward(&self, src: PadId, item: Item) -> Result<(), FlowError> {
        // Only buffers honour pad blocks.  Events are injected by the splice
        // coordinator itself and must never park it.
        let honour_blocks = matches!(item, Item::Buffer(_));
        let sink = self.resolve_downstream(src, honour_blocks)?;
        self.deliver(sink, item)
    }

    fn resolve_downstream(&self, start: PadId, honour_blocks: bool) -> Result<PadId, FlowError> {
        let mut st = self.lock();
        let mut pad = start;
        loop {
            if honour_blocks {
                st = self.wait_if_blocked(st, pad);
            }
            let data = st.pads.get(&pad).ok_or(FlowError::NotLinked)?;
            match data.peer {
                Some(peer) => return Ok(st.descend(peer)),
                None => pad = st.exposing_ghost(pad).ok_or(FlowError::NotLinked)?,
            }
        }
    }

    /// Confirm a pending block on `pad` and park until it is released.
    fn wait_if_blocked<'a>(
        &'a self,
        mut st: MutexGuard<'a, GraphState>,
        pad: PadId,
    ) -> MutexGuard<'a, GraphState> {
        let waiter = match st.pads.get_mut(&pad) {
            Some(data) => match std::mem::replace(&mut data.block, PadBlock::Idle) {
                PadBlock::Requested(waiter) => {
                    data.block = PadBlock::Blocked;
                    Some(waiter)
                }
                other => {
                    data.block = other;
                    None
                }
            },
            None => None,
        };

        if let Some(waiter) = waiter {
            st.stats.blocks_confirmed += 1;
            drop(st);
            log::debug!("graph: {pad} blocked on streaming thread");
            waiter.resolve(pad);
            st = self.lock();
        }

        while st.is_blocked(pad) {
            st = self
                .unblocked
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        st
    }

    fn deliver(&self, sink: PadId, item: Item) -> Result<(), FlowError> {
        let holds = matches!(item, Item::Buffer(_));
        let (behaviour, outputs) = {
            let mut st = self.lock();
            let owner = loop {
                let owner = st.pads.get(&sink).ok_or(FlowError::NotLinked)?.node;
                let state = st.nodes.get(&owner).ok_or(FlowError::NotLinked)?.state;
                if state < RunState::Paused {
                    return Err(FlowError::Flushing);
                }
                // A paused node takes no buffers: the streaming thread waits
                // at its input until it plays or stops.
                if holds && state == RunState::Paused {
                    st = self
                        .unblocked
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
                break owner;
            };
            let node = st.nodes.get(&owner).ok_or(FlowError::NotLinked)?;
            let outputs: Vec<PadId> = node
                .pads
                .iter()
                .copied()
                .filter(|pad| {
                    st.pads
                        .get(pad)
                        .is_some_and(|p| p.direction == PadDirection::Src)
                })
                .collect();
            (node.behaviour.clone(), outputs)
        };

        match behaviour {
            Behaviour::Identity => match outputs.first() {
                Some(&src) => self.forward(src, item),
                None => Err(FlowError::NotLinked),
            },
            Behaviour::Gain(gain) => {
                let item = match item {
                    Item::Buffer(mut buffer) => {
                        buffer.samples.iter_mut().for_each(|s| *s *= gain);
                        Item::Buffer(buffer)
                    }
                    event => event,
                };
                match outputs.first() {
                    Some(&src) => self.forward(src, item),
                    None => Err(FlowError::NotLinked),
                }
            }
            Behaviour::Tee => {
                for src in outputs {
                    if let Err(e) = self.forward(src, item.clone()) {
                        log::trace!("graph: tee output {src} dropped item: {e}");
                    }
                }
                Ok(())
            }
            Behaviour::Queue(queue) => queue.push(item).map(|_| ()).map_err(|_| FlowError::Flushing),
            Behaviour::Sink(probe) => probe.render(item),
            Behaviour::Bin | Behaviour::Source => Err(FlowError::NotLinked),
        }
    }

    fn spawn_queue_task(&self, name: &str, queue: Arc<BranchQueue<Item>>, src: PadId, epoch: u64) {
        let graph = self.me.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("queue:{name}"))
            .spawn(move || {
                while let Some(item) = queue.pop_wait(epoch) {
                    let Some(graph) = graph.upgrade() else {
                        break;
                    };
                    if let Err(e) = graph.forward(src, item) {
                        log::trace!("graph: queue task dropped item: {e}");
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("graph: failed to spawn queue task for {name}: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Instrumentation
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> GraphStats {
        self.lock().stats
    }

    /// Let the next `allow` links succeed, then refuse the following
    /// `refuse` links.
    pub fn fail_links(&self, allow: usize, refuse: usize) {
        self.lock().faults.links = FaultBudget { allow, refuse };
    }

    /// As [`fail_links`](Self::fail_links), for unlinks.
    pub fn fail_unlinks(&self, allow: usize, refuse: usize) {
        self.lock().faults.unlinks = FaultBudget { allow, refuse };
    }

    /// As [`fail_links`](Self::fail_links), for state changes.
    pub fn fail_state_changes(&self, allow: usize, refuse: usize) {
        self.lock().faults.state_changes = FaultBudget { allow, refuse };
    }

    /// Every event injected with [`Engine::send_event`], with its entry pad.
    pub fn events_sent(&self) -> Vec<(PadId, Event)> {
        self.lock().events.clone()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.lock().nodes.contains_key(&node)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.lock()
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn child_names(&self, node: NodeId) -> Vec<String> {
        let st = self.lock();
        st.nodes
            .get(&node)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| st.nodes.get(c).map(|d| d.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_blocked(&self, pad: PadId) -> bool {
        self.lock().is_blocked(pad)
    }

    /// Names of the elements data leaving `from` passes through, ending with
    /// `until` (or at the first dead end).
    pub fn chain(&self, from: PadId, until: NodeId) -> Vec<String> {
        let st = self.lock();
        let mut names = Vec::new();
        let mut pad = from;
        for _ in 0..st.nodes.len() {
            let Some(sink) = st.downstream_of(pad) else {
                break;
            };
            let Some(owner) = st.pads.get(&sink).map(|p| p.node) else {
                break;
            };
            let Some(node) = st.nodes.get(&owner) else {
                break;
            };
            names.push(node.name.clone());
            if owner == until {
                break;
            }
            // Follow the first output; for a tee that is the main path.
            let next = node.pads.iter().copied().find(|p| {
                st.pads
                    .get(p)
                    .is_some_and(|d| d.direction == PadDirection::Src)
            });
            match next {
                Some(next) => pad = next,
                None => break,
            }
        }
        names
    }

    /// Request pads currently present on `node`.
    pub fn request_pads(&self, node: NodeId) -> Vec<PadId> {
        let st = self.lock();
        st.nodes
            .get(&node)
            .map(|n| {
                n.pads
                    .iter()
                    .copied()
                    .filter(|p| st.pads.get(p).is_some_and(|d| d.request))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The queue behind a queue element.
    pub fn queue(&self, node: NodeId) -> Option<Arc<BranchQueue<Item>>> {
        match &self.lock().nodes.get(&node)?.behaviour {
            Behaviour::Queue(queue) => Some(Arc::clone(queue)),
            _ => None,
        }
    }

    /// The probe behind a sink element.
    pub fn probe(&self, node: NodeId) -> Option<Arc<SinkProbe>> {
        match &self.lock().nodes.get(&node)?.behaviour {
            Behaviour::Sink(probe) => Some(Arc::clone(probe)),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let st = self.lock();
        let nodes = st
            .nodes
            .iter()
            .map(|(&id, node)| NodeSnapshot {
                id,
                name: node.name.clone(),
                kind: node.behaviour.kind(),
                parent: node.parent,
                state: node.state,
                pads: node
                    .pads
                    .iter()
                    .filter_map(|&pad| {
                        st.pads.get(&pad).map(|p| PadSnapshot {
                            id: pad,
                            name: p.name.clone(),
                            direction: p.direction,
                            peer: p.peer,
                            ghost_target: p.ghost_target,
                            blocked: !matches!(p.block, PadBlock::Idle),
                        })
                    })
                    .collect(),
            })
            .collect();
        GraphSnapshot {
            nodes,
            stats: st.stats,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine implementation
// ---------------------------------------------------------------------------

type PadTemplate = &'static [(&'static str, PadDirection)];

const SOURCE_PADS: PadTemplate = &[("src", PadDirection::Src)];
const SINK_PADS: PadTemplate = &[("sink", PadDirection::Sink)];
const THROUGH_PADS: PadTemplate = &[("sink", PadDirection::Sink), ("src", PadDirection::Src)];

impl Engine for MemoryGraph {
    fn create_element(
        &self,
        spec: ElementSpec,
        name: Option<&str>,
    ) -> Result<Element, EngineError> {
        let (behaviour, pads) = match spec {
            ElementSpec::Source => (Behaviour::Source, SOURCE_PADS),
            ElementSpec::Identity => (Behaviour::Identity, THROUGH_PADS),
            ElementSpec::Gain(gain) => (Behaviour::Gain(gain), THROUGH_PADS),
            ElementSpec::Tee => (Behaviour::Tee, SINK_PADS),
            ElementSpec::Queue {
                max_buffers,
                overflow,
            } => (
                Behaviour::Queue(Arc::new(BranchQueue::new(max_buffers.max(1), overflow))),
                THROUGH_PADS,
            ),
            ElementSpec::Sink => (Behaviour::Sink(Arc::new(SinkProbe::default())), SINK_PADS),
        };

        let mut st = self.lock();
        let id = NodeId(st.alloc_id());
        let name = match name {
            Some(name) => name.to_string(),
            None => st.auto_name(behaviour.kind()),
        };
        st.nodes.insert(
            id,
            NodeData {
                name: name.clone(),
                behaviour,
                parent: None,
                children: Vec::new(),
                pads: Vec::new(),
                state: RunState::Null,
                next_request: 0,
                task_epoch: None,
            },
        );
        for (pad_name, direction) in pads {
            st.add_pad(id, pad_name, *direction);
        }
        Ok(Element::new(id, name))
    }

    fn create_bin(&self, name: Option<&str>) -> Result<Element, EngineError> {
        let mut st = self.lock();
        let id = NodeId(st.alloc_id());
        let name = match name {
            Some(name) => name.to_string(),
            None => st.auto_name("bin"),
        };
        st.nodes.insert(
            id,
            NodeData {
                name: name.clone(),
                behaviour: Behaviour::Bin,
                parent: None,
                children: Vec::new(),
                pads: Vec::new(),
                state: RunState::Null,
                next_request: 0,
                task_epoch: None,
            },
        );
        Ok(Element::new(id, name))
    }

    fn add_ghost_pad(&self, bin: NodeId, name: &str, target: PadId) -> Result<PadId, EngineError> {
        let mut st = self.lock();
        if !matches!(st.node(bin)?.behaviour, Behaviour::Bin) {
            return Err(EngineError::NotAContainer(bin));
        }
        let target_data = st.pad(target)?;
        let direction = target_data.direction;
        let owner = target_data.node;
        if st.node(owner)?.parent != Some(bin) {
            return Err(EngineError::NotAChild {
                node: owner,
                container: bin,
            });
        }
        let ghost = st.add_pad(bin, name, direction);
        if let Some(pad) = st.pads.get_mut(&ghost) {
            pad.ghost_target = Some(target);
        }
        Ok(ghost)
    }

    fn request_pad(&self, node: NodeId) -> Result<PadId, EngineError> {
        let mut st = self.lock();
        let data = st.node_mut(node)?;
        if !matches!(data.behaviour, Behaviour::Tee) {
            return Err(EngineError::NoRequestPads(node));
        }
        let name = format!("src_{}", data.next_request);
        data.next_request += 1;
        let pad = st.add_pad(node, &name, PadDirection::Src);
        if let Some(data) = st.pads.get_mut(&pad) {
            data.request = true;
        }
        Ok(pad)
    }

    fn release_request_pad(&self, pad: PadId) -> Result<(), EngineError> {
        let mut st = self.lock();
        let data = st.pad(pad)?;
        if !data.request {
            return Err(EngineError::WrongDirection(pad));
        }
        let owner = data.node;
        st.unlink_pad(pad);
        st.pads.remove(&pad);
        if let Some(node) = st.nodes.get_mut(&owner) {
            node.pads.retain(|p| *p != pad);
        }
        Ok(())
    }

    fn static_pad(&self, node: NodeId, name: &str) -> Option<PadId> {
        self.lock().find_pad(node, name)
    }

    fn peer(&self, pad: PadId) -> Option<PadId> {
        self.lock().pads.get(&pad)?.peer
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.lock().nodes.get(&node)?.parent
    }

    fn add_child(&self, container: NodeId, child: NodeId) -> Result<(), EngineError> {
        let mut st = self.lock();
        if !matches!(st.node(container)?.behaviour, Behaviour::Bin) {
            return Err(EngineError::NotAContainer(container));
        }
        if let Some(parent) = st.node(child)?.parent {
            return Err(EngineError::AlreadyParented {
                node: child,
                parent,
            });
        }
        st.node_mut(child)?.parent = Some(container);
        st.node_mut(container)?.children.push(child);
        Ok(())
    }

    fn remove_child(&self, container: NodeId, child: NodeId) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.node(child)?.parent != Some(container) {
            return Err(EngineError::NotAChild {
                node: child,
                container,
            });
        }
        st.node_mut(child)?.parent = None;
        st.node_mut(container)?.children.retain(|c| *c != child);
        Ok(())
    }

    fn link(&self, src: PadId, sink: PadId) -> Result<(), EngineError> {
        let mut st = self.lock();
        let src_data = st.pad(src)?;
        if src_data.direction != PadDirection::Src {
            return Err(EngineError::WrongDirection(src));
        }
        if src_data.peer.is_some() {
            return Err(EngineError::AlreadyLinked(src));
        }
        let sink_data = st.pad(sink)?;
        if sink_data.direction != PadDirection::Sink {
            return Err(EngineError::WrongDirection(sink));
        }
        if sink_data.peer.is_some() {
            return Err(EngineError::AlreadyLinked(sink));
        }

        if st.faults.links.refuse_next() {
            st.stats.link_failures += 1;
            return Err(EngineError::LinkRefused { src, sink });
        }

        if let Some(p) = st.pads.get_mut(&src) {
            p.peer = Some(sink);
        }
        if let Some(p) = st.pads.get_mut(&sink) {
            p.peer = Some(src);
        }
        st.stats.links += 1;
        Ok(())
    }

    fn unlink(&self, src: PadId, sink: PadId) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.pad(src)?.peer != Some(sink) {
            return Err(EngineError::NotLinked { src, sink });
        }
        if st.faults.unlinks.refuse_next() {
            return Err(EngineError::UnlinkRefused { src, sink });
        }
        st.unlink_pad(src);
        Ok(())
    }

    fn set_state(&self, node: NodeId, state: RunState) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.node(node)?;
        if st.faults.state_changes.refuse_next() {
            return Err(EngineError::StateChangeRefused(node));
        }
        let running = state >= RunState::Paused;
        for id in st.descendants(node) {
            let Some(data) = st.nodes.get_mut(&id) else {
                continue;
            };
            data.state = state;
            match data.behaviour.clone() {
                Behaviour::Queue(queue) => {
                    if running && data.task_epoch.is_none() {
                        queue.reopen();
                        let epoch = queue.epoch();
                        data.task_epoch = Some(epoch);
                        let name = data.name.clone();
                        if let Some(src) = st.find_pad(id, "src") {
                            self.spawn_queue_task(&name, queue, src, epoch);
                        }
                    } else if !running {
                        data.task_epoch = None;
                        queue.close();
                    }
                }
                Behaviour::Sink(probe) => probe.set_flushing(!running),
                _ => {}
            }
        }
        drop(st);
        // Wake streaming threads held by a paused node.
        self.unblocked.notify_all();
        Ok(())
    }

    fn state(&self, node: NodeId) -> Option<RunState> {
        self.lock().nodes.get(&node).map(|n| n.state)
    }

    fn request_block(&self, pad: PadId, waiter: BlockWaiter) -> Result<(), EngineError> {
        let mut st = self.lock();
        let result = match st.pads.get_mut(&pad) {
            None => Err(EngineError::NoSuchPad(pad)),
            Some(data) if !matches!(data.block, PadBlock::Idle) => {
                Err(EngineError::AlreadyBlocked(pad))
            }
            Some(data) => {
                data.block = PadBlock::Requested(waiter);
                st.stats.block_requests += 1;
                return Ok(());
            }
        };
        // Drop the refused waiter outside the lock.
        drop(st);
        drop(waiter);
        result
    }

    fn unblock(&self, pad: PadId) -> Result<(), EngineError> {
        let mut st = self.lock();
        let previous = std::mem::replace(
            &mut st
                .pads
                .get_mut(&pad)
                .ok_or(EngineError::NoSuchPad(pad))?
                .block,
            PadBlock::Idle,
        );
        st.stats.unblocks += 1;
        drop(st);
        self.unblocked.notify_all();
        // A request that never took effect is abandoned here.
        drop(previous);
        Ok(())
    }

    fn send_event(&self, pad: PadId, event: Event) -> Result<(), EngineError> {
        let direction = {
            let mut st = self.lock();
            let direction = st.pad(pad)?.direction;
            st.events.push((pad, event));
            st.stats.events_sent += 1;
            direction
        };
        let flow = match direction {
            PadDirection::Src => self.forward(pad, Item::Event(event)),
            PadDirection::Sink => {
                let target = self.lock().descend(pad);
                self.deliver(target, Item::Event(event))
            }
        };
        if let Err(e) = flow {
            log::debug!("graph: {event:?} into {pad} went nowhere: {e}");
        }
        Ok(())
    }

    fn destroy(&self, node: NodeId) -> Result<(), EngineError> {
        let mut st = self.lock();
        if let Some(parent) = st.node(node)?.parent {
            return Err(EngineError::AlreadyParented { node, parent });
        }
        let mut abandoned = Vec::new();
        for id in st.descendants(node) {
            let Some(data) = st.nodes.remove(&id) else {
                continue;
            };
            match &data.behaviour {
                Behaviour::Queue(queue) => queue.close(),
                Behaviour::Sink(probe) => probe.set_flushing(true),
                _ => {}
            }
            for pad in data.pads {
                st.unlink_pad(pad);
                if let Some(removed) = st.pads.remove(&pad) {
                    abandoned.push(removed.block);
                }
            }
        }
        drop(st);
        self.unblocked.notify_all();
        drop(abandoned);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
