//! Streaming-engine abstraction used by the splice engine.
//!
//! The splice engine never moves audio itself.  It drives a streaming engine
//! (a graph of nodes joined by pad links) through the [`Engine`] trait, which
//! exposes only the primitives graph surgery needs: element/bin creation,
//! ghost and request pads, link/unlink, container membership, run state,
//! pad blocking and event injection.
//!
//! # Architecture
//!
//! ```text
//!  splice::begin_splice ──request_block(pad, BlockWaiter)──▶ Engine
//!                                                              │
//!           streaming thread hits the blocked pad ◀────────────┘
//!                  │
//!                  └─▶ BlockWaiter::resolve(pad) ──▶ BlockTarget::blocked
//! ```
//!
//! [`memory::MemoryGraph`] is the in-process implementation used by the
//! player, the demo binary and the tests.

pub mod memory;
pub mod queue;
pub mod source;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{FlowError, GraphSnapshot, GraphStats, MemoryGraph, SinkProbe};
pub use queue::{BranchQueue, OverflowPolicy};
pub use source::SourceThread;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a node (element or bin) inside an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u64);

/// Identifier of a pad (connection point) inside an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PadId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad#{}", self.0)
    }
}

/// Direction of data through a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PadDirection {
    /// Data leaves the node through this pad.
    Src,
    /// Data enters the node through this pad.
    Sink,
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Run state of a node.
///
/// Ordered so that `state >= RunState::Paused` means "accepts data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunState {
    /// Resources released; the node refuses data.
    Null,
    /// Allocated but not processing.
    Ready,
    /// Prerolled; accepts data but the clock is not running.
    Paused,
    /// Fully running.
    Playing,
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Null
    }
}

// ---------------------------------------------------------------------------
// Data carried through the graph
// ---------------------------------------------------------------------------

/// A block of interleaved audio samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    /// Presentation timestamp in samples since the start of the stream.
    pub pts: u64,
    pub samples: Vec<f32>,
}

impl Buffer {
    pub fn new(pts: u64, samples: Vec<f32>) -> Self {
        Self { pts, samples }
    }
}

/// Out-of-band control event travelling alongside buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Event {
    /// Re-establishes timing continuity downstream of a freshly spliced path.
    Resync,
}

/// Either a buffer or an event, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Buffer(Buffer),
    Event(Event),
}

// ---------------------------------------------------------------------------
// ElementSpec / Element
// ---------------------------------------------------------------------------

/// What kind of element to create with [`Engine::create_element`].
#[derive(Debug, Clone, PartialEq)]
pub enum ElementSpec {
    /// Has only a `src` pad; fed by a streaming thread.
    Source,
    /// Passes data through unchanged (format adapters, markers).
    Identity,
    /// Multiplies every sample by a constant.
    Gain(f32),
    /// One `sink` pad, any number of request `src_N` pads.
    Tee,
    /// Bounded thread boundary between a tee and a branch consumer.
    Queue {
        max_buffers: usize,
        overflow: OverflowPolicy,
    },
    /// Terminal consumer; records what reaches it.
    Sink,
}

struct ElementInner {
    id: NodeId,
    name: String,
}

/// Counted handle to a node owned by an [`Engine`].
///
/// Cloning the handle is the Rust counterpart of taking a reference on the
/// node; [`ref_count`](Self::ref_count) exposes the number of live handles so
/// callers can verify that a splice released everything it took.
#[derive(Clone)]
pub struct Element {
    inner: Arc<ElementInner>,
}

impl Element {
    /// Wrap an engine node.  Only engines should call this.
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ElementInner {
                id,
                name: name.into(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of live handles sharing this element.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by [`Engine`] primitives.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("no such node: {0}")]
    NoSuchNode(NodeId),

    #[error("no such pad: {0}")]
    NoSuchPad(PadId),

    #[error("{0} is not a container")]
    NotAContainer(NodeId),

    #[error("{node} already belongs to {parent}")]
    AlreadyParented { node: NodeId, parent: NodeId },

    #[error("{node} is not a child of {container}")]
    NotAChild { node: NodeId, container: NodeId },

    #[error("{0} does not accept request pads")]
    NoRequestPads(NodeId),

    #[error("{0} has the wrong direction for this operation")]
    WrongDirection(PadId),

    #[error("{0} is already linked")]
    AlreadyLinked(PadId),

    #[error("{src} is not linked to {sink}")]
    NotLinked { src: PadId, sink: PadId },

    #[error("link {src} -> {sink} refused")]
    LinkRefused { src: PadId, sink: PadId },

    #[error("unlink {src} -> {sink} refused")]
    UnlinkRefused { src: PadId, sink: PadId },

    #[error("state change of {0} refused")]
    StateChangeRefused(NodeId),

    #[error("{0} already has a block in progress")]
    AlreadyBlocked(PadId),

    #[error("{0} is not a ghost pad")]
    NotAGhost(PadId),
}

// ---------------------------------------------------------------------------
// Block confirmation
// ---------------------------------------------------------------------------

/// Receiver side of a pad block request.
///
/// The engine moves the [`BlockWaiter`] into its pad state and resolves it on
/// whichever streaming thread first reaches the blocked pad.  Implementations
/// must not do graph surgery inline: they hand the confirmation off (for the
/// splice engine, over a channel to the coordinator) and return.
pub trait BlockTarget: Send {
    /// Flow through `pad` is now paused.
    fn blocked(self: Box<Self>, pad: PadId);

    /// The engine dropped the request without ever blocking.
    fn abandoned(self: Box<Self>);
}

/// Owned token handed to [`Engine::request_block`].
///
/// Resolving consumes it.  Dropping it unresolved reports the request as
/// abandoned, so whatever the token carries is always released exactly once.
pub struct BlockWaiter {
    target: Option<Box<dyn BlockTarget>>,
}

impl BlockWaiter {
    pub fn new(target: Box<dyn BlockTarget>) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// Confirm that `pad` is blocked.
    pub fn resolve(mut self, pad: PadId) {
        if let Some(target) = self.target.take() {
            target.blocked(pad);
        }
    }
}

impl Drop for BlockWaiter {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.abandoned();
        }
    }
}

impl fmt::Debug for BlockWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockWaiter")
            .field("pending", &self.target.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// Primitives the splice engine consumes from the streaming engine.
///
/// Object-safe and `Send + Sync` so it can be held as `Arc<dyn Engine>` and
/// called from the coordinator task, the caller's thread and streaming
/// threads alike.
pub trait Engine: Send + Sync {
    /// Create a free-standing element with static pads per `spec`.
    fn create_element(&self, spec: ElementSpec, name: Option<&str>)
        -> Result<Element, EngineError>;

    /// Create an empty container.
    fn create_bin(&self, name: Option<&str>) -> Result<Element, EngineError>;

    /// Expose `target` (a pad of a child) on `bin` under `name`.
    fn add_ghost_pad(&self, bin: NodeId, name: &str, target: PadId)
        -> Result<PadId, EngineError>;

    /// Allocate a new `src_N` pad on a tee.
    fn request_pad(&self, node: NodeId) -> Result<PadId, EngineError>;

    /// Give back a pad obtained from [`request_pad`](Self::request_pad).
    fn release_request_pad(&self, pad: PadId) -> Result<(), EngineError>;

    /// Look up a named pad on a node.
    fn static_pad(&self, node: NodeId, name: &str) -> Option<PadId>;

    /// The pad linked to `pad`, if any.
    fn peer(&self, pad: PadId) -> Option<PadId>;

    /// The container holding `node`, if any.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn add_child(&self, container: NodeId, child: NodeId) -> Result<(), EngineError>;

    fn remove_child(&self, container: NodeId, child: NodeId) -> Result<(), EngineError>;

    /// Link a src pad to a sink pad.
    fn link(&self, src: PadId, sink: PadId) -> Result<(), EngineError>;

    /// Break an existing src→sink link.
    fn unlink(&self, src: PadId, sink: PadId) -> Result<(), EngineError>;

    /// Set the run state of a node (recursively for containers).
    fn set_state(&self, node: NodeId, state: RunState) -> Result<(), EngineError>;

    fn state(&self, node: NodeId) -> Option<RunState>;

    /// Ask for flow through `pad` to be paused.  Never blocks the caller.
    ///
    /// The waiter is resolved on the streaming thread that next reaches the
    /// pad.  On refusal the waiter is dropped, which reports it abandoned.
    fn request_block(&self, pad: PadId, waiter: BlockWaiter) -> Result<(), EngineError>;

    /// Let flow through `pad` resume.
    fn unblock(&self, pad: PadId) -> Result<(), EngineError>;

    /// Inject an event into `pad`, travelling downstream.
    fn send_event(&self, pad: PadId, event: Event) -> Result<(), EngineError>;

    /// Release a node and everything it contains.  It must be unparented.
    fn destroy(&self, node: NodeId) -> Result<(), EngineError>;
}

// Compile-time assertion: Arc<dyn Engine> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Arc<dyn Engine>) {}
};
