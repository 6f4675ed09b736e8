//! Player backend built on the splice engine.
//!
//! # Architecture
//!
//! ```text
//! Player ── FilterSplice / TeeSplice ──▶ begin_splice(fixture, element)
//!   │                                         │
//!   ├─ Output (volume, filters, convert, tee, queue, sink)
//!   │    ├─ filter fixture: "filters" container, marker "filter-marker"
//!   │    └─ tee fixture:    "tee" inside the "output" container
//!   │
//!   └─ waiting lists: requests made before the output exists
//! ```
//!
//! Playback state picks the splice path: only `Playing` blocks flow around
//! the surgery.

pub mod backend;
pub mod output;
pub mod state;

pub use backend::Player;
pub use output::Output;
pub use state::PlaybackState;
