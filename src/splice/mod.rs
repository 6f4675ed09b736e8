//! Live splice engine.
//!
//! Inserts and removes optional stages (filters and tee branches) in a
//! running graph without losing buffers:
//!
//! ```text
//!            begin_splice
//!                 │
//!     ┌───────────┴───────────┐
//!  direct (flow idle)     blocking (flow live)
//!     │                       │ request_block ─▶ streaming thread confirms
//!     │                       ▼
//!     │               SpliceCoordinator
//!     ▼                       ▼
//!  filter::insert / remove     tee::attach / detach
//!                 │
//!                 ▼
//!    resync + unblock (blocking only), notify observers, release references
//! ```
//!
//! Splices on one [`Fixture`] are serialised: one operation in flight, the
//! rest in FIFO order behind it.

pub mod block;
pub mod coordinator;
pub mod error;
pub mod fixture;
pub mod host;
pub mod operation;
pub mod state;

mod filter;
mod subbin;
mod tee;

pub use block::{begin_splice, SpliceStatus};
pub use coordinator::SpliceCoordinator;
pub use error::SpliceError;
pub use fixture::{Fixture, FixtureKind};
pub use host::SpliceHost;
pub use operation::{SpliceKind, SpliceOperation};
pub use state::SpliceState;
