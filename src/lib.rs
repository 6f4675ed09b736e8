//! Live splice engine for a streaming audio player.
//!
//! Optional processing stages can be inserted into or removed from the
//! output graph while audio flows:
//!
//! - [`graph`]: the pipeline engine interface and an in-memory engine
//! - [`splice`]: the block/unblock splice machinery and its coordinator
//! - [`capability`]: backend capability traits and splice notifications
//! - [`player`]: the output graph and a backend implementing both splices
//! - [`config`]: persisted settings

pub mod capability;
pub mod config;
pub mod graph;
pub mod player;
pub mod splice;
