//! Configuration module for the live splice engine.
//!
//! Provides `SpliceConfig` (top-level settings), sub-configs for branch
//! queues, the output graph and logging, `AppPaths` for the cross-platform
//! settings location, and TOML persistence via `SpliceConfig::load` /
//! `SpliceConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{BranchConfig, LogConfig, OutputConfig, SpliceConfig};
