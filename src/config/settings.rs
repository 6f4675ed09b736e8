//! Splice engine settings, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Missing keys fall back to their defaults, so a settings file only needs
//! the values it changes.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::graph::OverflowPolicy;

// ---------------------------------------------------------------------------
// BranchConfig
// ---------------------------------------------------------------------------

/// Bounded queue placed at the head of every tee branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    /// Maximum buffers held between the tee and the branch consumer.
    pub max_buffers: usize,
    /// What a full queue does with the next buffer.
    pub overflow: OverflowPolicy,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            max_buffers: 3,
            overflow: OverflowPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputConfig
// ---------------------------------------------------------------------------

/// Shape of the always-present output graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Bound of the queue in front of the main sink.
    pub main_queue_buffers: usize,
    /// Linear gain applied ahead of the filter fixture.
    pub volume: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            main_queue_buffers: 10,
            volume: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

/// Logging defaults applied when `RUST_LOG` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `env_logger` filter string (e.g. `"info"`, `"live_splice=debug"`).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SpliceConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```toml
/// [branch]
/// max_buffers = 3
/// overflow = "drop-oldest"
///
/// [output]
/// main_queue_buffers = 10
/// volume = 1.0
///
/// [log]
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpliceConfig {
    pub branch: BranchConfig,
    pub output: OutputConfig,
    pub log: LogConfig,
}

impl SpliceConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(SpliceConfig::default())` when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        log::debug!("config: saved {}", path.display());
        Ok(())
    }

    /// Reject values the output graph cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.branch.max_buffers == 0 {
            bail!("branch.max_buffers must be at least 1");
        }
        if self.output.main_queue_buffers == 0 {
            bail!("output.main_queue_buffers must be at least 1");
        }
        if !self.output.volume.is_finite() || self.output.volume < 0.0 {
            bail!("output.volume must be a non-negative number");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
