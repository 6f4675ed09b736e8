//! Playback state as far as splicing is concerned.

use serde::{Deserialize, Serialize};

use crate::graph::RunState;

/// The player's transport state.
///
/// The splice engine only needs one bit of it: whether data is flowing.
/// Splices pause flow around the surgery only while [`Playing`].
///
/// ```text
/// Stopped ──play──▶ Playing ──pause──▶ Paused ──play──▶ Playing
///    ▲                 │                  │
///    └──────stop───────┴──────stop────────┘
/// ```
///
/// [`Playing`]: PlaybackState::Playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Stopped,
    Paused,
    Playing,
}

impl PlaybackState {
    /// Whether streaming threads are carrying data through the output.
    pub fn is_flowing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }

    /// Run state applied to the output graph.
    pub fn run_state(&self) -> RunState {
        match self {
            PlaybackState::Stopped => RunState::Ready,
            PlaybackState::Paused => RunState::Paused,
            PlaybackState::Playing => RunState::Playing,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PlaybackState::Stopped => "Stopped",
            PlaybackState::Paused => "Paused",
            PlaybackState::Playing => "Playing",
        }
    }
}

impl Default for PlaybackState {
    fn default() -> Self {
        PlaybackState::Stopped
    }
}
