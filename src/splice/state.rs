//! Per-operation splice state machine.

use serde::Serialize;

/// Lifecycle of a single splice operation.
///
/// ```text
/// blocking:  Idle ─▶ BlockRequested ─▶ Blocked ─▶ Mutating ─▶ UnblockRequested ─▶ Done
/// direct:    Idle ─▶ Mutating ─▶ Done
/// any failure or abandoned block request ──────────────────────────────────────▶ Done
/// ```
///
/// `Done` is terminal: there is no retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpliceState {
    /// Constructed, nothing issued yet.
    Idle,
    /// A pad block has been asked for; waiting for a streaming thread.
    BlockRequested,
    /// Flow is paused at the block point.
    Blocked,
    /// Graph surgery in progress.
    Mutating,
    /// Surgery finished; flow is being released.
    UnblockRequested,
    /// References released.
    Done,
}

impl SpliceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SpliceState::Done)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpliceState::Idle => "idle",
            SpliceState::BlockRequested => "block-requested",
            SpliceState::Blocked => "blocked",
            SpliceState::Mutating => "mutating",
            SpliceState::UnblockRequested => "unblock-requested",
            SpliceState::Done => "done",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: SpliceState) -> bool {
        use SpliceState::*;
        match (self, next) {
            (Done, _) => false,
            (_, Done) => true,
            (Idle, BlockRequested) | (Idle, Mutating) => true,
            (BlockRequested, Blocked) => true,
            (Blocked, Mutating) => true,
            (Mutating, UnblockRequested) => true,
            _ => false,
        }
    }
}

impl Default for SpliceState {
    fn default() -> Self {
        SpliceState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::SpliceState::*;
    use super::*;

    #[test]
    fn blocking_path_is_legal() {
        let path = [Idle, BlockRequested, Blocked, Mutating, UnblockRequested, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn direct_path_skips_blocking_states() {
        assert!(Idle.can_advance_to(Mutating));
        assert!(Mutating.can_advance_to(Done));
        assert!(!Idle.can_advance_to(Blocked));
        assert!(!Mutating.can_advance_to(Blocked));
    }

    #[test]
    fn done_is_terminal() {
        assert!(Done.is_terminal());
        assert!(!Done.can_advance_to(Idle));
        assert!(!Done.can_advance_to(Done));
        assert!(BlockRequested.can_advance_to(Done));
        assert_eq!(SpliceState::default(), Idle);
    }
}
