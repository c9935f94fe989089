//! Replay state machine types.

use serde::{Deserialize, Serialize};

use crate::types::{EventId, ResourceId};

/// Granularity of one range replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayMode {
    /// Every chunk from start to end inclusive.
    Full,

    /// Every chunk up to, but not including, the action at the end event.
    UpToDrawExclusive,

    /// Only the action at the end event.
    DrawOnly,
}

impl ReplayMode {
    /// Returns the display name for this mode.
    pub fn name(self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::UpToDrawExclusive => "UpToDrawExclusive",
            Self::DrawOnly => "DrawOnly",
        }
    }

    /// Inclusive event interval executed for `[start, end]` in this mode, or
    /// `None` when the interval is empty.
    pub fn interval(self, start: EventId, end: EventId) -> Option<(EventId, EventId)> {
        let (first, last) = match self {
            Self::Full => (start, end),
            Self::UpToDrawExclusive => (start, end.checked_sub(1)?),
            Self::DrawOnly => (end, end),
        };
        (first <= last).then_some((first, last))
    }
}

/// The current state of the replay engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ReplayState {
    /// No range in flight.
    #[default]
    Idle,

    /// Applying initial contents and restoring bindings for a range.
    Preparing {
        /// First event of the range.
        start: EventId,

        /// Last event of the range.
        end: EventId,
    },

    /// Chunk cursor advancing through the range.
    Executing {
        /// Event currently being applied.
        cursor: EventId,

        /// Last event of the range.
        end: EventId,
    },

    /// The last range completed.
    Done {
        /// Last event applied.
        last: EventId,

        /// Number of non-fatal anomalies collected.
        anomalies: usize,
    },

    /// The last range was aborted by a resolution failure or corrupt chunk.
    Faulted {
        /// Event that could not be applied.
        event_id: EventId,

        /// Resource that could not be resolved, if any.
        resource: Option<ResourceId>,

        /// Error message.
        message: String,
    },
}

impl ReplayState {
    /// Returns true if the engine is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true while initial contents are being applied.
    pub fn is_preparing(&self) -> bool {
        matches!(self, Self::Preparing { .. })
    }

    /// Returns true while chunks are executing.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Executing { .. })
    }

    /// Returns true if the last range completed.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Returns true if the last range faulted.
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }

    /// Returns true if a new range may be requested.
    pub fn accepts_range(&self) -> bool {
        !self.is_preparing() && !self.is_executing()
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Preparing { .. } => "Preparing",
            Self::Executing { .. } => "Executing",
            Self::Done { .. } => "Done",
            Self::Faulted { .. } => "Faulted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_intervals() {
        assert_eq!(ReplayMode::Full.interval(3, 9), Some((3, 9)));
        assert_eq!(ReplayMode::UpToDrawExclusive.interval(3, 9), Some((3, 8)));
        assert_eq!(ReplayMode::DrawOnly.interval(3, 9), Some((9, 9)));
        assert_eq!(ReplayMode::UpToDrawExclusive.interval(4, 4), None);
        assert_eq!(ReplayMode::UpToDrawExclusive.interval(0, 0), None);
        assert_eq!(ReplayMode::Full.interval(5, 4), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ReplayState::Idle.name(), "Idle");
        let faulted = ReplayState::Faulted {
            event_id: 4,
            resource: None,
            message: "bad".into(),
        };
        assert!(faulted.is_faulted());
        assert!(faulted.accepts_range());
        assert!(!ReplayState::Executing { cursor: 1, end: 2 }.accepts_range());
    }
}
