//! Events sent from the replay controller to its client.

use serde::{Deserialize, Serialize};

use crate::state::ReplayState;
use crate::types::{
    CounterDescription, CounterResult, DebugViewInfo, DrawcallDescription, EventId, GpuCounter,
    ReplayAnomaly,
};

/// Events that the replay controller can send to its client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplayEvent {
    /// Replay state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<ReplayState>,

        /// Current state.
        current: Box<ReplayState>,
    },

    /// A capture was opened.
    CaptureOpened {
        /// Format version of the log.
        version: u32,

        /// Number of chunks in the log.
        chunk_count: usize,

        /// First event of the captured frame.
        frame_first: EventId,

        /// Last event of the captured frame.
        frame_last: EventId,

        /// Last event id in the log.
        last_event: EventId,
    },

    /// A range replay finished.
    RangeReplayed {
        /// Non-fatal problems hit along the way.
        anomalies: Vec<ReplayAnomaly>,
    },

    /// Counter values, one per timed action per requested counter.
    Counters {
        results: Vec<CounterResult>,
        anomalies: Vec<ReplayAnomaly>,
    },

    /// List of available counters.
    CounterList(Vec<GpuCounter>),

    /// Description of one counter.
    CounterDescription(CounterDescription),

    /// A debug view was produced.
    DebugView(DebugViewInfo),

    /// Drawcall tree of the open capture.
    Drawcalls(Vec<DrawcallDescription>),

    /// Error occurred.
    Error {
        /// Whether the controller can keep serving commands.
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// Controller is ready.
    Ready,

    /// Controller has shut down.
    Shutdown,
}
