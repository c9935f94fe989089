//! Commands sent from a client to the replay controller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::format::CompType;
use crate::state::ReplayMode;
use crate::types::{EventId, GpuCounter, ResourceId};

/// Commands that a client can send to the replay controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplayCommand {
    /// Load a capture log from disk and prepare it for replay.
    OpenCapture { path: PathBuf },

    /// Replay `[start, end]` with the given granularity.
    ReplayRange {
        start: EventId,
        end: EventId,
        mode: ReplayMode,
    },

    /// Fetch counters for every timed action in `[min_event, max_event]`.
    FetchCounters {
        counters: Vec<GpuCounter>,
        min_event: EventId,
        max_event: EventId,
    },

    /// Request the list of available counters.
    EnumerateCounters,

    /// Request the description of one counter.
    DescribeCounter(GpuCounter),

    /// Request a normalized debug view of a texture.
    GetDebugView {
        resource: ResourceId,
        comp_type: CompType,
        raw: bool,
    },

    /// Request the drawcall tree of the open capture.
    GetDrawcalls,

    /// Request current replay state.
    GetState,

    /// Shutdown the controller completely.
    Shutdown,
}
