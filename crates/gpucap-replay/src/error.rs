//! Error types for replay.

use thiserror::Error;

use gpucap_capture::CaptureError;
use gpucap_driver::DriverError;
use gpucap_ipc::{EventId, GpuCounter, ResourceId};
use gpucap_log::LogError;

/// Errors that abort a replay request.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Capture layer error: {0}")]
    Capture(#[from] CaptureError),

    /// A chunk names an object that cannot be resolved.
    #[error("Event {event_id}: cannot resolve {resource}: {message}")]
    Resolution {
        event_id: EventId,
        resource: ResourceId,
        message: String,
    },

    /// A chunk does not decode.
    #[error("Event {event_id}: corrupt chunk: {reason}")]
    Corrupt { event_id: EventId, reason: String },

    /// Log has no begin-capture marker.
    #[error("Log contains no captured frame")]
    NoFrame,

    #[error("Event range [{start}, {end}] is empty or outside the captured frame")]
    InvalidRange { start: EventId, end: EventId },

    #[error("A range replay is already in progress")]
    Busy,

    #[error("No capture is open")]
    NoCapture,

    #[error("Unknown counter {0:?}")]
    UnknownCounter(GpuCounter),
}

impl ReplayError {
    /// Event at which the replay faulted, if any.
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            Self::Resolution { event_id, .. } | Self::Corrupt { event_id, .. } => Some(*event_id),
            _ => None,
        }
    }

    /// Resource that failed to resolve, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Self::Resolution { resource, .. } => Some(*resource),
            _ => None,
        }
    }
}
