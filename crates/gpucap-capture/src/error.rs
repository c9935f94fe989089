//! Error types for the capture layer.

use thiserror::Error;

use gpucap_driver::DriverError;
use gpucap_ipc::ResourceId;
use gpucap_log::LogError;

/// Errors returned by wrapped calls and the resource manager.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The real driver call failed. Nothing was recorded.
    #[error("Driver call failed: {0}")]
    Driver(#[source] DriverError),

    /// Entry point is not backed on this device.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Id was never registered.
    #[error("Unknown resource {0}")]
    UnknownResource(ResourceId),

    /// Id was registered but has been released.
    #[error("Resource {0} has been released")]
    Released(ResourceId),

    /// Id names an object of another kind.
    #[error("Resource {id} is not a {expected}")]
    WrongKind { id: ResourceId, expected: &'static str },

    /// Id is already registered.
    #[error("Resource {0} registered twice")]
    Duplicate(ResourceId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A capture is already in progress")]
    AlreadyCapturing,

    #[error("No capture in progress")]
    NotCapturing,

    #[error("Log error: {0}")]
    Log(#[from] LogError),
}

impl From<DriverError> for CaptureError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotSupported(what) => Self::NotSupported(what),
            other => Self::Driver(other),
        }
    }
}

impl CaptureError {
    /// Id involved in a resolution failure, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Self::UnknownResource(id)
            | Self::Released(id)
            | Self::Duplicate(id)
            | Self::WrongKind { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Returns true for failures to resolve an id.
    pub fn is_resolution(&self) -> bool {
        self.resource().is_some()
    }
}
