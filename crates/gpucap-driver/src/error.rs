//! Error types for driver calls.

use thiserror::Error;

use crate::NativeHandle;

/// Errors a native driver call can return.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Windows API error.
    #[error("Windows API error: {message}")]
    WindowsApi {
        message: String,
        #[cfg(windows)]
        #[source]
        source: Option<windows::core::Error>,
    },

    /// Handle does not name a live object of the expected kind.
    #[error("Invalid handle {0}")]
    InvalidHandle(NativeHandle),

    /// Arguments rejected by the driver.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Entry point is not available on this device.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Call is only valid on an immediate or only on a deferred context.
    #[error("Wrong context type for {0}")]
    WrongContext(&'static str),

    /// Device was removed or reset.
    #[error("Device removed")]
    DeviceRemoved,
}

impl DriverError {
    /// Returns true for the interface's "not supported" signal.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for DriverError {
    fn from(err: windows::core::Error) -> Self {
        Self::WindowsApi {
            message: err.message().to_string(),
            source: Some(err),
        }
    }
}
