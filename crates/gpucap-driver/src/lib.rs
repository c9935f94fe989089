//! Native driver seam for gpucap.
//!
//! Everything above this crate talks to a GPU through [`DriverDevice`] and
//! [`DriverContext`]. Two backends exist: a deterministic software
//! rasterizer that runs everywhere, and Direct3D 11 on Windows.

mod device;
mod error;
mod handle;
pub mod soft;
mod surface;

#[cfg(windows)]
pub mod d3d11;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use device::{DriverContext, DriverDevice, DriverStats};
pub use error::DriverError;
pub use handle::NativeHandle;
pub use soft::{SoftConfig, SoftDevice};
pub use surface::{HeadlessSurfaces, PresentationSurface, SurfaceHandle};

/// Result type for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Available driver backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// CPU rasterizer.
    #[default]
    Soft,
    /// Hardware Direct3D 11 (Windows only).
    D3D11,
}

impl DriverKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::D3D11 => "d3d11",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" | "software" => Ok(Self::Soft),
            "d3d11" => Ok(Self::D3D11),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown driver '{other}'"
            ))),
        }
    }
}

/// Creates a device of the requested kind.
pub fn create_driver(kind: DriverKind, config: SoftConfig) -> DriverResult<Arc<dyn DriverDevice>> {
    match kind {
        DriverKind::Soft => Ok(Arc::new(SoftDevice::new(config))),
        #[cfg(windows)]
        DriverKind::D3D11 => Ok(Arc::new(d3d11::D3D11Device::new()?)),
        #[cfg(not(windows))]
        DriverKind::D3D11 => Err(DriverError::NotSupported(
            "Direct3D 11 is only available on Windows".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("soft".parse::<DriverKind>().unwrap(), DriverKind::Soft);
        assert_eq!("D3D11".parse::<DriverKind>().unwrap(), DriverKind::D3D11);
        assert!("vulkan".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_create_soft_driver() {
        let device = create_driver(DriverKind::Soft, SoftConfig::default()).unwrap();
        assert_eq!(device.name(), "soft");
        assert!(!device.immediate_context().is_deferred());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_d3d11_unavailable_off_windows() {
        let err = create_driver(DriverKind::D3D11, SoftConfig::default())
            .err()
            .unwrap();
        assert!(err.is_not_supported());
    }
}
