//! Call interception and resource management for gpucap.
//!
//! [`WrappedDevice`] and [`WrappedContext`] sit in front of a native driver.
//! Every call is forwarded first and, once the driver has accepted it, is
//! recorded as a chunk while a capture is running. Object identity is kept by
//! the [`ResourceManager`], which also stores and applies the contents
//! resources must hold at the start of a replayed range.

mod bindings;
mod contents;
mod context;
mod device;
mod error;
mod handles;
mod initial;
mod resource;
mod usage;

pub use bindings::{BindingState, CommandListTracker};
pub use contents::{clear_contents, clear_view_format, read_contents, write_contents};
pub use context::{Mapped, WrappedContext};
pub use device::WrappedDevice;
pub use error::CaptureError;
pub use handles::{Buffer, CommandList, DeviceChild, Query, ResourceRef, Texture, View};
pub use initial::{DefaultPolicy, InitialContentsPlan, InitialContentsPolicy};
pub use resource::{ResourceManager, ResourceRecord};
pub use usage::{Access, AccessKind, UsageIndex};

/// Result type for wrapped calls.
pub type CaptureResult<T> = Result<T, CaptureError>;
