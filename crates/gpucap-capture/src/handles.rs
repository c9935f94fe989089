//! Ownership-counted handles to wrapped objects.
//!
//! Cloning a handle adds an owner. When the last owner goes away the native
//! object is released and the id is reported dead to the resource manager.
//! Views own their resource, so a texture outlives every view of it.

use std::fmt;
use std::sync::Arc;

use gpucap_ipc::ResourceId;
use gpucap_log::Call;

use crate::device::DeviceShared;

/// Any object created through a wrapped device.
pub trait DeviceChild {
    fn id(&self) -> ResourceId;
}

pub(crate) struct HandleInner {
    pub(crate) id: ResourceId,
    device: Arc<DeviceShared>,
    _parent: Option<Arc<HandleInner>>,
}

impl HandleInner {
    pub(crate) fn new(
        id: ResourceId,
        device: Arc<DeviceShared>,
        parent: Option<Arc<HandleInner>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            device,
            _parent: parent,
        })
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.device.release_object(self.id);
    }
}

macro_rules! device_child {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            pub(crate) inner: Arc<HandleInner>,
        }

        impl $name {
            pub(crate) fn new(inner: Arc<HandleInner>) -> Self {
                Self { inner }
            }
        }

        impl DeviceChild for $name {
            fn id(&self) -> ResourceId {
                self.inner.id
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.inner.id).finish()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.inner.id == other.inner.id
            }
        }

        impl Eq for $name {}
    };
}

device_child!(
    /// A 1D, 2D or 3D texture.
    Texture
);
device_child!(Buffer);
device_child!(
    /// A render-target, depth-stencil, shader-resource or unordered-access
    /// view. Keeps its resource alive.
    View
);
device_child!(Query);

/// A closed command list and the calls recorded into it.
#[derive(Clone)]
pub struct CommandList {
    pub(crate) inner: Arc<HandleInner>,
    pub(crate) calls: Arc<[(ResourceId, Call)]>,
}

impl CommandList {
    /// Number of recorded calls, nested lists included.
    pub fn call_count(&self) -> usize {
        self.calls.len()
    }
}

impl DeviceChild for CommandList {
    fn id(&self) -> ResourceId {
        self.inner.id
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.inner.id)
            .field("calls", &self.calls.len())
            .finish()
    }
}

/// A texture or a buffer.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Texture(&'a Texture),
    Buffer(&'a Buffer),
}

impl ResourceRef<'_> {
    pub fn id(&self) -> ResourceId {
        self.inner().id
    }

    pub(crate) fn inner(&self) -> &Arc<HandleInner> {
        match self {
            Self::Texture(t) => &t.inner,
            Self::Buffer(b) => &b.inner,
        }
    }
}

impl<'a> From<&'a Texture> for ResourceRef<'a> {
    fn from(texture: &'a Texture) -> Self {
        Self::Texture(texture)
    }
}

impl<'a> From<&'a Buffer> for ResourceRef<'a> {
    fn from(buffer: &'a Buffer) -> Self {
        Self::Buffer(buffer)
    }
}
