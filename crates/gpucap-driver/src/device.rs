//! The driver seam: device and context traits every backend implements.

use std::sync::Arc;

use bytes::Bytes;

use gpucap_ipc::{
    BufferDesc, ClearFlags, DeviceCaps, DispatchArgs, Format, QueryData, QueryKind, TextureDesc,
    Triangle, ViewDesc,
};

use crate::{DriverError, DriverResult, NativeHandle};

/// Object counts a backend keeps for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub textures_created: u64,
    pub buffers_created: u64,
    pub views_created: u64,
    pub queries_created: u64,
    pub live_objects: u64,
}

/// A native device: creates objects and owns the immediate context.
pub trait DriverDevice: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn caps(&self) -> DeviceCaps;

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<NativeHandle>;

    fn create_buffer(
        &self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<NativeHandle>;

    fn create_view(&self, resource: NativeHandle, desc: &ViewDesc) -> DriverResult<NativeHandle>;

    fn create_query(&self, kind: QueryKind) -> DriverResult<NativeHandle>;

    fn create_deferred_context(&self) -> DriverResult<Arc<dyn DriverContext>>;

    /// The device's single immediate context.
    fn immediate_context(&self) -> Arc<dyn DriverContext>;

    /// Drops the caller's reference to an object. The handle may be handed
    /// out again once the object is gone.
    fn release(&self, handle: NativeHandle);

    fn set_debug_name(&self, _handle: NativeHandle, _name: &str) {}

    fn stats(&self) -> DriverStats {
        DriverStats::default()
    }
}

/// A native context. Immediate contexts execute, deferred contexts record
/// until their work is finished into a command list.
pub trait DriverContext: Send + Sync {
    fn is_deferred(&self) -> bool;

    fn set_render_targets(
        &self,
        render_targets: &[NativeHandle],
        depth_stencil: Option<NativeHandle>,
    ) -> DriverResult<()>;

    fn set_unordered_access(&self, views: &[NativeHandle]) -> DriverResult<()>;

    fn clear_render_target(&self, view: NativeHandle, color: [f32; 4]) -> DriverResult<()>;

    fn clear_depth_stencil(
        &self,
        view: NativeHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) -> DriverResult<()>;

    fn draw(&self, triangles: &[Triangle]) -> DriverResult<()>;

    fn dispatch(&self, args: &DispatchArgs) -> DriverResult<()>;

    fn copy_resource(&self, dst: NativeHandle, src: NativeHandle) -> DriverResult<()>;

    fn update_subresource(
        &self,
        dst: NativeHandle,
        subresource: u32,
        data: &[u8],
    ) -> DriverResult<()>;

    fn resolve_subresource(
        &self,
        dst: NativeHandle,
        src: NativeHandle,
        format: Format,
    ) -> DriverResult<()>;

    /// Reads back one subresource. Immediate contexts only.
    fn read_subresource(&self, resource: NativeHandle, subresource: u32) -> DriverResult<Bytes>;

    /// Writes one subresource through a CPU map.
    fn write_subresource(
        &self,
        resource: NativeHandle,
        subresource: u32,
        data: &[u8],
    ) -> DriverResult<()>;

    fn begin_query(&self, query: NativeHandle) -> DriverResult<()>;

    fn end_query(&self, query: NativeHandle) -> DriverResult<()>;

    /// Polls a query. `Ok(None)` means the result is not available yet.
    fn query_data(&self, query: NativeHandle) -> DriverResult<Option<QueryData>>;

    /// Submits pending work.
    fn flush(&self) {}

    /// Unbinds everything.
    fn clear_state(&self);

    /// Closes recorded work into a command list. Deferred contexts only.
    fn finish_command_list(&self, restore_state: bool) -> DriverResult<NativeHandle>;

    fn execute_command_list(&self, list: NativeHandle, restore_state: bool) -> DriverResult<()>;

    fn push_marker(&self, _name: &str) {}

    fn pop_marker(&self) {}

    fn set_marker(&self, _name: &str) {}

    /// Marks contents as undefined. Newer interface generations only.
    fn discard_resource(&self, _resource: NativeHandle) -> DriverResult<()> {
        Err(DriverError::NotSupported("DiscardResource".into()))
    }

    /// Clears any view to a color. Newer interface generations only.
    fn clear_view(&self, _view: NativeHandle, _color: [f32; 4]) -> DriverResult<()> {
        Err(DriverError::NotSupported("ClearView".into()))
    }
}
