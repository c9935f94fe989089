//! Wrapped immediate and deferred contexts.
//!
//! Calls are forwarded to the real context first. Only a call the driver
//! accepted is recorded: immediate contexts append to the device's log while
//! a capture runs, deferred contexts keep their calls with the command list
//! they end up in, and those calls are spliced into the log where the list is
//! executed.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use gpucap_driver::{DriverContext, DriverError};
use gpucap_ipc::{
    ClearFlags, DispatchArgs, Format, InterfaceVersion, MapMode, QueryData, ResourceDesc,
    ResourceId, Triangle, Usage,
};
use gpucap_log::Call;

use crate::bindings::BindingState;
use crate::device::DeviceShared;
use crate::handles::{CommandList, DeviceChild, HandleInner, Query, ResourceRef, View};
use crate::{CaptureError, CaptureResult};

#[derive(Default)]
struct ContextState {
    bindings: BindingState,
    /// Calls recorded since the last finished command list.
    pending: Vec<(ResourceId, Call)>,
    mapped: HashSet<(ResourceId, u32)>,
}

struct ContextInner {
    id: ResourceId,
    device: Arc<DeviceShared>,
    driver: Arc<dyn DriverContext>,
    /// Deferred contexts own an id that dies with the last clone.
    _handle: Option<Arc<HandleInner>>,
    state: Mutex<ContextState>,
}

/// CPU view of one mapped subresource. Hand it back to
/// [`WrappedContext::unmap`] to commit writes.
#[derive(Debug)]
pub struct Mapped {
    resource: ResourceId,
    subresource: u32,
    mode: MapMode,
    data: Vec<u8>,
}

impl Mapped {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn subresource(&self) -> u32 {
        self.subresource
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A wrapped immediate or deferred context.
#[derive(Clone)]
pub struct WrappedContext {
    inner: Arc<ContextInner>,
}

impl DeviceChild for WrappedContext {
    fn id(&self) -> ResourceId {
        self.inner.id
    }
}

impl std::fmt::Debug for WrappedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedContext")
            .field("id", &self.inner.id)
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

impl WrappedContext {
    pub(crate) fn immediate(device: Arc<DeviceShared>, driver: Arc<dyn DriverContext>) -> Self {
        Self::build(ResourceId::NULL, device, driver, None)
    }

    pub(crate) fn deferred(
        device: Arc<DeviceShared>,
        driver: Arc<dyn DriverContext>,
        handle: Arc<HandleInner>,
    ) -> Self {
        Self::build(handle.id, device, driver, Some(handle))
    }

    fn build(
        id: ResourceId,
        device: Arc<DeviceShared>,
        driver: Arc<dyn DriverContext>,
        handle: Option<Arc<HandleInner>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                device,
                driver,
                _handle: handle,
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.inner.driver.is_deferred()
    }

    /// Current bindings, by view id.
    pub fn bindings(&self) -> BindingState {
        self.inner.state.lock().bindings.clone()
    }

    fn record(&self, state: &mut ContextState, call: Call) {
        trace!(context = %self.inner.id, call = call.chunk_type().name(), "Recorded call");
        if self.is_deferred() {
            state.pending.push((self.inner.id, call));
        } else {
            self.inner.device.record(ResourceId::NULL, call);
        }
    }

    fn native(&self, id: ResourceId) -> CaptureResult<gpucap_driver::NativeHandle> {
        self.inner.device.resources.resolve(id)
    }

    fn mark_written(&self, views: impl IntoIterator<Item = ResourceId>) {
        let resources = &self.inner.device.resources;
        for view in views {
            if let Ok(resource) = resources.underlying(view) {
                resources.mark_written(resource);
            }
        }
    }

    pub fn set_render_targets(
        &self,
        render_targets: &[&View],
        depth_stencil: Option<&View>,
    ) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let rt_ids: Vec<_> = render_targets.iter().map(|v| v.id()).collect();
        let ds_id = depth_stencil.map_or(ResourceId::NULL, |v| v.id());
        let natives = rt_ids
            .iter()
            .map(|id| self.native(*id))
            .collect::<CaptureResult<Vec<_>>>()?;
        let ds_native = depth_stencil.map(|v| self.native(v.id())).transpose()?;
        self.inner.device.forward(
            "SetRenderTargets",
            self.inner.driver.set_render_targets(&natives, ds_native),
        )?;
        state.bindings.render_targets = rt_ids.clone();
        state.bindings.depth_stencil = ds_id;
        self.record(
            &mut state,
            Call::SetRenderTargets {
                render_targets: rt_ids,
                depth_stencil: ds_id,
            },
        );
        Ok(())
    }

    pub fn set_unordered_access(&self, views: &[&View]) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let ids: Vec<_> = views.iter().map(|v| v.id()).collect();
        let natives = ids
            .iter()
            .map(|id| self.native(*id))
            .collect::<CaptureResult<Vec<_>>>()?;
        self.inner.device.forward(
            "SetUnorderedAccess",
            self.inner.driver.set_unordered_access(&natives),
        )?;
        state.bindings.unordered_access = ids.clone();
        self.record(&mut state, Call::SetUnorderedAccess { views: ids });
        Ok(())
    }

    pub fn clear_render_target_view(&self, view: &View, color: [f32; 4]) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(view.id())?;
        self.inner.device.forward(
            "ClearRenderTargetView",
            self.inner.driver.clear_render_target(native, color),
        )?;
        self.mark_written([view.id()]);
        self.record(
            &mut state,
            Call::ClearRenderTargetView {
                view: view.id(),
                color,
            },
        );
        Ok(())
    }

    pub fn clear_depth_stencil_view(
        &self,
        view: &View,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(view.id())?;
        self.inner.device.forward(
            "ClearDepthStencilView",
            self.inner
                .driver
                .clear_depth_stencil(native, flags, depth, stencil),
        )?;
        self.mark_written([view.id()]);
        self.record(
            &mut state,
            Call::ClearDepthStencilView {
                view: view.id(),
                flags,
                depth,
                stencil,
            },
        );
        Ok(())
    }

    /// Clears any render-target or unordered-access view.
    pub fn clear_view(&self, view: &View, color: [f32; 4]) -> CaptureResult<()> {
        if !self.inner.device.supports(InterfaceVersion::V3) {
            return Err(self.inner.device.unsupported("ClearView", InterfaceVersion::V3));
        }
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(view.id())?;
        self.inner
            .device
            .forward("ClearView", self.inner.driver.clear_view(native, color))?;
        self.mark_written([view.id()]);
        self.record(
            &mut state,
            Call::ClearView {
                view: view.id(),
                color,
            },
        );
        Ok(())
    }

    /// Marks a resource's contents as undefined.
    pub fn discard_resource<'a>(&self, resource: impl Into<ResourceRef<'a>>) -> CaptureResult<()> {
        if !self.inner.device.supports(InterfaceVersion::V2) {
            return Err(self
                .inner
                .device
                .unsupported("DiscardResource", InterfaceVersion::V2));
        }
        let id = resource.into().id();
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(id)?;
        self.inner.device.forward(
            "DiscardResource",
            self.inner.driver.discard_resource(native),
        )?;
        self.record(&mut state, Call::DiscardResource { id });
        Ok(())
    }

    pub fn draw(&self, triangles: &[Triangle]) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        self.inner
            .device
            .forward("Draw", self.inner.driver.draw(triangles))?;
        self.mark_written(state.bindings.draw_targets().collect::<Vec<_>>());
        self.record(
            &mut state,
            Call::Draw {
                triangles: triangles.to_vec(),
            },
        );
        Ok(())
    }

    pub fn dispatch(&self, args: DispatchArgs) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        self.inner
            .device
            .forward("Dispatch", self.inner.driver.dispatch(&args))?;
        self.mark_written(state.bindings.unordered_access.clone());
        self.record(&mut state, Call::Dispatch { args });
        Ok(())
    }

    pub fn copy_resource<'a, 'b>(
        &self,
        dst: impl Into<ResourceRef<'a>>,
        src: impl Into<ResourceRef<'b>>,
    ) -> CaptureResult<()> {
        let (dst, src) = (dst.into().id(), src.into().id());
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let (dst_native, src_native) = (self.native(dst)?, self.native(src)?);
        self.inner.device.forward(
            "CopyResource",
            self.inner.driver.copy_resource(dst_native, src_native),
        )?;
        self.mark_written([dst]);
        self.record(&mut state, Call::CopyResource { dst, src });
        Ok(())
    }

    pub fn update_subresource<'a>(
        &self,
        dst: impl Into<ResourceRef<'a>>,
        subresource: u32,
        data: &[u8],
    ) -> CaptureResult<()> {
        let dst = dst.into().id();
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(dst)?;
        self.inner.device.forward(
            "UpdateSubresource",
            self.inner.driver.update_subresource(native, subresource, data),
        )?;
        self.mark_written([dst]);
        self.record(
            &mut state,
            Call::UpdateSubresource {
                dst,
                subresource,
                data: Bytes::copy_from_slice(data),
            },
        );
        Ok(())
    }

    pub fn resolve_subresource<'a, 'b>(
        &self,
        dst: impl Into<ResourceRef<'a>>,
        src: impl Into<ResourceRef<'b>>,
        format: Format,
    ) -> CaptureResult<()> {
        let (dst, src) = (dst.into().id(), src.into().id());
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let (dst_native, src_native) = (self.native(dst)?, self.native(src)?);
        self.inner.device.forward(
            "ResolveSubresource",
            self.inner
                .driver
                .resolve_subresource(dst_native, src_native, format),
        )?;
        self.mark_written([dst]);
        self.record(&mut state, Call::ResolveSubresource { dst, src, format });
        Ok(())
    }

    /// Maps a subresource for CPU access. Reads need staging resources,
    /// writes need dynamic or staging ones.
    pub fn map<'a>(
        &self,
        resource: impl Into<ResourceRef<'a>>,
        subresource: u32,
        mode: MapMode,
    ) -> CaptureResult<Mapped> {
        if self.is_deferred() {
            return Err(CaptureError::Driver(DriverError::WrongContext("Map")));
        }
        let id = resource.into().id();
        let _device = self.inner.device.lock_device();
        let mut state = self.inner.state.lock();
        let desc = self.inner.device.resources.desc(id)?;
        let len = match &desc {
            ResourceDesc::Texture(texture) => texture
                .subresource_layout(subresource)
                .map(|layout| layout.len),
            ResourceDesc::Buffer(buffer) if subresource == 0 => Some(buffer.byte_width as usize),
            _ => None,
        }
        .ok_or_else(|| CaptureError::InvalidArgument(format!("no subresource {subresource} in {id}")))?;

        let allowed = match (mode, desc.usage()) {
            (_, Usage::Staging) => true,
            (MapMode::Write | MapMode::WriteDiscard, Usage::Dynamic) => true,
            _ => false,
        };
        if !allowed {
            return Err(CaptureError::InvalidArgument(format!(
                "{mode:?} map of a {:?} resource",
                desc.usage()
            )));
        }
        if !state.mapped.insert((id, subresource)) {
            return Err(CaptureError::InvalidArgument(format!(
                "subresource {subresource} of {id} is already mapped"
            )));
        }

        let data = match mode {
            MapMode::WriteDiscard => Ok(vec![0u8; len]),
            _ => self
                .native(id)
                .and_then(|native| {
                    self.inner
                        .device
                        .forward("Map", self.inner.driver.read_subresource(native, subresource))
                })
                .map(|bytes| bytes.to_vec()),
        };
        match data {
            Ok(data) => Ok(Mapped {
                resource: id,
                subresource,
                mode,
                data,
            }),
            Err(e) => {
                state.mapped.remove(&(id, subresource));
                Err(e)
            }
        }
    }

    /// Commits a mapping. Write maps are recorded with the bytes written.
    pub fn unmap(&self, mapped: Mapped) -> CaptureResult<()> {
        let _device = self.inner.device.lock_device();
        let mut state = self.inner.state.lock();
        let key = (mapped.resource, mapped.subresource);
        if !state.mapped.remove(&key) {
            return Err(CaptureError::InvalidArgument(format!(
                "subresource {} of {} is not mapped",
                mapped.subresource, mapped.resource
            )));
        }
        if !mapped.mode.writes() {
            return Ok(());
        }
        let native = self.native(mapped.resource)?;
        self.inner.device.forward(
            "Unmap",
            self.inner
                .driver
                .write_subresource(native, mapped.subresource, &mapped.data),
        )?;
        self.inner.device.resources.mark_written(mapped.resource);
        self.record(
            &mut state,
            Call::Unmap {
                id: mapped.resource,
                subresource: mapped.subresource,
                data: Bytes::from(mapped.data),
            },
        );
        Ok(())
    }

    pub fn begin_query(&self, query: &Query) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(query.id())?;
        self.inner
            .device
            .forward("BeginQuery", self.inner.driver.begin_query(native))?;
        self.record(&mut state, Call::BeginQuery { query: query.id() });
        Ok(())
    }

    pub fn end_query(&self, query: &Query) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(query.id())?;
        self.inner
            .device
            .forward("EndQuery", self.inner.driver.end_query(native))?;
        self.record(&mut state, Call::EndQuery { query: query.id() });
        Ok(())
    }

    /// Polls a query. Not recorded.
    pub fn query_data(&self, query: &Query) -> CaptureResult<Option<QueryData>> {
        let _lock = self.inner.device.lock_context();
        let native = self.native(query.id())?;
        self.inner
            .device
            .forward("GetData", self.inner.driver.query_data(native))
    }

    pub fn push_marker(&self, name: &str) {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        self.inner.driver.push_marker(name);
        self.record(
            &mut state,
            Call::PushMarker {
                name: name.to_string(),
            },
        );
    }

    pub fn pop_marker(&self) {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        self.inner.driver.pop_marker();
        self.record(&mut state, Call::PopMarker);
    }

    pub fn set_marker(&self, name: &str) {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        self.inner.driver.set_marker(name);
        self.record(
            &mut state,
            Call::SetMarker {
                name: name.to_string(),
            },
        );
    }

    /// Unbinds every view. Recorded as empty bindings.
    pub fn clear_state(&self) {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        self.inner.driver.clear_state();
        state.bindings = BindingState::default();
        self.record(
            &mut state,
            Call::SetRenderTargets {
                render_targets: Vec::new(),
                depth_stencil: ResourceId::NULL,
            },
        );
        self.record(&mut state, Call::SetUnorderedAccess { views: Vec::new() });
    }

    pub fn flush(&self) {
        let _lock = self.inner.device.lock_context();
        self.inner.driver.flush();
    }

    /// Closes the calls recorded so far into a command list. With
    /// `restore_state` the next list starts from this one's bindings.
    pub fn finish_command_list(&self, restore_state: bool) -> CaptureResult<CommandList> {
        let _device = self.inner.device.lock_device();
        let mut state = self.inner.state.lock();
        let native = self.inner.device.forward(
            "FinishCommandList",
            self.inner.driver.finish_command_list(restore_state),
        )?;
        let id = match self
            .inner
            .device
            .resources
            .create_resource(ResourceDesc::CommandList, || Ok(Some(native)))
        {
            Ok(id) => id,
            Err(e) => {
                self.inner.device.driver.release(native);
                return Err(e);
            }
        };
        let calls: Arc<[(ResourceId, Call)]> = std::mem::take(&mut state.pending).into();

        if restore_state {
            let bindings = state.bindings.clone();
            if !bindings.render_targets.is_empty() || !bindings.depth_stencil.is_null() {
                state.pending.push((
                    self.inner.id,
                    Call::SetRenderTargets {
                        render_targets: bindings.render_targets,
                        depth_stencil: bindings.depth_stencil,
                    },
                ));
            }
            if !bindings.unordered_access.is_empty() {
                state.pending.push((
                    self.inner.id,
                    Call::SetUnorderedAccess {
                        views: bindings.unordered_access,
                    },
                ));
            }
        } else {
            state.bindings = BindingState::default();
        }
        debug!(context = %self.inner.id, list = %id, calls = calls.len(), "Finished command list");
        Ok(CommandList {
            inner: HandleInner::new(id, Arc::clone(&self.inner.device), None),
            calls,
        })
    }

    /// Runs a command list. Its calls are logged right after the submission.
    pub fn execute_command_list(&self, list: &CommandList, restore_state: bool) -> CaptureResult<()> {
        let _lock = self.inner.device.lock_context();
        let mut state = self.inner.state.lock();
        let native = self.native(list.id())?;
        self.inner.device.forward(
            "ExecuteCommandList",
            self.inner.driver.execute_command_list(native, restore_state),
        )?;
        if !restore_state {
            state.bindings = BindingState::default();
        }

        let submit = Call::ExecuteCommandList {
            list: list.id(),
            child_count: list.calls.len() as u32,
            restore_state,
        };
        if self.is_deferred() {
            state.pending.push((self.inner.id, submit));
            state.pending.extend(list.calls.iter().cloned());
        } else {
            self.inner.device.record_all(
                std::iter::once((ResourceId::NULL, submit)).chain(list.calls.iter().cloned()),
            );
        }
        Ok(())
    }
}
