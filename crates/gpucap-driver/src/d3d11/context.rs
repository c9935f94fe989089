//! Direct3D 11 immediate and deferred contexts.

use std::ffi::c_void;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{BOOL, S_FALSE};
use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST;
use windows::Win32::Graphics::Direct3D11::*;

use gpucap_ipc::{
    BufferDesc, ClearFlags, DispatchArgs, Format, InterfaceVersion, QueryData, QueryKind,
    TextureDesc, Triangle, Usage,
};

use super::convert::{dxgi_format, row_count, row_pitch};
use super::pipeline::{FillParams, Vertex, FILL_GROUP_SIZE};
use super::{created, D3D11Object, D3D11Shared, NativeView};
use crate::device::DriverContext;
use crate::{DriverError, DriverResult, NativeHandle};

struct Inner {
    context: ID3D11DeviceContext,
    context1: Option<ID3D11DeviceContext1>,
    annotation: Option<ID3DUserDefinedAnnotation>,
    /// Size of the first bound output, for the viewport.
    target_size: Option<(u32, u32)>,
}

/// A Direct3D 11 context.
pub struct D3D11Context {
    shared: Arc<D3D11Shared>,
    deferred: bool,
    inner: Mutex<Inner>,
}

// SAFETY: the native context is only touched while `inner` is locked.
unsafe impl Send for D3D11Context {}
unsafe impl Sync for D3D11Context {}

enum Shape {
    Texture(TextureDesc),
    Buffer(BufferDesc),
}

impl D3D11Context {
    pub(crate) fn new(shared: Arc<D3D11Shared>, context: ID3D11DeviceContext, deferred: bool) -> Self {
        let context1 = context.cast::<ID3D11DeviceContext1>().ok();
        let annotation = context.cast::<ID3DUserDefinedAnnotation>().ok();
        Self {
            shared,
            deferred,
            inner: Mutex::new(Inner {
                context,
                context1,
                annotation,
                target_size: None,
            }),
        }
    }

    fn require_immediate(&self, call: &'static str) -> DriverResult<()> {
        if self.deferred {
            return Err(DriverError::WrongContext(call));
        }
        Ok(())
    }

    fn require_version(&self, version: InterfaceVersion, call: &str) -> DriverResult<()> {
        if self.shared.caps.interface_version < version {
            return Err(DriverError::NotSupported(format!(
                "{call} needs interface {version:?}"
            )));
        }
        Ok(())
    }

    fn resource(&self, handle: NativeHandle) -> DriverResult<(ID3D11Resource, Shape)> {
        let objects = self.shared.objects.lock();
        let object = objects.get(handle).ok_or(DriverError::InvalidHandle(handle))?;
        let shape = match object {
            D3D11Object::Texture { desc, .. } => Shape::Texture(*desc),
            D3D11Object::Buffer { desc, .. } => Shape::Buffer(*desc),
            _ => return Err(DriverError::InvalidHandle(handle)),
        };
        let resource = object.resource().ok_or(DriverError::InvalidHandle(handle))?;
        Ok((resource, shape))
    }

    fn rtv(&self, handle: NativeHandle) -> DriverResult<(ID3D11RenderTargetView, NativeHandle)> {
        match self.shared.objects.lock().get(handle) {
            Some(D3D11Object::View {
                view: NativeView::RenderTarget(view),
                resource,
                ..
            }) => Ok((view.clone(), *resource)),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn dsv(&self, handle: NativeHandle) -> DriverResult<(ID3D11DepthStencilView, NativeHandle)> {
        match self.shared.objects.lock().get(handle) {
            Some(D3D11Object::View {
                view: NativeView::DepthStencil(view),
                resource,
                ..
            }) => Ok((view.clone(), *resource)),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn uav(&self, handle: NativeHandle) -> DriverResult<ID3D11UnorderedAccessView> {
        match self.shared.objects.lock().get(handle) {
            Some(D3D11Object::View {
                view: NativeView::UnorderedAccess(view),
                ..
            }) => Ok(view.clone()),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn query(&self, handle: NativeHandle) -> DriverResult<(QueryKind, ID3D11Query)> {
        match self.shared.objects.lock().get(handle) {
            Some(D3D11Object::Query { kind, query }) => Ok((*kind, query.clone())),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn texture_size(&self, handle: NativeHandle) -> Option<(u32, u32)> {
        match self.shared.objects.lock().get(handle) {
            Some(D3D11Object::Texture { desc, .. }) => Some((desc.width, desc.height)),
            _ => None,
        }
    }

    fn immutable_buffer(&self, bytes: &[u8], bind: D3D11_BIND_FLAG) -> DriverResult<ID3D11Buffer> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: bytes.len() as u32,
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: bind.0 as u32,
            ..Default::default()
        };
        let data = D3D11_SUBRESOURCE_DATA {
            pSysMem: bytes.as_ptr().cast(),
            ..Default::default()
        };
        let mut buffer = None;
        unsafe {
            self.shared
                .device
                .CreateBuffer(&desc, Some(&data), Some(&mut buffer))?;
        }
        created(buffer, "transient buffer")
    }

    /// Copies `resource` into a fresh staging resource of the same shape.
    fn staging_copy(&self, inner: &Inner, resource: &ID3D11Resource, shape: &Shape) -> DriverResult<ID3D11Resource> {
        let device = &self.shared.device;
        let staging: ID3D11Resource = unsafe {
            match shape {
                Shape::Buffer(desc) => {
                    let mut d = super::convert::buffer_desc(desc);
                    d.Usage = D3D11_USAGE_STAGING;
                    d.BindFlags = 0;
                    d.MiscFlags = 0;
                    d.CPUAccessFlags = D3D11_CPU_ACCESS_READ.0 as u32;
                    let mut buffer = None;
                    device.CreateBuffer(&d, None, Some(&mut buffer))?;
                    created(buffer, "staging buffer")?.cast()?
                }
                Shape::Texture(desc) => {
                    if desc.is_multisampled() {
                        return Err(DriverError::NotSupported(
                            "reading multisampled textures".into(),
                        ));
                    }
                    let staging_desc = desc
                        .with_usage(Usage::Staging)
                        .with_bind_flags(gpucap_ipc::BindFlags::NONE);
                    match desc.dimension {
                        gpucap_ipc::TextureDimension::D1 => {
                            let mut t = None;
                            device.CreateTexture1D(
                                &super::convert::texture1d_desc(&staging_desc),
                                None,
                                Some(&mut t),
                            )?;
                            created(t, "staging texture")?.cast()?
                        }
                        gpucap_ipc::TextureDimension::D2 => {
                            let mut t = None;
                            device.CreateTexture2D(
                                &super::convert::texture2d_desc(&staging_desc),
                                None,
                                Some(&mut t),
                            )?;
                            created(t, "staging texture")?.cast()?
                        }
                        gpucap_ipc::TextureDimension::D3 => {
                            let mut t = None;
                            device.CreateTexture3D(
                                &super::convert::texture3d_desc(&staging_desc),
                                None,
                                Some(&mut t),
                            )?;
                            created(t, "staging texture")?.cast()?
                        }
                    }
                }
            }
        };
        unsafe { inner.context.CopyResource(&staging, resource) };
        Ok(staging)
    }
}

/// Bytes, row pitch, rows and depth of one tightly packed subresource.
fn packed_layout(shape: &Shape, subresource: u32) -> DriverResult<(usize, usize, usize, usize)> {
    match shape {
        Shape::Buffer(desc) if subresource == 0 => {
            let len = desc.byte_width as usize;
            Ok((len, len, 1, 1))
        }
        Shape::Buffer(_) => Err(DriverError::InvalidArgument(format!(
            "buffer subresource {subresource}"
        ))),
        Shape::Texture(desc) => {
            let layout = desc.subresource_layout(subresource).ok_or_else(|| {
                DriverError::InvalidArgument(format!("subresource {subresource}"))
            })?;
            let pitch = row_pitch(desc.format, layout.width);
            let rows = row_count(desc.format, layout.height);
            Ok((layout.len, pitch, rows, layout.depth as usize))
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

impl DriverContext for D3D11Context {
    fn is_deferred(&self) -> bool {
        self.deferred
    }

    fn set_render_targets(
        &self,
        render_targets: &[NativeHandle],
        depth_stencil: Option<NativeHandle>,
    ) -> DriverResult<()> {
        let mut views = Vec::with_capacity(render_targets.len());
        let mut size = None;
        for handle in render_targets {
            let (view, resource) = self.rtv(*handle)?;
            size = size.or_else(|| self.texture_size(resource));
            views.push(Some(view));
        }
        let dsv = match depth_stencil {
            Some(handle) => {
                let (view, resource) = self.dsv(handle)?;
                size = size.or_else(|| self.texture_size(resource));
                Some(view)
            }
            None => None,
        };
        let mut inner = self.inner.lock();
        unsafe {
            inner.context.OMSetRenderTargets(Some(&views), dsv.as_ref());
            if let Some((width, height)) = size {
                inner.context.RSSetViewports(Some(&[D3D11_VIEWPORT {
                    TopLeftX: 0.0,
                    TopLeftY: 0.0,
                    Width: width as f32,
                    Height: height as f32,
                    MinDepth: 0.0,
                    MaxDepth: 1.0,
                }]));
            }
        }
        inner.target_size = size;
        Ok(())
    }

    fn set_unordered_access(&self, views: &[NativeHandle]) -> DriverResult<()> {
        let uavs = views
            .iter()
            .map(|h| self.uav(*h).map(Some))
            .collect::<DriverResult<Vec<_>>>()?;
        let inner = self.inner.lock();
        unsafe {
            inner.context.CSSetUnorderedAccessViews(
                0,
                uavs.len() as u32,
                Some(uavs.as_ptr()),
                None,
            );
        }
        Ok(())
    }

    fn clear_render_target(&self, view: NativeHandle, color: [f32; 4]) -> DriverResult<()> {
        let (rtv, _) = self.rtv(view)?;
        unsafe { self.inner.lock().context.ClearRenderTargetView(&rtv, &color) };
        Ok(())
    }

    fn clear_depth_stencil(
        &self,
        view: NativeHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) -> DriverResult<()> {
        let (dsv, _) = self.dsv(view)?;
        let mut native = 0u32;
        if flags.contains(ClearFlags::DEPTH) {
            native |= D3D11_CLEAR_DEPTH.0 as u32;
        }
        if flags.contains(ClearFlags::STENCIL) {
            native |= D3D11_CLEAR_STENCIL.0 as u32;
        }
        unsafe {
            self.inner
                .lock()
                .context
                .ClearDepthStencilView(&dsv, native, depth, stencil)
        };
        Ok(())
    }

    fn draw(&self, triangles: &[Triangle]) -> DriverResult<()> {
        if triangles.is_empty() {
            return Ok(());
        }
        let inner = self.inner.lock();
        let Some((width, height)) = inner.target_size else {
            return Err(DriverError::InvalidArgument("draw with no targets bound".into()));
        };
        let to_ndc = |p: [f32; 2], depth: f32| {
            [
                p[0] / width as f32 * 2.0 - 1.0,
                1.0 - p[1] / height as f32 * 2.0,
                depth,
                1.0,
            ]
        };
        let vertices: Vec<Vertex> = triangles
            .iter()
            .flat_map(|t| {
                t.vertices.map(|v| Vertex {
                    position: to_ndc(v, t.depth),
                    color: t.color,
                })
            })
            .collect();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                vertices.as_ptr() as *const u8,
                std::mem::size_of_val(vertices.as_slice()),
            )
        };
        let vertex_buffer = self.immutable_buffer(bytes, D3D11_BIND_VERTEX_BUFFER)?;
        let pipeline = &self.shared.pipeline;
        let stride = std::mem::size_of::<Vertex>() as u32;
        let offset = 0u32;
        unsafe {
            let ctx = &inner.context;
            ctx.IASetInputLayout(&pipeline.input_layout);
            ctx.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            ctx.IASetVertexBuffers(0, 1, Some(&Some(vertex_buffer)), Some(&stride), Some(&offset));
            ctx.VSSetShader(&pipeline.vertex_shader, None);
            ctx.PSSetShader(&pipeline.pixel_shader, None);
            ctx.RSSetState(&pipeline.rasterizer);
            ctx.OMSetDepthStencilState(&pipeline.depth_less, 0);
            ctx.Draw(vertices.len() as u32, 0);
        }
        trace!(triangles = triangles.len(), "D3D11 draw");
        Ok(())
    }

    fn dispatch(&self, args: &DispatchArgs) -> DriverResult<()> {
        let count = args.invocations();
        let params = FillParams {
            value: args.value,
            count: count.min(u32::MAX as u64) as u32,
            pad: [0; 2],
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &params as *const FillParams as *const u8,
                std::mem::size_of::<FillParams>(),
            )
        };
        let constants = self.immutable_buffer(bytes, D3D11_BIND_CONSTANT_BUFFER)?;
        let groups = count.div_ceil(FILL_GROUP_SIZE).max(1) as u32;
        let inner = self.inner.lock();
        unsafe {
            inner
                .context
                .CSSetShader(&self.shared.pipeline.fill_shader, None);
            inner.context.CSSetConstantBuffers(0, Some(&[Some(constants)]));
            inner.context.Dispatch(groups, 1, 1);
        }
        Ok(())
    }

    fn copy_resource(&self, dst: NativeHandle, src: NativeHandle) -> DriverResult<()> {
        let (dst, _) = self.resource(dst)?;
        let (src, _) = self.resource(src)?;
        unsafe { self.inner.lock().context.CopyResource(&dst, &src) };
        Ok(())
    }

    fn update_subresource(
        &self,
        dst: NativeHandle,
        subresource: u32,
        data: &[u8],
    ) -> DriverResult<()> {
        let (resource, shape) = self.resource(dst)?;
        let (len, pitch, rows, _) = packed_layout(&shape, subresource)?;
        if data.len() != len {
            return Err(DriverError::InvalidArgument(format!(
                "update of {} bytes into a {len}-byte subresource",
                data.len()
            )));
        }
        unsafe {
            self.inner.lock().context.UpdateSubresource(
                &resource,
                subresource,
                None,
                data.as_ptr().cast(),
                pitch as u32,
                (pitch * rows) as u32,
            );
        }
        Ok(())
    }

    fn resolve_subresource(
        &self,
        dst: NativeHandle,
        src: NativeHandle,
        format: Format,
    ) -> DriverResult<()> {
        let (dst, _) = self.resource(dst)?;
        let (src, _) = self.resource(src)?;
        unsafe {
            self.inner
                .lock()
                .context
                .ResolveSubresource(&dst, 0, &src, 0, dxgi_format(format));
        }
        Ok(())
    }

    fn read_subresource(&self, resource: NativeHandle, subresource: u32) -> DriverResult<Bytes> {
        self.require_immediate("read_subresource")?;
        let (native, shape) = self.resource(resource)?;
        let (len, pitch, rows, depth) = packed_layout(&shape, subresource)?;
        let inner = self.inner.lock();
        let staging = self.staging_copy(&inner, &native, &shape)?;
        let mut out = Vec::with_capacity(len);
        unsafe {
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            inner
                .context
                .Map(&staging, subresource, D3D11_MAP_READ, 0, Some(&mut mapped))?;
            let base = mapped.pData as *const u8;
            for slice in 0..depth {
                for row in 0..rows {
                    let src = base.add(
                        slice * mapped.DepthPitch as usize + row * mapped.RowPitch as usize,
                    );
                    out.extend_from_slice(std::slice::from_raw_parts(src, pitch));
                }
            }
            inner.context.Unmap(&staging, subresource);
        }
        Ok(Bytes::from(out))
    }

    fn write_subresource(
        &self,
        resource: NativeHandle,
        subresource: u32,
        data: &[u8],
    ) -> DriverResult<()> {
        let (native, shape) = self.resource(resource)?;
        let usage = match &shape {
            Shape::Texture(d) => d.usage,
            Shape::Buffer(d) => d.usage,
        };
        let map_type = match usage {
            Usage::Dynamic => D3D11_MAP_WRITE_DISCARD,
            Usage::Staging => D3D11_MAP_WRITE,
            _ => {
                return Err(DriverError::InvalidArgument(
                    "only dynamic or staging resources can be mapped for writing".into(),
                ))
            }
        };
        let (len, pitch, rows, depth) = packed_layout(&shape, subresource)?;
        if data.len() != len {
            return Err(DriverError::InvalidArgument(format!(
                "write of {} bytes into a {len}-byte subresource",
                data.len()
            )));
        }
        let inner = self.inner.lock();
        unsafe {
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            inner
                .context
                .Map(&native, subresource, map_type, 0, Some(&mut mapped))?;
            let base = mapped.pData as *mut u8;
            for slice in 0..depth {
                for row in 0..rows {
                    let dst = base.add(
                        slice * mapped.DepthPitch as usize + row * mapped.RowPitch as usize,
                    );
                    let start = (slice * rows + row) * pitch;
                    std::ptr::copy_nonoverlapping(data[start..].as_ptr(), dst, pitch);
                }
            }
            inner.context.Unmap(&native, subresource);
        }
        Ok(())
    }

    fn begin_query(&self, query: NativeHandle) -> DriverResult<()> {
        let (kind, query) = self.query(query)?;
        if kind == QueryKind::Timestamp {
            return Err(DriverError::InvalidArgument(
                "timestamp queries have no begin".into(),
            ));
        }
        unsafe { self.inner.lock().context.Begin(&query) };
        Ok(())
    }

    fn end_query(&self, query: NativeHandle) -> DriverResult<()> {
        let (_, query) = self.query(query)?;
        unsafe { self.inner.lock().context.End(&query) };
        Ok(())
    }

    fn query_data(&self, query: NativeHandle) -> DriverResult<Option<QueryData>> {
        self.require_immediate("query_data")?;
        let (kind, query) = self.query(query)?;
        let inner = self.inner.lock();
        let mut raw = [0u64; 2];
        let size = match kind {
            QueryKind::Event => std::mem::size_of::<BOOL>(),
            QueryKind::Occlusion | QueryKind::Timestamp => std::mem::size_of::<u64>(),
            QueryKind::TimestampDisjoint => {
                std::mem::size_of::<D3D11_QUERY_DATA_TIMESTAMP_DISJOINT>()
            }
        };
        // Called through the vtable: the wrapper folds S_FALSE (pending)
        // into success.
        let hr = unsafe {
            (Interface::vtable(&inner.context).GetData)(
                Interface::as_raw(&inner.context),
                Interface::as_raw(&query),
                raw.as_mut_ptr() as *mut c_void,
                size as u32,
                0,
            )
        };
        if hr == S_FALSE {
            return Ok(None);
        }
        hr.ok()?;
        Ok(Some(match kind {
            QueryKind::Event => QueryData::Event(raw[0] as u32 != 0),
            QueryKind::Occlusion => QueryData::Occlusion(raw[0]),
            QueryKind::Timestamp => QueryData::Timestamp(raw[0]),
            QueryKind::TimestampDisjoint => QueryData::TimestampDisjoint {
                frequency: raw[0],
                disjoint: raw[1] as u32 != 0,
            },
        }))
    }

    fn flush(&self) {
        unsafe { self.inner.lock().context.Flush() };
    }

    fn clear_state(&self) {
        let mut inner = self.inner.lock();
        unsafe { inner.context.ClearState() };
        inner.target_size = None;
    }

    fn finish_command_list(&self, restore_state: bool) -> DriverResult<NativeHandle> {
        if !self.deferred {
            return Err(DriverError::WrongContext("finish_command_list"));
        }
        let mut list = None;
        unsafe {
            self.inner
                .lock()
                .context
                .FinishCommandList(BOOL::from(restore_state), Some(&mut list))?;
        }
        let list = created(list, "command list")?;
        Ok(self
            .shared
            .objects
            .lock()
            .insert(D3D11Object::CommandList(list)))
    }

    fn execute_command_list(&self, list: NativeHandle, restore_state: bool) -> DriverResult<()> {
        let list = match self.shared.objects.lock().get(list) {
            Some(D3D11Object::CommandList(list)) => list.clone(),
            _ => return Err(DriverError::InvalidHandle(list)),
        };
        unsafe {
            self.inner
                .lock()
                .context
                .ExecuteCommandList(&list, BOOL::from(restore_state));
        }
        Ok(())
    }

    fn push_marker(&self, name: &str) {
        let name = wide(name);
        if let Some(annotation) = &self.inner.lock().annotation {
            unsafe { annotation.BeginEvent(PCWSTR(name.as_ptr())) };
        }
    }

    fn pop_marker(&self) {
        if let Some(annotation) = &self.inner.lock().annotation {
            unsafe { annotation.EndEvent() };
        }
    }

    fn set_marker(&self, name: &str) {
        let name = wide(name);
        if let Some(annotation) = &self.inner.lock().annotation {
            unsafe { annotation.SetMarker(PCWSTR(name.as_ptr())) };
        }
    }

    fn discard_resource(&self, resource: NativeHandle) -> DriverResult<()> {
        self.require_version(InterfaceVersion::V2, "DiscardResource")?;
        let (native, _) = self.resource(resource)?;
        let inner = self.inner.lock();
        let context1 = inner
            .context1
            .as_ref()
            .ok_or_else(|| DriverError::NotSupported("DiscardResource".into()))?;
        unsafe { context1.DiscardResource(&native) };
        Ok(())
    }

    fn clear_view(&self, view: NativeHandle, color: [f32; 4]) -> DriverResult<()> {
        self.require_version(InterfaceVersion::V3, "ClearView")?;
        let native: ID3D11View = match self.shared.objects.lock().get(view) {
            Some(D3D11Object::View { view, .. }) => match view {
                NativeView::RenderTarget(v) => v.cast()?,
                NativeView::UnorderedAccess(v) => v.cast()?,
                _ => {
                    return Err(DriverError::InvalidArgument(
                        "ClearView needs a render-target or unordered-access view".into(),
                    ))
                }
            },
            _ => return Err(DriverError::InvalidHandle(view)),
        };
        let inner = self.inner.lock();
        let context1 = inner
            .context1
            .as_ref()
            .ok_or_else(|| DriverError::NotSupported("ClearView".into()))?;
        unsafe { context1.ClearView(&native, &color, None) };
        Ok(())
    }
}
