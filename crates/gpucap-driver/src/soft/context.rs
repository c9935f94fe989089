//! Software contexts and the operation executor.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use gpucap_ipc::{
    BufferDesc, ClearFlags, DispatchArgs, Format, InterfaceVersion, QueryData, QueryKind,
    TextureDesc, Triangle, Usage, ViewDesc, ViewKind,
};

use super::raster::{bounds, covers, sample_offset};
use super::texel::{decode_color, encode_color, read_depth, write_depth, write_stencil};
use super::{QueryResult, QueryState, SoftObject, SoftShared, SOFT_TIMESTAMP_FREQUENCY};
use crate::device::DriverContext;
use crate::handle::HandleTable;
use crate::{DriverError, DriverResult, NativeHandle};

/// Fixed tick cost of every executed operation.
const OP_OVERHEAD_TICKS: u64 = 16;

/// One recorded or executed context operation.
#[derive(Debug, Clone)]
pub(crate) enum SoftOp {
    SetRenderTargets {
        render_targets: Vec<NativeHandle>,
        depth_stencil: Option<NativeHandle>,
    },
    SetUnorderedAccess(Vec<NativeHandle>),
    ClearRenderTarget {
        view: NativeHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: NativeHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    },
    ClearView {
        view: NativeHandle,
        color: [f32; 4],
    },
    Discard(NativeHandle),
    Draw(Vec<Triangle>),
    Dispatch(DispatchArgs),
    Copy {
        dst: NativeHandle,
        src: NativeHandle,
    },
    Update {
        dst: NativeHandle,
        subresource: u32,
        data: Vec<u8>,
        mapped: bool,
    },
    Resolve {
        dst: NativeHandle,
        src: NativeHandle,
        format: Format,
    },
    BeginQuery(NativeHandle),
    EndQuery(NativeHandle),
    Execute {
        list: NativeHandle,
        restore_state: bool,
    },
    ClearState,
}

impl SoftOp {
    fn handles(&self) -> Vec<NativeHandle> {
        match self {
            Self::SetRenderTargets {
                render_targets,
                depth_stencil,
            } => render_targets.iter().copied().chain(*depth_stencil).collect(),
            Self::SetUnorderedAccess(views) => views.clone(),
            Self::ClearRenderTarget { view, .. }
            | Self::ClearDepthStencil { view, .. }
            | Self::ClearView { view, .. } => vec![*view],
            Self::Discard(h) | Self::BeginQuery(h) | Self::EndQuery(h) => vec![*h],
            Self::Copy { dst, src } | Self::Resolve { dst, src, .. } => vec![*dst, *src],
            Self::Update { dst, .. } => vec![*dst],
            Self::Execute { list, .. } => vec![*list],
            Self::Draw(_) | Self::Dispatch(_) | Self::ClearState => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Bindings {
    render_targets: Vec<NativeHandle>,
    depth_stencil: Option<NativeHandle>,
    unordered_access: Vec<NativeHandle>,
}

impl Bindings {
    fn apply(&mut self, op: &SoftOp) {
        match op {
            SoftOp::SetRenderTargets {
                render_targets,
                depth_stencil,
            } => {
                self.render_targets = render_targets.clone();
                self.depth_stencil = *depth_stencil;
            }
            SoftOp::SetUnorderedAccess(views) => self.unordered_access = views.clone(),
            SoftOp::ClearState => *self = Bindings::default(),
            _ => {}
        }
    }

    fn replay_ops(&self) -> Vec<SoftOp> {
        vec![
            SoftOp::SetRenderTargets {
                render_targets: self.render_targets.clone(),
                depth_stencil: self.depth_stencil,
            },
            SoftOp::SetUnorderedAccess(self.unordered_access.clone()),
        ]
    }
}

#[derive(Default)]
struct ContextState {
    bindings: Bindings,
    recorded: Vec<SoftOp>,
}

/// A software immediate or deferred context.
pub struct SoftContext {
    shared: Arc<SoftShared>,
    deferred: bool,
    state: Mutex<ContextState>,
}

impl SoftContext {
    pub(crate) fn new(shared: Arc<SoftShared>, deferred: bool) -> Self {
        Self {
            shared,
            deferred,
            state: Mutex::new(ContextState::default()),
        }
    }

    fn submit(&self, op: SoftOp) -> DriverResult<()> {
        let mut state = self.state.lock();
        if self.deferred {
            let objects = self.shared.objects.lock();
            if let Some(missing) = op.handles().into_iter().find(|h| objects.get(*h).is_none()) {
                return Err(DriverError::InvalidHandle(missing));
            }
            drop(objects);
            state.bindings.apply(&op);
            state.recorded.push(op);
            return Ok(());
        }
        let mut objects = self.shared.objects.lock();
        execute(&self.shared, &mut objects, &mut state.bindings, op)
    }

    fn require_immediate(&self, call: &'static str) -> DriverResult<()> {
        if self.deferred {
            return Err(DriverError::WrongContext(call));
        }
        Ok(())
    }

    fn require_version(&self, version: InterfaceVersion, call: &str) -> DriverResult<()> {
        if self.shared.config.caps.interface_version < version {
            return Err(DriverError::NotSupported(format!(
                "{call} needs interface {version:?}"
            )));
        }
        Ok(())
    }
}

impl DriverContext for SoftContext {
    fn is_deferred(&self) -> bool {
        self.deferred
    }

    fn set_render_targets(
        &self,
        render_targets: &[NativeHandle],
        depth_stencil: Option<NativeHandle>,
    ) -> DriverResult<()> {
        self.submit(SoftOp::SetRenderTargets {
            render_targets: render_targets.to_vec(),
            depth_stencil,
        })
    }

    fn set_unordered_access(&self, views: &[NativeHandle]) -> DriverResult<()> {
        self.submit(SoftOp::SetUnorderedAccess(views.to_vec()))
    }

    fn clear_render_target(&self, view: NativeHandle, color: [f32; 4]) -> DriverResult<()> {
        self.submit(SoftOp::ClearRenderTarget { view, color })
    }

    fn clear_depth_stencil(
        &self,
        view: NativeHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) -> DriverResult<()> {
        self.submit(SoftOp::ClearDepthStencil {
            view,
            flags,
            depth,
            stencil,
        })
    }

    fn draw(&self, triangles: &[Triangle]) -> DriverResult<()> {
        self.submit(SoftOp::Draw(triangles.to_vec()))
    }

    fn dispatch(&self, args: &DispatchArgs) -> DriverResult<()> {
        self.submit(SoftOp::Dispatch(*args))
    }

    fn copy_resource(&self, dst: NativeHandle, src: NativeHandle) -> DriverResult<()> {
        self.submit(SoftOp::Copy { dst, src })
    }

    fn update_subresource(
        &self,
        dst: NativeHandle,
        subresource: u32,
        data: &[u8],
    ) -> DriverResult<()> {
        self.submit(SoftOp::Update {
            dst,
            subresource,
            data: data.to_vec(),
            mapped: false,
        })
    }

    fn resolve_subresource(
        &self,
        dst: NativeHandle,
        src: NativeHandle,
        format: Format,
    ) -> DriverResult<()> {
        self.submit(SoftOp::Resolve { dst, src, format })
    }

    fn read_subresource(&self, resource: NativeHandle, subresource: u32) -> DriverResult<Bytes> {
        self.require_immediate("read_subresource")?;
        let objects = self.shared.objects.lock();
        match objects.get(resource) {
            Some(SoftObject::Texture { desc, data }) => {
                let layout = desc.subresource_layout(subresource).ok_or_else(|| {
                    DriverError::InvalidArgument(format!("subresource {subresource}"))
                })?;
                Ok(Bytes::copy_from_slice(
                    &data[layout.offset..layout.offset + layout.len],
                ))
            }
            Some(SoftObject::Buffer { data, .. }) if subresource == 0 => {
                Ok(Bytes::copy_from_slice(data))
            }
            _ => Err(DriverError::InvalidHandle(resource)),
        }
    }

    fn write_subresource(
        &self,
        resource: NativeHandle,
        subresource: u32,
        data: &[u8],
    ) -> DriverResult<()> {
        self.submit(SoftOp::Update {
            dst: resource,
            subresource,
            data: data.to_vec(),
            mapped: true,
        })
    }

    fn begin_query(&self, query: NativeHandle) -> DriverResult<()> {
        self.submit(SoftOp::BeginQuery(query))
    }

    fn end_query(&self, query: NativeHandle) -> DriverResult<()> {
        self.submit(SoftOp::EndQuery(query))
    }

    fn query_data(&self, query: NativeHandle) -> DriverResult<Option<QueryData>> {
        self.require_immediate("query_data")?;
        let mut objects = self.shared.objects.lock();
        let Some(SoftObject::Query { state, .. }) = objects.get_mut(query) else {
            return Err(DriverError::InvalidHandle(query));
        };
        match state {
            QueryState::Ended { polls_left, .. } if *polls_left > 0 => {
                *polls_left -= 1;
                Ok(None)
            }
            QueryState::Ended { result, .. } => Ok(Some(match *result {
                QueryResult::Event => QueryData::Event(true),
                QueryResult::Occlusion(samples) => QueryData::Occlusion(samples),
                QueryResult::Timestamp(ticks) => QueryData::Timestamp(ticks),
                QueryResult::Disjoint => QueryData::TimestampDisjoint {
                    frequency: SOFT_TIMESTAMP_FREQUENCY,
                    disjoint: self.shared.config.report_disjoint,
                },
            })),
            _ => Err(DriverError::InvalidArgument(format!(
                "query {query} has not ended"
            ))),
        }
    }

    fn clear_state(&self) {
        // Cannot fail: carries no handles.
        let _ = self.submit(SoftOp::ClearState);
    }

    fn finish_command_list(&self, restore_state: bool) -> DriverResult<NativeHandle> {
        if !self.deferred {
            return Err(DriverError::WrongContext("finish_command_list"));
        }
        let mut state = self.state.lock();
        let ops = std::mem::take(&mut state.recorded);
        if restore_state {
            state.recorded = state.bindings.replay_ops();
        } else {
            state.bindings = Bindings::default();
        }
        trace!(ops = ops.len(), "Finished software command list");
        Ok(self.shared.objects.lock().insert(SoftObject::CommandList(ops)))
    }

    fn execute_command_list(&self, list: NativeHandle, restore_state: bool) -> DriverResult<()> {
        self.submit(SoftOp::Execute {
            list,
            restore_state,
        })
    }

    fn discard_resource(&self, resource: NativeHandle) -> DriverResult<()> {
        self.require_version(InterfaceVersion::V2, "DiscardResource")?;
        self.submit(SoftOp::Discard(resource))
    }

    fn clear_view(&self, view: NativeHandle, color: [f32; 4]) -> DriverResult<()> {
        self.require_version(InterfaceVersion::V3, "ClearView")?;
        self.submit(SoftOp::ClearView { view, color })
    }
}

/// Memory window of one view's plane.
#[derive(Debug, Clone, Copy)]
struct Surface {
    offset: usize,
    width: u32,
    height: u32,
    samples: u32,
    bpp: usize,
}

impl Surface {
    fn for_texture(desc: &TextureDesc, plane: u32) -> Surface {
        if desc.format.is_yuv() {
            return if plane == 0 {
                Surface {
                    offset: 0,
                    width: desc.width,
                    height: desc.height,
                    samples: 1,
                    bpp: 1,
                }
            } else {
                Surface {
                    offset: desc.width as usize * desc.height as usize,
                    width: desc.width / 2,
                    height: desc.height / 2,
                    samples: 1,
                    bpp: 2,
                }
            };
        }
        Surface {
            offset: 0,
            width: desc.width,
            height: desc.height,
            samples: desc.sample_count.max(1),
            bpp: desc.format.bytes_per_pixel() as usize,
        }
    }

    fn texel(&self, x: u32, y: u32, sample: u32) -> std::ops::Range<usize> {
        let index = (y as usize * self.width as usize + x as usize) * self.samples as usize
            + sample as usize;
        let start = self.offset + index * self.bpp;
        start..start + self.bpp
    }

    fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.samples as usize * self.bpp
    }
}

type Objects = HandleTable<SoftObject>;

fn view_of(
    objects: &Objects,
    view: NativeHandle,
    kind: Option<ViewKind>,
) -> DriverResult<(NativeHandle, ViewDesc)> {
    match objects.get(view) {
        Some(SoftObject::View { resource, desc }) if kind.map_or(true, |k| k == desc.kind) => {
            Ok((*resource, *desc))
        }
        _ => Err(DriverError::InvalidHandle(view)),
    }
}

fn texture_desc(objects: &Objects, handle: NativeHandle) -> DriverResult<TextureDesc> {
    match objects.get(handle) {
        Some(SoftObject::Texture { desc, .. }) => Ok(*desc),
        _ => Err(DriverError::InvalidHandle(handle)),
    }
}

fn storage_mut(objects: &mut Objects, handle: NativeHandle) -> DriverResult<&mut Vec<u8>> {
    match objects.get_mut(handle) {
        Some(SoftObject::Texture { data, .. }) | Some(SoftObject::Buffer { data, .. }) => Ok(data),
        _ => Err(DriverError::InvalidHandle(handle)),
    }
}

/// Describes a resource for copy compatibility checks.
fn resource_shape(objects: &Objects, handle: NativeHandle) -> DriverResult<ResourceShape> {
    match objects.get(handle) {
        Some(SoftObject::Texture { desc, .. }) => Ok(ResourceShape::Texture(*desc)),
        Some(SoftObject::Buffer { desc, .. }) => Ok(ResourceShape::Buffer(*desc)),
        _ => Err(DriverError::InvalidHandle(handle)),
    }
}

enum ResourceShape {
    Texture(TextureDesc),
    Buffer(BufferDesc),
}

impl ResourceShape {
    fn usage(&self) -> Usage {
        match self {
            Self::Texture(d) => d.usage,
            Self::Buffer(d) => d.usage,
        }
    }
}

fn fill_surface(data: &mut [u8], surface: Surface, mut write: impl FnMut(&mut [u8])) {
    for y in 0..surface.height {
        for x in 0..surface.width {
            for s in 0..surface.samples {
                write(&mut data[surface.texel(x, y, s)]);
            }
        }
    }
}

fn execute(
    shared: &SoftShared,
    objects: &mut Objects,
    bindings: &mut Bindings,
    op: SoftOp,
) -> DriverResult<()> {
    let ticks = match op {
        SoftOp::SetRenderTargets { .. } | SoftOp::SetUnorderedAccess(_) | SoftOp::ClearState => {
            for handle in op.handles() {
                view_of(objects, handle, None)?;
            }
            bindings.apply(&op);
            0
        }
        SoftOp::ClearRenderTarget { view, color } => {
            let (tex, vd) = view_of(objects, view, Some(ViewKind::RenderTarget))?;
            clear_color(objects, tex, &vd, color)?
        }
        SoftOp::ClearView { view, color } => {
            let (res, vd) = view_of(objects, view, None)?;
            let is_buffer = matches!(objects.get(res), Some(SoftObject::Buffer { .. }));
            match (vd.kind, is_buffer) {
                (ViewKind::RenderTarget | ViewKind::UnorderedAccess, false) => {
                    clear_color(objects, res, &vd, color)?
                }
                (ViewKind::UnorderedAccess, true) => {
                    let data = storage_mut(objects, res)?;
                    let word = (color[0].max(0.0) as u32).to_le_bytes();
                    for chunk in data.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&word);
                    }
                    data.len() as u64
                }
                _ => {
                    return Err(DriverError::InvalidArgument(
                        "ClearView needs a render-target or unordered-access view".into(),
                    ))
                }
            }
        }
        SoftOp::ClearDepthStencil {
            view,
            flags,
            depth,
            stencil,
        } => {
            let (tex, vd) = view_of(objects, view, Some(ViewKind::DepthStencil))?;
            let surface = Surface::for_texture(&texture_desc(objects, tex)?, 0);
            let data = storage_mut(objects, tex)?;
            fill_surface(data, surface, |texel| {
                if flags.contains(ClearFlags::DEPTH) {
                    write_depth(vd.format, texel, depth);
                }
                if flags.contains(ClearFlags::STENCIL) {
                    write_stencil(vd.format, texel, stencil);
                }
            });
            surface.len() as u64
        }
        SoftOp::Discard(resource) => {
            let data = storage_mut(objects, resource)?;
            data.fill(0);
            data.len() as u64
        }
        SoftOp::Draw(triangles) => draw(shared, objects, bindings, &triangles)?,
        SoftOp::Dispatch(args) => dispatch(objects, bindings, &args)?,
        SoftOp::Copy { dst, src } => copy(objects, dst, src)?,
        SoftOp::Update {
            dst,
            subresource,
            data,
            mapped,
        } => update(objects, dst, subresource, &data, mapped)?,
        SoftOp::Resolve { dst, src, format } => resolve(objects, dst, src, format)?,
        SoftOp::BeginQuery(query) => {
            let start_ticks = shared.clock.load(Ordering::SeqCst);
            let start_samples = shared.samples_passed.load(Ordering::SeqCst);
            match objects.get_mut(query) {
                Some(SoftObject::Query { kind, state }) => {
                    if *kind == QueryKind::Timestamp {
                        return Err(DriverError::InvalidArgument(
                            "timestamp queries have no begin".into(),
                        ));
                    }
                    *state = QueryState::Building {
                        start_ticks,
                        start_samples,
                    };
                }
                _ => return Err(DriverError::InvalidHandle(query)),
            }
            0
        }
        SoftOp::EndQuery(query) => {
            let now = shared.clock.load(Ordering::SeqCst);
            let samples_now = shared.samples_passed.load(Ordering::SeqCst);
            let polls_left = shared.config.query_latency;
            match objects.get_mut(query) {
                Some(SoftObject::Query { kind, state }) => {
                    let result = match (*kind, &*state) {
                        (QueryKind::Timestamp, _) => QueryResult::Timestamp(now),
                        (QueryKind::Event, _) => QueryResult::Event,
                        (QueryKind::Occlusion, QueryState::Building { start_samples, .. }) => {
                            QueryResult::Occlusion(samples_now - start_samples)
                        }
                        (QueryKind::TimestampDisjoint, QueryState::Building { .. }) => {
                            QueryResult::Disjoint
                        }
                        _ => {
                            return Err(DriverError::InvalidArgument(format!(
                                "query {query} ended without begin"
                            )))
                        }
                    };
                    *state = QueryState::Ended { result, polls_left };
                }
                _ => return Err(DriverError::InvalidHandle(query)),
            }
            0
        }
        SoftOp::Execute {
            list,
            restore_state,
        } => {
            let ops = match objects.get(list) {
                Some(SoftObject::CommandList(ops)) => ops.clone(),
                _ => return Err(DriverError::InvalidHandle(list)),
            };
            let saved = bindings.clone();
            let mut list_bindings = Bindings::default();
            let result = ops
                .into_iter()
                .try_for_each(|op| execute(shared, objects, &mut list_bindings, op));
            *bindings = if restore_state {
                saved
            } else {
                Bindings::default()
            };
            result?;
            0
        }
    };
    shared.advance_clock(OP_OVERHEAD_TICKS + ticks);
    Ok(())
}

fn clear_color(
    objects: &mut Objects,
    texture: NativeHandle,
    view: &ViewDesc,
    color: [f32; 4],
) -> DriverResult<u64> {
    let surface = Surface::for_texture(&texture_desc(objects, texture)?, view.plane);
    let mut encoded = vec![0u8; surface.bpp];
    encode_color(view.format, color, &mut encoded);
    let data = storage_mut(objects, texture)?;
    fill_surface(data, surface, |texel| texel.copy_from_slice(&encoded));
    Ok(surface.len() as u64)
}

struct DrawTarget {
    texture: NativeHandle,
    format: Format,
    surface: Surface,
    data: Vec<u8>,
}

fn draw(
    shared: &SoftShared,
    objects: &mut Objects,
    bindings: &Bindings,
    triangles: &[Triangle],
) -> DriverResult<u64> {
    let mut colors = Vec::new();
    for rtv in &bindings.render_targets {
        let (texture, vd) = view_of(objects, *rtv, Some(ViewKind::RenderTarget))?;
        let surface = Surface::for_texture(&texture_desc(objects, texture)?, vd.plane);
        colors.push((texture, vd.format, surface));
    }
    let depth = match bindings.depth_stencil {
        Some(dsv) => {
            let (texture, vd) = view_of(objects, dsv, Some(ViewKind::DepthStencil))?;
            let surface = Surface::for_texture(&texture_desc(objects, texture)?, 0);
            Some((texture, vd.format, surface))
        }
        None => None,
    };

    let Some(&(_, _, extent)) = colors.first().or(depth.as_ref()) else {
        return Err(DriverError::InvalidArgument("draw with no targets bound".into()));
    };
    let mut seen = Vec::new();
    for (texture, _, surface) in colors.iter().chain(depth.iter()) {
        if (surface.width, surface.height, surface.samples)
            != (extent.width, extent.height, extent.samples)
        {
            return Err(DriverError::InvalidArgument(
                "bound targets differ in size or sample count".into(),
            ));
        }
        if seen.contains(texture) {
            return Err(DriverError::InvalidArgument(
                "resource bound to more than one output".into(),
            ));
        }
        seen.push(*texture);
    }

    // All checks done; storage is taken out and always put back below.
    let mut take = |(texture, format, surface): (NativeHandle, Format, Surface)| {
        storage_mut(objects, texture).map(|data| DrawTarget {
            texture,
            format,
            surface,
            data: std::mem::take(data),
        })
    };
    let mut color_targets = colors
        .into_iter()
        .map(&mut take)
        .collect::<DriverResult<Vec<_>>>()?;
    let mut depth_target = depth.map(&mut take).transpose()?;

    let mut covered = 0u64;
    let mut passed = 0u64;
    for tri in triangles {
        let mut encoded: Vec<Vec<u8>> = color_targets
            .iter()
            .map(|t| vec![0u8; t.surface.bpp])
            .collect();
        for (target, out) in color_targets.iter().zip(encoded.iter_mut()) {
            encode_color(target.format, tri.color, out);
        }
        let (x0, x1, y0, y1) = bounds(tri, extent.width, extent.height);
        for y in y0..y1 {
            for x in x0..x1 {
                for s in 0..extent.samples {
                    let (ox, oy) = sample_offset(s, extent.samples);
                    if !covers(tri, (x as f32 + ox, y as f32 + oy)) {
                        continue;
                    }
                    covered += 1;
                    if let Some(depth) = depth_target.as_mut() {
                        let range = depth.surface.texel(x, y, s);
                        let texel = &mut depth.data[range];
                        if tri.depth >= read_depth(depth.format, texel) {
                            continue;
                        }
                        write_depth(depth.format, texel, tri.depth);
                    }
                    passed += 1;
                    for (target, value) in color_targets.iter_mut().zip(&encoded) {
                        let range = target.surface.texel(x, y, s);
                        target.data[range].copy_from_slice(value);
                    }
                }
            }
        }
    }

    for target in color_targets.into_iter().chain(depth_target) {
        if let Ok(data) = storage_mut(objects, target.texture) {
            *data = target.data;
        }
    }
    shared.samples_passed.fetch_add(passed, Ordering::SeqCst);
    trace!(triangles = triangles.len(), covered, passed, "Software draw");
    Ok(covered)
}

fn dispatch(objects: &mut Objects, bindings: &Bindings, args: &DispatchArgs) -> DriverResult<u64> {
    let Some(&uav) = bindings.unordered_access.first() else {
        return Err(DriverError::InvalidArgument(
            "dispatch with no unordered-access view bound".into(),
        ));
    };
    let (resource, _) = view_of(objects, uav, Some(ViewKind::UnorderedAccess))?;
    let data = storage_mut(objects, resource)?;
    let word = args.value.to_le_bytes();
    let invocations = args.invocations();
    for chunk in data.chunks_exact_mut(4).take(invocations as usize) {
        chunk.copy_from_slice(&word);
    }
    Ok(invocations)
}

fn copy(objects: &mut Objects, dst: NativeHandle, src: NativeHandle) -> DriverResult<u64> {
    if dst == src {
        return Err(DriverError::InvalidArgument("copy onto itself".into()));
    }
    let compatible = match (resource_shape(objects, dst)?, resource_shape(objects, src)?) {
        (ResourceShape::Texture(d), ResourceShape::Texture(s)) => {
            if d.usage == Usage::Immutable {
                false
            } else {
                d.dimension == s.dimension
                    && (d.width, d.height, d.depth) == (s.width, s.height, s.depth)
                    && (d.array_size, d.mip_levels, d.sample_count)
                        == (s.array_size, s.mip_levels, s.sample_count)
                    && d.format.typeless() == s.format.typeless()
            }
        }
        (ResourceShape::Buffer(d), ResourceShape::Buffer(s)) => {
            d.usage != Usage::Immutable && d.byte_width == s.byte_width
        }
        _ => false,
    };
    if !compatible {
        return Err(DriverError::InvalidArgument(format!(
            "cannot copy {src} into {dst}"
        )));
    }
    let bytes = storage_mut(objects, src)?.clone();
    let len = bytes.len() as u64;
    *storage_mut(objects, dst)? = bytes;
    Ok(len)
}

fn update(
    objects: &mut Objects,
    dst: NativeHandle,
    subresource: u32,
    bytes: &[u8],
    mapped: bool,
) -> DriverResult<u64> {
    let shape = resource_shape(objects, dst)?;
    let usage = shape.usage();
    if usage == Usage::Immutable {
        return Err(DriverError::InvalidArgument(
            "immutable resources cannot be written".into(),
        ));
    }
    if mapped && !matches!(usage, Usage::Dynamic | Usage::Staging) {
        return Err(DriverError::InvalidArgument(
            "only dynamic or staging resources can be mapped for writing".into(),
        ));
    }
    let (offset, len) = match shape {
        ResourceShape::Texture(desc) => {
            let layout = desc.subresource_layout(subresource).ok_or_else(|| {
                DriverError::InvalidArgument(format!("subresource {subresource}"))
            })?;
            (layout.offset, layout.len)
        }
        ResourceShape::Buffer(desc) if subresource == 0 => (0, desc.byte_width as usize),
        ResourceShape::Buffer(_) => {
            return Err(DriverError::InvalidArgument(format!(
                "buffer subresource {subresource}"
            )))
        }
    };
    if bytes.len() != len {
        return Err(DriverError::InvalidArgument(format!(
            "update of {} bytes into a {len}-byte subresource",
            bytes.len()
        )));
    }
    storage_mut(objects, dst)?[offset..offset + len].copy_from_slice(bytes);
    Ok(len as u64)
}

fn resolve(
    objects: &mut Objects,
    dst: NativeHandle,
    src: NativeHandle,
    format: Format,
) -> DriverResult<u64> {
    let d = texture_desc(objects, dst)?;
    let s = texture_desc(objects, src)?;
    if s.sample_count <= 1 || d.sample_count != 1 || (d.width, d.height) != (s.width, s.height) {
        return Err(DriverError::InvalidArgument(
            "resolve needs a multisampled source and single-sampled destination of equal size"
                .into(),
        ));
    }
    if format.is_typeless()
        || format.is_depth_family()
        || format.typeless() != s.format.typeless()
        || format.typeless() != d.format.typeless()
        || d.usage == Usage::Immutable
    {
        return Err(DriverError::InvalidArgument(format!(
            "cannot resolve as {}",
            format.name()
        )));
    }
    let src_surface = Surface::for_texture(&s, 0);
    let dst_surface = Surface::for_texture(&d, 0);
    let src_data = match objects.get(src) {
        Some(SoftObject::Texture { data, .. }) => data.clone(),
        _ => return Err(DriverError::InvalidHandle(src)),
    };
    let dst_data = storage_mut(objects, dst)?;
    for y in 0..s.height {
        for x in 0..s.width {
            let mut sum = [0.0f32; 4];
            for sample in 0..src_surface.samples {
                let c = decode_color(format, &src_data[src_surface.texel(x, y, sample)]);
                for (acc, v) in sum.iter_mut().zip(c) {
                    *acc += v;
                }
            }
            let avg = sum.map(|v| v / src_surface.samples as f32);
            encode_color(format, avg, &mut dst_data[dst_surface.texel(x, y, 0)]);
        }
    }
    Ok(src_surface.len() as u64)
}
