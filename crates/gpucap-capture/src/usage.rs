//! Per-resource access history derived from a chunk log.
//!
//! The initial-contents policy needs to know, for any start event, whether a
//! resource is read, partially written or fully overwritten before anything
//! else happens to it. This module walks the log once and records every
//! access to every texture and buffer, resolving views to the resources they
//! see and following bindings through submitted command lists.

use std::collections::{BTreeSet, HashMap};

use gpucap_ipc::{
    BindFlags, ClearFlags, ClearValue, EventId, Format, InitialContents, ResourceDesc, ResourceId,
    TextureDesc,
};
use gpucap_log::{Call, ChunkLog, LogResult};

use crate::bindings::{BindingState, CommandListTracker};
use crate::contents::clear_view_format;

/// How one event touched a resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccessKind {
    /// Contents were read.
    Read,
    /// Contents were written; `full` when every byte was overwritten.
    Write { full: bool },
    /// Every byte was set to a value that can be reproduced by a clear.
    Clear(ClearValue),
}

impl AccessKind {
    /// Returns true when nothing of the previous contents survives.
    pub fn overwrites(&self) -> bool {
        matches!(self, Self::Write { full: true } | Self::Clear(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Access {
    pub event_id: EventId,
    pub kind: AccessKind,
}

/// Access history of every resource in a log.
#[derive(Debug, Default)]
pub struct UsageIndex {
    descs: HashMap<ResourceId, ResourceDesc>,
    accesses: HashMap<ResourceId, Vec<Access>>,
}

impl UsageIndex {
    /// Walks every chunk of `log`.
    pub fn build(log: &ChunkLog) -> LogResult<Self> {
        let mut index = Self::default();
        let mut bindings = BindingState::default();
        let mut lists = CommandListTracker::new();
        let chunks = log.chunks();

        for (pos, chunk) in chunks.iter().enumerate() {
            let event_id = chunk.event_id;
            match chunk.call()? {
                Call::CreateTexture {
                    id,
                    desc,
                    initial_data,
                } => {
                    index.descs.insert(id, ResourceDesc::Texture(desc));
                    index.created(id, event_id, initial_data.is_some());
                }
                Call::CreateSwapBuffer { id, desc } => {
                    index.descs.insert(id, ResourceDesc::Texture(desc));
                    index.created(id, event_id, false);
                }
                Call::CreateBuffer {
                    id,
                    desc,
                    initial_data,
                } => {
                    index.descs.insert(id, ResourceDesc::Buffer(desc));
                    index.created(id, event_id, initial_data.is_some());
                }
                Call::CreateView { id, resource, desc } => {
                    index.descs.insert(id, ResourceDesc::View { resource, desc });
                }
                Call::CreateQuery { id, kind } => {
                    index.descs.insert(id, ResourceDesc::Query(kind));
                }
                Call::CreateDeferredContext { id } => {
                    index.descs.insert(id, ResourceDesc::DeferredContext);
                }
                Call::InitialContents { id, contents } => match contents {
                    InitialContents::Copy(_) => index.push(id, event_id, AccessKind::Write { full: true }),
                    InitialContents::Clear(value) => index.push(id, event_id, AccessKind::Clear(value)),
                    InitialContents::NoneNeeded => {}
                },
                Call::SetRenderTargets {
                    render_targets,
                    depth_stencil,
                } => {
                    bindings.render_targets = render_targets;
                    bindings.depth_stencil = depth_stencil;
                }
                Call::SetUnorderedAccess { views } => bindings.unordered_access = views,
                Call::ClearRenderTargetView { view, color } => {
                    let kind = index.color_clear(view, color, false);
                    index.push_view(view, event_id, kind);
                }
                Call::ClearView { view, color } => {
                    let kind = index.color_clear(view, color, true);
                    index.push_view(view, event_id, kind);
                }
                Call::ClearDepthStencilView {
                    view,
                    flags,
                    depth,
                    stencil,
                } => {
                    let kind = index.depth_clear(view, flags, depth, stencil);
                    index.push_view(view, event_id, kind);
                }
                Call::DiscardResource { id } => {
                    index.push_view(id, event_id, AccessKind::Write { full: true })
                }
                Call::Draw { .. } => {
                    let targets: Vec<_> = bindings.draw_targets().collect();
                    for view in targets {
                        index.push_view(view, event_id, AccessKind::Write { full: false });
                    }
                }
                Call::Dispatch { .. } => {
                    for view in bindings.unordered_access.clone() {
                        index.push_view(view, event_id, AccessKind::Write { full: false });
                    }
                }
                Call::CopyResource { dst, src } => {
                    index.push(src, event_id, AccessKind::Read);
                    index.push(dst, event_id, AccessKind::Write { full: true });
                }
                Call::ResolveSubresource { dst, src, .. } => {
                    index.push(src, event_id, AccessKind::Read);
                    let full = index.single_subresource(dst);
                    index.push(dst, event_id, AccessKind::Write { full });
                }
                Call::UpdateSubresource { dst: id, .. } | Call::Unmap { id, .. } => {
                    let full = index.single_subresource(id);
                    index.push(id, event_id, AccessKind::Write { full });
                }
                Call::ExecuteCommandList {
                    child_count,
                    restore_state,
                    ..
                } => {
                    let last_child = (child_count > 0)
                        .then(|| chunks.get(pos + child_count as usize))
                        .flatten()
                        .map(|c| c.event_id);
                    lists.enter(event_id, last_child, restore_state, &mut bindings);
                    continue;
                }
                _ => {}
            }
            lists.leave(event_id, &mut bindings);
        }
        Ok(index)
    }

    /// Description of any object created in the log.
    pub fn desc(&self, id: ResourceId) -> Option<&ResourceDesc> {
        self.descs.get(&id)
    }

    /// Resource a view looks at, or the id itself for textures and buffers.
    pub fn resource_of(&self, id: ResourceId) -> Option<ResourceId> {
        match self.descs.get(&id)? {
            ResourceDesc::View { resource, .. } => Some(*resource),
            ResourceDesc::Texture(_) | ResourceDesc::Buffer(_) => Some(id),
            _ => None,
        }
    }

    /// Accesses to a resource in event order.
    pub fn accesses(&self, id: ResourceId) -> &[Access] {
        self.accesses.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Resources accessed by any event in `[first, last]`, in id order.
    pub fn touched_in(&self, first: EventId, last: EventId) -> Vec<ResourceId> {
        self.accesses
            .iter()
            .filter(|(_, list)| {
                list.iter()
                    .any(|a| a.event_id >= first && a.event_id <= last)
            })
            .map(|(id, _)| *id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn created(&mut self, id: ResourceId, event_id: EventId, has_data: bool) {
        let kind = if has_data {
            AccessKind::Write { full: true }
        } else {
            AccessKind::Clear(ClearValue::Zeroed)
        };
        self.push(id, event_id, kind);
    }

    fn push(&mut self, id: ResourceId, event_id: EventId, kind: AccessKind) {
        if id.is_null() {
            return;
        }
        self.accesses
            .entry(id)
            .or_default()
            .push(Access { event_id, kind });
    }

    fn push_view(&mut self, view: ResourceId, event_id: EventId, kind: AccessKind) {
        if let Some(resource) = self.resource_of(view) {
            self.push(resource, event_id, kind);
        }
    }

    fn texture_of(&self, view: ResourceId) -> Option<(&TextureDesc, Format)> {
        let (resource, view_format) = match self.descs.get(&view)? {
            ResourceDesc::View { resource, desc } => (*resource, desc.format),
            _ => return None,
        };
        let texture = self.descs.get(&resource)?.as_texture()?;
        let format = if view_format == Format::Unknown {
            texture.format
        } else {
            view_format
        };
        Some((texture, format))
    }

    fn single_subresource(&self, id: ResourceId) -> bool {
        match self.descs.get(&id) {
            Some(ResourceDesc::Texture(desc)) => desc.subresource_count() == 1,
            _ => true,
        }
    }

    /// A color clear reproduces as a clear only when it covers the whole
    /// texture through the format a replay-side clear would use.
    fn color_clear(&self, view: ResourceId, color: [f32; 4], any_view: bool) -> AccessKind {
        let Some((texture, format)) = self.texture_of(view) else {
            return AccessKind::Write { full: true };
        };
        let whole = texture.subresource_count() == 1 && !texture.format.is_yuv();
        let reproducible = format == clear_view_format(texture)
            && (!any_view || texture.bind_flags.contains(BindFlags::RENDER_TARGET));
        match (whole, reproducible) {
            (true, true) => AccessKind::Clear(ClearValue::Color(color)),
            (true, false) => AccessKind::Write { full: true },
            (false, _) => AccessKind::Write { full: false },
        }
    }

    fn depth_clear(&self, view: ResourceId, flags: ClearFlags, depth: f32, stencil: u8) -> AccessKind {
        let Some((texture, _)) = self.texture_of(view) else {
            return AccessKind::Write { full: false };
        };
        let planes = if texture.format.has_stencil() {
            ClearFlags::ALL
        } else {
            ClearFlags::DEPTH
        };
        if texture.subresource_count() == 1 && flags.contains(planes) {
            AccessKind::Clear(ClearValue::DepthStencil { depth, stencil })
        } else {
            AccessKind::Write { full: false }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_ipc::{BufferDesc, DeviceCaps, Triangle, ViewDesc, ViewKind};
    use gpucap_log::ChunkWriter;

    const IMMEDIATE: ResourceId = ResourceId::NULL;

    fn id(raw: u64) -> ResourceId {
        ResourceId::from_raw(raw)
    }

    fn triangle() -> Triangle {
        Triangle {
            vertices: [[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]],
            depth: 0.5,
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }

    #[test]
    fn test_clear_then_draw() {
        let mut w = ChunkWriter::new();
        w.append(IMMEDIATE, &Call::DeviceInit { caps: DeviceCaps::default() });
        let desc = TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        w.append(IMMEDIATE, &Call::CreateTexture { id: id(1), desc, initial_data: None });
        w.append(IMMEDIATE, &Call::CreateView {
            id: id(2),
            resource: id(1),
            desc: ViewDesc::new(ViewKind::RenderTarget),
        });
        w.append(IMMEDIATE, &Call::SetRenderTargets {
            render_targets: vec![id(2)],
            depth_stencil: ResourceId::NULL,
        });
        let clear = w.append(IMMEDIATE, &Call::ClearRenderTargetView {
            view: id(2),
            color: [0.0, 0.0, 0.0, 1.0],
        });
        let draw = w.append(IMMEDIATE, &Call::Draw { triangles: vec![triangle()] });
        let index = UsageIndex::build(&w.finish()).unwrap();

        let accesses = index.accesses(id(1));
        assert_eq!(accesses.len(), 3);
        assert_eq!(accesses[0].kind, AccessKind::Clear(ClearValue::Zeroed));
        assert_eq!(accesses[1].event_id, clear);
        assert_eq!(
            accesses[1].kind,
            AccessKind::Clear(ClearValue::Color([0.0, 0.0, 0.0, 1.0]))
        );
        assert_eq!(accesses[2].event_id, draw);
        assert_eq!(accesses[2].kind, AccessKind::Write { full: false });
        assert_eq!(index.touched_in(draw, draw), vec![id(1)]);
        assert_eq!(index.resource_of(id(2)), Some(id(1)));
    }

    #[test]
    fn test_copy_reads_source() {
        let mut w = ChunkWriter::new();
        let desc = BufferDesc::new(16, BindFlags::NONE);
        w.append(IMMEDIATE, &Call::CreateBuffer { id: id(1), desc, initial_data: None });
        w.append(IMMEDIATE, &Call::CreateBuffer { id: id(2), desc, initial_data: None });
        let copy = w.append(IMMEDIATE, &Call::CopyResource { dst: id(2), src: id(1) });
        let index = UsageIndex::build(&w.finish()).unwrap();
        assert_eq!(
            index.accesses(id(1)).last(),
            Some(&Access { event_id: copy, kind: AccessKind::Read })
        );
        assert!(index.accesses(id(2)).last().unwrap().kind.overwrites());
    }

    #[test]
    fn test_command_list_bindings() {
        let mut w = ChunkWriter::new();
        let desc = TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        w.append(IMMEDIATE, &Call::CreateTexture { id: id(1), desc, initial_data: None });
        w.append(IMMEDIATE, &Call::CreateTexture { id: id(2), desc, initial_data: None });
        for (view, res) in [(3, 1), (4, 2)] {
            w.append(IMMEDIATE, &Call::CreateView {
                id: id(view),
                resource: id(res),
                desc: ViewDesc::new(ViewKind::RenderTarget),
            });
        }
        w.append(IMMEDIATE, &Call::SetRenderTargets {
            render_targets: vec![id(3)],
            depth_stencil: ResourceId::NULL,
        });
        w.append(IMMEDIATE, &Call::ExecuteCommandList {
            list: id(9),
            child_count: 2,
            restore_state: true,
        });
        w.append(id(8), &Call::SetRenderTargets {
            render_targets: vec![id(4)],
            depth_stencil: ResourceId::NULL,
        });
        let inner = w.append(id(8), &Call::Draw { triangles: vec![triangle()] });
        let outer = w.append(IMMEDIATE, &Call::Draw { triangles: vec![triangle()] });
        let index = UsageIndex::build(&w.finish()).unwrap();

        assert_eq!(index.accesses(id(2)).last().unwrap().event_id, inner);
        assert_eq!(index.accesses(id(1)).last().unwrap().event_id, outer);
    }
}
