//! Chunk types and the decoded form of every recorded call.

use bytes::{Bytes, BytesMut};

use gpucap_ipc::{
    ActionKind, BufferDesc, ClearFlags, DeviceCaps, DispatchArgs, EventId, Format,
    InitialContents, QueryKind, ResourceId, TextureDesc, Triangle, ViewDesc,
};

use crate::serialise::{Reader, Serialise};
use crate::{LogError, LogResult};

/// Identifies the call a chunk records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ChunkType {
    DeviceInit = 1,
    CreateTexture = 2,
    CreateSwapBuffer = 3,
    CreateBuffer = 4,
    CreateView = 5,
    CreateQuery = 6,
    CreateDeferredContext = 7,
    SetResourceName = 8,
    ReleaseResource = 9,
    InitialContents = 10,
    BeginCapture = 11,
    EndCapture = 12,
    SetRenderTargets = 20,
    SetUnorderedAccess = 21,
    ClearRenderTargetView = 22,
    ClearDepthStencilView = 23,
    ClearView = 24,
    DiscardResource = 25,
    Draw = 26,
    Dispatch = 27,
    CopyResource = 28,
    UpdateSubresource = 29,
    ResolveSubresource = 30,
    Unmap = 31,
    BeginQuery = 32,
    EndQuery = 33,
    ExecuteCommandList = 34,
    PushMarker = 40,
    PopMarker = 41,
    SetMarker = 42,
}

impl ChunkType {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::DeviceInit,
            2 => Self::CreateTexture,
            3 => Self::CreateSwapBuffer,
            4 => Self::CreateBuffer,
            5 => Self::CreateView,
            6 => Self::CreateQuery,
            7 => Self::CreateDeferredContext,
            8 => Self::SetResourceName,
            9 => Self::ReleaseResource,
            10 => Self::InitialContents,
            11 => Self::BeginCapture,
            12 => Self::EndCapture,
            20 => Self::SetRenderTargets,
            21 => Self::SetUnorderedAccess,
            22 => Self::ClearRenderTargetView,
            23 => Self::ClearDepthStencilView,
            24 => Self::ClearView,
            25 => Self::DiscardResource,
            26 => Self::Draw,
            27 => Self::Dispatch,
            28 => Self::CopyResource,
            29 => Self::UpdateSubresource,
            30 => Self::ResolveSubresource,
            31 => Self::Unmap,
            32 => Self::BeginQuery,
            33 => Self::EndQuery,
            34 => Self::ExecuteCommandList,
            40 => Self::PushMarker,
            41 => Self::PopMarker,
            42 => Self::SetMarker,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DeviceInit => "DeviceInit",
            Self::CreateTexture => "CreateTexture",
            Self::CreateSwapBuffer => "CreateSwapBuffer",
            Self::CreateBuffer => "CreateBuffer",
            Self::CreateView => "CreateView",
            Self::CreateQuery => "CreateQuery",
            Self::CreateDeferredContext => "CreateDeferredContext",
            Self::SetResourceName => "SetResourceName",
            Self::ReleaseResource => "ReleaseResource",
            Self::InitialContents => "InitialContents",
            Self::BeginCapture => "BeginCapture",
            Self::EndCapture => "EndCapture",
            Self::SetRenderTargets => "OMSetRenderTargets",
            Self::SetUnorderedAccess => "CSSetUnorderedAccessViews",
            Self::ClearRenderTargetView => "ClearRenderTargetView",
            Self::ClearDepthStencilView => "ClearDepthStencilView",
            Self::ClearView => "ClearView",
            Self::DiscardResource => "DiscardResource",
            Self::Draw => "Draw",
            Self::Dispatch => "Dispatch",
            Self::CopyResource => "CopyResource",
            Self::UpdateSubresource => "UpdateSubresource",
            Self::ResolveSubresource => "ResolveSubresource",
            Self::Unmap => "Unmap",
            Self::BeginQuery => "Begin",
            Self::EndQuery => "End",
            Self::ExecuteCommandList => "ExecuteCommandList",
            Self::PushMarker => "PushMarker",
            Self::PopMarker => "PopMarker",
            Self::SetMarker => "SetMarker",
        }
    }

    /// Returns true for chunks that describe the device's objects rather than
    /// work inside the captured frame.
    pub fn is_setup(self) -> bool {
        self.code() < Self::SetRenderTargets.code()
    }
}

/// One recorded call with its full argument set.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    DeviceInit {
        caps: DeviceCaps,
    },
    CreateTexture {
        id: ResourceId,
        desc: TextureDesc,
        initial_data: Option<Bytes>,
    },
    /// A presentable back buffer, displayed with gamma correction.
    CreateSwapBuffer {
        id: ResourceId,
        desc: TextureDesc,
    },
    CreateBuffer {
        id: ResourceId,
        desc: BufferDesc,
        initial_data: Option<Bytes>,
    },
    CreateView {
        id: ResourceId,
        resource: ResourceId,
        desc: ViewDesc,
    },
    CreateQuery {
        id: ResourceId,
        kind: QueryKind,
    },
    CreateDeferredContext {
        id: ResourceId,
    },
    SetResourceName {
        id: ResourceId,
        name: String,
    },
    ReleaseResource {
        id: ResourceId,
    },
    InitialContents {
        id: ResourceId,
        contents: InitialContents,
    },
    BeginCapture {
        frame: u32,
    },
    EndCapture,
    SetRenderTargets {
        render_targets: Vec<ResourceId>,
        depth_stencil: ResourceId,
    },
    SetUnorderedAccess {
        views: Vec<ResourceId>,
    },
    ClearRenderTargetView {
        view: ResourceId,
        color: [f32; 4],
    },
    ClearDepthStencilView {
        view: ResourceId,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    },
    ClearView {
        view: ResourceId,
        color: [f32; 4],
    },
    DiscardResource {
        id: ResourceId,
    },
    Draw {
        triangles: Vec<Triangle>,
    },
    Dispatch {
        args: DispatchArgs,
    },
    CopyResource {
        dst: ResourceId,
        src: ResourceId,
    },
    UpdateSubresource {
        dst: ResourceId,
        subresource: u32,
        data: Bytes,
    },
    ResolveSubresource {
        dst: ResourceId,
        src: ResourceId,
        format: Format,
    },
    /// Bytes written through a CPU map, applied at unmap.
    Unmap {
        id: ResourceId,
        subresource: u32,
        data: Bytes,
    },
    BeginQuery {
        query: ResourceId,
    },
    EndQuery {
        query: ResourceId,
    },
    /// Submission of a command list; the next `child_count` chunks are the
    /// list's recorded calls.
    ExecuteCommandList {
        list: ResourceId,
        child_count: u32,
        restore_state: bool,
    },
    PushMarker {
        name: String,
    },
    PopMarker,
    SetMarker {
        name: String,
    },
}

impl Call {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Self::DeviceInit { .. } => ChunkType::DeviceInit,
            Self::CreateTexture { .. } => ChunkType::CreateTexture,
            Self::CreateSwapBuffer { .. } => ChunkType::CreateSwapBuffer,
            Self::CreateBuffer { .. } => ChunkType::CreateBuffer,
            Self::CreateView { .. } => ChunkType::CreateView,
            Self::CreateQuery { .. } => ChunkType::CreateQuery,
            Self::CreateDeferredContext { .. } => ChunkType::CreateDeferredContext,
            Self::SetResourceName { .. } => ChunkType::SetResourceName,
            Self::ReleaseResource { .. } => ChunkType::ReleaseResource,
            Self::InitialContents { .. } => ChunkType::InitialContents,
            Self::BeginCapture { .. } => ChunkType::BeginCapture,
            Self::EndCapture => ChunkType::EndCapture,
            Self::SetRenderTargets { .. } => ChunkType::SetRenderTargets,
            Self::SetUnorderedAccess { .. } => ChunkType::SetUnorderedAccess,
            Self::ClearRenderTargetView { .. } => ChunkType::ClearRenderTargetView,
            Self::ClearDepthStencilView { .. } => ChunkType::ClearDepthStencilView,
            Self::ClearView { .. } => ChunkType::ClearView,
            Self::DiscardResource { .. } => ChunkType::DiscardResource,
            Self::Draw { .. } => ChunkType::Draw,
            Self::Dispatch { .. } => ChunkType::Dispatch,
            Self::CopyResource { .. } => ChunkType::CopyResource,
            Self::UpdateSubresource { .. } => ChunkType::UpdateSubresource,
            Self::ResolveSubresource { .. } => ChunkType::ResolveSubresource,
            Self::Unmap { .. } => ChunkType::Unmap,
            Self::BeginQuery { .. } => ChunkType::BeginQuery,
            Self::EndQuery { .. } => ChunkType::EndQuery,
            Self::ExecuteCommandList { .. } => ChunkType::ExecuteCommandList,
            Self::PushMarker { .. } => ChunkType::PushMarker,
            Self::PopMarker => ChunkType::PopMarker,
            Self::SetMarker { .. } => ChunkType::SetMarker,
        }
    }

    /// The drawcall-tree category of this call, if it is an action.
    pub fn action(&self) -> Option<ActionKind> {
        match self {
            Self::Draw { .. } => Some(ActionKind::Draw),
            Self::Dispatch { .. } => Some(ActionKind::Dispatch),
            Self::ClearRenderTargetView { .. }
            | Self::ClearDepthStencilView { .. }
            | Self::ClearView { .. } => Some(ActionKind::Clear),
            Self::CopyResource { .. } | Self::UpdateSubresource { .. } => Some(ActionKind::Copy),
            Self::ResolveSubresource { .. } => Some(ActionKind::Resolve),
            Self::ExecuteCommandList { .. } => Some(ActionKind::ExecuteCommandList),
            Self::SetMarker { .. } => Some(ActionKind::Marker),
            _ => None,
        }
    }

    /// Id of the object this call creates, if any.
    pub fn created_id(&self) -> Option<ResourceId> {
        match self {
            Self::CreateTexture { id, .. }
            | Self::CreateSwapBuffer { id, .. }
            | Self::CreateBuffer { id, .. }
            | Self::CreateView { id, .. }
            | Self::CreateQuery { id, .. }
            | Self::CreateDeferredContext { id } => Some(*id),
            _ => None,
        }
    }

    /// Encodes the call's payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Self::DeviceInit { caps } => caps.serialise(&mut out),
            Self::CreateTexture {
                id,
                desc,
                initial_data,
            } => {
                id.serialise(&mut out);
                desc.serialise(&mut out);
                initial_data.serialise(&mut out);
            }
            Self::CreateSwapBuffer { id, desc } => {
                id.serialise(&mut out);
                desc.serialise(&mut out);
            }
            Self::CreateBuffer {
                id,
                desc,
                initial_data,
            } => {
                id.serialise(&mut out);
                desc.serialise(&mut out);
                initial_data.serialise(&mut out);
            }
            Self::CreateView { id, resource, desc } => {
                id.serialise(&mut out);
                resource.serialise(&mut out);
                desc.serialise(&mut out);
            }
            Self::CreateQuery { id, kind } => {
                id.serialise(&mut out);
                kind.serialise(&mut out);
            }
            Self::CreateDeferredContext { id }
            | Self::ReleaseResource { id }
            | Self::DiscardResource { id } => id.serialise(&mut out),
            Self::SetResourceName { id, name } => {
                id.serialise(&mut out);
                name.serialise(&mut out);
            }
            Self::InitialContents { id, contents } => {
                id.serialise(&mut out);
                contents.serialise(&mut out);
            }
            Self::BeginCapture { frame } => frame.serialise(&mut out),
            Self::EndCapture | Self::PopMarker => {}
            Self::SetRenderTargets {
                render_targets,
                depth_stencil,
            } => {
                render_targets.serialise(&mut out);
                depth_stencil.serialise(&mut out);
            }
            Self::SetUnorderedAccess { views } => views.serialise(&mut out),
            Self::ClearRenderTargetView { view, color } | Self::ClearView { view, color } => {
                view.serialise(&mut out);
                color.serialise(&mut out);
            }
            Self::ClearDepthStencilView {
                view,
                flags,
                depth,
                stencil,
            } => {
                view.serialise(&mut out);
                flags.serialise(&mut out);
                depth.serialise(&mut out);
                stencil.serialise(&mut out);
            }
            Self::Draw { triangles } => triangles.serialise(&mut out),
            Self::Dispatch { args } => args.serialise(&mut out),
            Self::CopyResource { dst, src } => {
                dst.serialise(&mut out);
                src.serialise(&mut out);
            }
            Self::UpdateSubresource {
                dst,
                subresource,
                data,
            } => {
                dst.serialise(&mut out);
                subresource.serialise(&mut out);
                data.serialise(&mut out);
            }
            Self::ResolveSubresource { dst, src, format } => {
                dst.serialise(&mut out);
                src.serialise(&mut out);
                format.serialise(&mut out);
            }
            Self::Unmap {
                id,
                subresource,
                data,
            } => {
                id.serialise(&mut out);
                subresource.serialise(&mut out);
                data.serialise(&mut out);
            }
            Self::BeginQuery { query } | Self::EndQuery { query } => query.serialise(&mut out),
            Self::ExecuteCommandList {
                list,
                child_count,
                restore_state,
            } => {
                list.serialise(&mut out);
                child_count.serialise(&mut out);
                restore_state.serialise(&mut out);
            }
            Self::PushMarker { name } | Self::SetMarker { name } => name.serialise(&mut out),
        }
        out.freeze()
    }

    /// Decodes a payload of the given chunk type.
    pub fn decode(chunk_type: ChunkType, payload: Bytes, event_id: EventId) -> LogResult<Self> {
        let mut r = Reader::new(payload, event_id);
        let call = match chunk_type {
            ChunkType::DeviceInit => Self::DeviceInit { caps: r.read()? },
            ChunkType::CreateTexture => Self::CreateTexture {
                id: r.read()?,
                desc: r.read()?,
                initial_data: r.read()?,
            },
            ChunkType::CreateSwapBuffer => Self::CreateSwapBuffer {
                id: r.read()?,
                desc: r.read()?,
            },
            ChunkType::CreateBuffer => Self::CreateBuffer {
                id: r.read()?,
                desc: r.read()?,
                initial_data: r.read()?,
            },
            ChunkType::CreateView => Self::CreateView {
                id: r.read()?,
                resource: r.read()?,
                desc: r.read()?,
            },
            ChunkType::CreateQuery => Self::CreateQuery {
                id: r.read()?,
                kind: r.read()?,
            },
            ChunkType::CreateDeferredContext => Self::CreateDeferredContext { id: r.read()? },
            ChunkType::SetResourceName => Self::SetResourceName {
                id: r.read()?,
                name: r.read()?,
            },
            ChunkType::ReleaseResource => Self::ReleaseResource { id: r.read()? },
            ChunkType::InitialContents => Self::InitialContents {
                id: r.read()?,
                contents: r.read()?,
            },
            ChunkType::BeginCapture => Self::BeginCapture { frame: r.read()? },
            ChunkType::EndCapture => Self::EndCapture,
            ChunkType::SetRenderTargets => Self::SetRenderTargets {
                render_targets: r.read()?,
                depth_stencil: r.read()?,
            },
            ChunkType::SetUnorderedAccess => Self::SetUnorderedAccess { views: r.read()? },
            ChunkType::ClearRenderTargetView => Self::ClearRenderTargetView {
                view: r.read()?,
                color: r.read()?,
            },
            ChunkType::ClearDepthStencilView => Self::ClearDepthStencilView {
                view: r.read()?,
                flags: r.read()?,
                depth: r.read()?,
                stencil: r.read()?,
            },
            ChunkType::ClearView => Self::ClearView {
                view: r.read()?,
                color: r.read()?,
            },
            ChunkType::DiscardResource => Self::DiscardResource { id: r.read()? },
            ChunkType::Draw => Self::Draw {
                triangles: r.read()?,
            },
            ChunkType::Dispatch => Self::Dispatch { args: r.read()? },
            ChunkType::CopyResource => Self::CopyResource {
                dst: r.read()?,
                src: r.read()?,
            },
            ChunkType::UpdateSubresource => Self::UpdateSubresource {
                dst: r.read()?,
                subresource: r.read()?,
                data: r.read()?,
            },
            ChunkType::ResolveSubresource => Self::ResolveSubresource {
                dst: r.read()?,
                src: r.read()?,
                format: r.read()?,
            },
            ChunkType::Unmap => Self::Unmap {
                id: r.read()?,
                subresource: r.read()?,
                data: r.read()?,
            },
            ChunkType::BeginQuery => Self::BeginQuery { query: r.read()? },
            ChunkType::EndQuery => Self::EndQuery { query: r.read()? },
            ChunkType::ExecuteCommandList => Self::ExecuteCommandList {
                list: r.read()?,
                child_count: r.read()?,
                restore_state: r.read()?,
            },
            ChunkType::PushMarker => Self::PushMarker { name: r.read()? },
            ChunkType::PopMarker => Self::PopMarker,
            ChunkType::SetMarker => Self::SetMarker { name: r.read()? },
        };
        r.finish()?;
        Ok(call)
    }
}

/// Decodes a raw chunk type code, failing on codes this reader does not know.
pub(crate) fn chunk_type_for(code: u16, event_id: EventId) -> LogResult<ChunkType> {
    ChunkType::from_code(code).ok_or(LogError::UnknownChunkType { code, event_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_ipc::{ClearValue, Format, ViewKind};

    fn decode_same(call: &Call) -> Call {
        Call::decode(call.chunk_type(), call.encode(), 0).unwrap()
    }

    #[test]
    fn test_chunk_type_codes_round_trip() {
        for code in 0..64u16 {
            if let Some(ty) = ChunkType::from_code(code) {
                assert_eq!(ty.code(), code);
            }
        }
        assert!(ChunkType::CreateView.is_setup());
        assert!(!ChunkType::Draw.is_setup());
    }

    #[test]
    fn test_draw_payload() {
        let call = Call::Draw {
            triangles: vec![Triangle {
                vertices: [[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]],
                depth: 0.5,
                color: [1.0, 0.0, 0.0, 1.0],
            }],
        };
        assert_eq!(decode_same(&call), call);
        assert_eq!(call.action(), Some(ActionKind::Draw));
    }

    #[test]
    fn test_initial_contents_payload() {
        let call = Call::InitialContents {
            id: ResourceId::from_raw(9),
            contents: InitialContents::Clear(ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }),
        };
        assert_eq!(decode_same(&call), call);
    }

    #[test]
    fn test_view_payload_and_created_id() {
        let call = Call::CreateView {
            id: ResourceId::from_raw(3),
            resource: ResourceId::from_raw(2),
            desc: ViewDesc::new(ViewKind::ShaderResource).with_format(Format::R8G8B8A8Unorm),
        };
        assert_eq!(decode_same(&call), call);
        assert_eq!(call.created_id(), Some(ResourceId::from_raw(3)));
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut payload = Call::PopMarker.encode().to_vec();
        payload.push(0);
        let err = Call::decode(ChunkType::PopMarker, Bytes::from(payload), 12).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { event_id: 12, .. }));
    }

    #[test]
    fn test_unknown_code() {
        assert!(matches!(
            chunk_type_for(999, 4),
            Err(LogError::UnknownChunkType { code: 999, event_id: 4 })
        ));
    }
}
