//! Common types shared by capture, replay and the log encoding.

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::format::{CompType, Format};

/// Stable identifier of a logical device object.
///
/// Assigned once at creation and never reused, independent of whatever native
/// handle the driver hands out for the object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ResourceId(u64);

impl ResourceId {
    /// The id that never names a resource.
    pub const NULL: ResourceId = ResourceId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId::{}", self.0)
    }
}

/// Position of a call in the capture timeline.
pub type EventId = u32;

/// Category of a device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Device,
    DeviceContext,
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
    RenderTargetView,
    DepthStencilView,
    ShaderResourceView,
    UnorderedAccessView,
    Query,
    CommandList,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Device => "Device",
            Self::DeviceContext => "DeviceContext",
            Self::Buffer => "Buffer",
            Self::Texture1D => "Texture1D",
            Self::Texture2D => "Texture2D",
            Self::Texture3D => "Texture3D",
            Self::RenderTargetView => "RenderTargetView",
            Self::DepthStencilView => "DepthStencilView",
            Self::ShaderResourceView => "ShaderResourceView",
            Self::UnorderedAccessView => "UnorderedAccessView",
            Self::Query => "Query",
            Self::CommandList => "CommandList",
        }
    }

    /// Returns true for kinds that own memory with contents worth restoring.
    pub fn has_contents(self) -> bool {
        matches!(
            self,
            Self::Buffer | Self::Texture1D | Self::Texture2D | Self::Texture3D
        )
    }

    pub fn is_view(self) -> bool {
        matches!(
            self,
            Self::RenderTargetView
                | Self::DepthStencilView
                | Self::ShaderResourceView
                | Self::UnorderedAccessView
        )
    }
}

/// Expected CPU/GPU access pattern of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Usage {
    #[default]
    Default,
    /// Contents are fixed at creation.
    Immutable,
    /// CPU-writable through write-discard maps.
    Dynamic,
    /// CPU-readable and writable copy target.
    Staging,
}

/// Pipeline stages a resource may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BindFlags(u32);

impl BindFlags {
    pub const NONE: BindFlags = BindFlags(0);
    pub const VERTEX_BUFFER: BindFlags = BindFlags(0x1);
    pub const INDEX_BUFFER: BindFlags = BindFlags(0x2);
    pub const CONSTANT_BUFFER: BindFlags = BindFlags(0x4);
    pub const SHADER_RESOURCE: BindFlags = BindFlags(0x8);
    pub const RENDER_TARGET: BindFlags = BindFlags(0x20);
    pub const DEPTH_STENCIL: BindFlags = BindFlags(0x40);
    pub const UNORDERED_ACCESS: BindFlags = BindFlags(0x80);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: BindFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BindFlags {
    type Output = BindFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BindFlags(self.0 | rhs.0)
    }
}

/// Which planes a depth-stencil clear touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClearFlags(u8);

impl ClearFlags {
    pub const DEPTH: ClearFlags = ClearFlags(0x1);
    pub const STENCIL: ClearFlags = ClearFlags(0x2);
    pub const ALL: ClearFlags = ClearFlags(0x3);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x3)
    }

    pub const fn contains(self, other: ClearFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ClearFlags {
    type Output = ClearFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ClearFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
}

/// Description of a texture resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureDesc {
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    /// Depth of a 3D texture, 1 otherwise.
    pub depth: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub sample_count: u32,
    pub usage: Usage,
    pub bind_flags: BindFlags,
}

/// Placement of one subresource inside a texture's linear storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceLayout {
    pub offset: usize,
    pub len: usize,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TextureDesc {
    /// A single-mip, single-sample 2D texture bindable as a render target and
    /// shader resource.
    pub fn new_2d(width: u32, height: u32, format: Format) -> Self {
        let bind_flags = if format.is_depth() {
            BindFlags::DEPTH_STENCIL
        } else {
            BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE
        };
        Self {
            dimension: TextureDimension::D2,
            width,
            height,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            format,
            sample_count: 1,
            usage: Usage::Default,
            bind_flags,
        }
    }

    pub fn with_bind_flags(mut self, bind_flags: BindFlags) -> Self {
        self.bind_flags = bind_flags;
        self
    }

    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        match self.dimension {
            TextureDimension::D1 => ResourceKind::Texture1D,
            TextureDimension::D2 => ResourceKind::Texture2D,
            TextureDimension::D3 => ResourceKind::Texture3D,
        }
    }

    pub fn is_multisampled(&self) -> bool {
        self.sample_count > 1
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels.max(1) * self.array_size.max(1)
    }

    /// Layout of subresource `index` (mip-major within each array slice).
    pub fn subresource_layout(&self, index: u32) -> Option<SubresourceLayout> {
        if index >= self.subresource_count() {
            return None;
        }
        let mips = self.mip_levels.max(1);
        let (slice, mip) = (index / mips, index % mips);
        let mut offset = slice as usize * self.slice_size();
        for m in 0..mip {
            offset += self.mip_size(m);
        }
        let (width, height, depth) = self.mip_extent(mip);
        Some(SubresourceLayout {
            offset,
            len: self.mip_size(mip),
            width,
            height,
            depth,
        })
    }

    /// Total bytes of linear storage, all samples included.
    pub fn byte_size(&self) -> usize {
        self.slice_size() * self.array_size.max(1) as usize
    }

    fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    fn mip_size(&self, mip: u32) -> usize {
        let (w, h, d) = self.mip_extent(mip);
        self.format.surface_size(w, h) * d as usize * self.sample_count.max(1) as usize
    }

    fn slice_size(&self) -> usize {
        (0..self.mip_levels.max(1)).map(|m| self.mip_size(m)).sum()
    }
}

/// Description of a buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferDesc {
    pub byte_width: u32,
    pub usage: Usage,
    pub bind_flags: BindFlags,
    /// Element stride for structured buffers, 0 otherwise.
    pub structure_stride: u32,
}

impl BufferDesc {
    pub fn new(byte_width: u32, bind_flags: BindFlags) -> Self {
        Self {
            byte_width,
            usage: Usage::Default,
            bind_flags,
            structure_stride: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
    UnorderedAccess,
}

impl ViewKind {
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            Self::RenderTarget => ResourceKind::RenderTargetView,
            Self::DepthStencil => ResourceKind::DepthStencilView,
            Self::ShaderResource => ResourceKind::ShaderResourceView,
            Self::UnorderedAccess => ResourceKind::UnorderedAccessView,
        }
    }

    /// Bind flag the viewed resource must carry.
    pub fn required_bind(self) -> BindFlags {
        match self {
            Self::RenderTarget => BindFlags::RENDER_TARGET,
            Self::DepthStencil => BindFlags::DEPTH_STENCIL,
            Self::ShaderResource => BindFlags::SHADER_RESOURCE,
            Self::UnorderedAccess => BindFlags::UNORDERED_ACCESS,
        }
    }
}

/// Description of a view over a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewDesc {
    pub kind: ViewKind,
    /// `Format::Unknown` means the viewed resource's own format.
    pub format: Format,
    /// Plane index for planar formats.
    pub plane: u32,
}

impl ViewDesc {
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            format: Format::Unknown,
            plane: 0,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_plane(mut self, plane: u32) -> Self {
        self.plane = plane;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    Event,
    Occlusion,
    Timestamp,
    TimestampDisjoint,
}

/// Resolved contents of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum QueryData {
    Event(bool),
    Occlusion(u64),
    Timestamp(u64),
    TimestampDisjoint { frequency: u64, disjoint: bool },
}

/// Full description of any creatable object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResourceDesc {
    Texture(TextureDesc),
    Buffer(BufferDesc),
    View { resource: ResourceId, desc: ViewDesc },
    Query(QueryKind),
    DeferredContext,
    CommandList,
}

impl ResourceDesc {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Texture(desc) => desc.kind(),
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::View { desc, .. } => desc.kind.resource_kind(),
            Self::Query(_) => ResourceKind::Query,
            Self::DeferredContext => ResourceKind::DeviceContext,
            Self::CommandList => ResourceKind::CommandList,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureDesc> {
        match self {
            Self::Texture(desc) => Some(desc),
            _ => None,
        }
    }

    /// Bytes of storage owned by the resource, 0 for objects without contents.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Texture(desc) => desc.byte_size(),
            Self::Buffer(desc) => desc.byte_width as usize,
            _ => 0,
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            Self::Texture(desc) => desc.usage,
            Self::Buffer(desc) => desc.usage,
            _ => Usage::Default,
        }
    }

    pub fn bind_flags(&self) -> BindFlags {
        match self {
            Self::Texture(desc) => desc.bind_flags,
            Self::Buffer(desc) => desc.bind_flags,
            _ => BindFlags::NONE,
        }
    }
}

/// One triangle, in pixel coordinates of the bound render target, with a flat
/// color and a flat depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Triangle {
    pub vertices: [[f32; 2]; 3],
    pub depth: f32,
    pub color: [f32; 4],
}

/// Compute dispatch arguments. Every invocation writes `value` into the
/// 32-bit element of the bound unordered-access target at its flat index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchArgs {
    pub groups: [u32; 3],
    pub threads_per_group: u32,
    pub value: u32,
}

impl DispatchArgs {
    pub fn invocations(&self) -> u64 {
        self.groups.iter().map(|g| *g as u64).product::<u64>() * self.threads_per_group as u64
    }
}

/// CPU access requested when mapping a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapMode {
    Read,
    Write,
    ReadWrite,
    WriteDiscard,
}

impl MapMode {
    pub fn writes(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Value a resource is cleared to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
    /// Every byte of storage set to zero.
    Zeroed,
}

/// Contents a resource must hold at the start of a replayed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitialContents {
    /// Full copy of the stored bytes.
    Copy(Bytes),
    /// Resource is cleared to a single value.
    Clear(ClearValue),
    /// Resource is fully written before it is read, nothing to restore.
    NoneNeeded,
}

impl InitialContents {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Copy(_) => "Copy",
            Self::Clear(_) => "Clear",
            Self::NoneNeeded => "NoneNeeded",
        }
    }
}

/// Interface generations a device may expose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum InterfaceVersion {
    #[default]
    V0,
    V1,
    /// Adds resource discard.
    V2,
    /// Adds generic view clears.
    V3,
}

impl InterfaceVersion {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::V0),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }
}

/// Capabilities a device reports at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub interface_version: InterfaceVersion,
    /// Device may be called from several threads at once.
    pub thread_safe: bool,
    pub max_sample_count: u32,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            interface_version: InterfaceVersion::V3,
            thread_safe: true,
            max_sample_count: 8,
        }
    }
}

/// A counter that can be fetched for each draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GpuCounter {
    /// GPU time between the start and the end of one draw.
    EventGpuDuration,
    /// Counter provided by an external vendor source.
    Vendor(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterUnit {
    Absolute,
    Seconds,
    Percentage,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDescription {
    pub counter: GpuCounter,
    pub name: String,
    pub description: String,
    pub unit: CounterUnit,
    /// Width in bytes of the natural result type.
    pub result_width: u32,
}

/// One counter value for one event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterResult {
    pub event_id: EventId,
    pub counter: GpuCounter,
    pub value: f64,
}

/// A non-fatal problem observed while replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayAnomaly {
    pub event_id: EventId,
    pub description: String,
}

impl ReplayAnomaly {
    pub fn new(event_id: EventId, description: impl Into<String>) -> Self {
        Self {
            event_id,
            description: description.into(),
        }
    }
}

impl fmt::Display for ReplayAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {}: {}", self.event_id, self.description)
    }
}

/// Category of a node in the drawcall tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Draw,
    Dispatch,
    Clear,
    Copy,
    Resolve,
    ExecuteCommandList,
    Marker,
    /// A push/pop marker region.
    Group,
}

impl ActionKind {
    /// Returns true for actions whose GPU time the counter pipeline measures.
    pub fn is_timed(self) -> bool {
        matches!(self, Self::Draw | Self::Dispatch)
    }
}

/// One node of the drawcall tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawcallDescription {
    pub event_id: EventId,
    pub name: String,
    pub kind: ActionKind,
    pub children: Vec<DrawcallDescription>,
}

/// How a debug view presents its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DebugViewType {
    Texture1D,
    Texture2D,
    Texture2DMs,
    Texture3D,
    Depth,
    DepthMs,
    Yuv,
    Buffer,
}

/// Summary of a cached debug view, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugViewInfo {
    pub resource: ResourceId,
    pub comp_type: CompType,
    pub raw: bool,
    pub view_type: DebugViewType,
    pub view_formats: Vec<Format>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Whether a normalized temporary copy backs the views.
    pub has_temporary: bool,
    pub srgb_corrected: bool,
}

/// Replay-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of entries the debug-view cache keeps (default: 64).
    pub debug_view_capacity: usize,

    /// Replay passes per counter fetch (default: 2).
    pub counter_passes: u32,

    /// Polls of a pending query before giving up on it (default: 100000).
    pub query_poll_limit: u32,

    /// Whether the software driver reports thread safety (default: true).
    pub soft_thread_safe: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            debug_view_capacity: 64,
            counter_passes: 2,
            query_poll_limit: 100_000,
            soft_thread_safe: true,
        }
    }
}

/// Capture-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Store initial contents for every live resource at capture start.
    pub capture_all_initial_contents: bool,

    /// Forces the coarse device lock on or off; `None` follows the device's
    /// reported thread safety.
    pub force_device_lock: Option<bool>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            capture_all_initial_contents: true,
            force_device_lock: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_display() {
        assert_eq!(ResourceId::from_raw(7).to_string(), "ResourceId::7");
        assert!(ResourceId::NULL.is_null());
    }

    #[test]
    fn test_bind_flags() {
        let flags = BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE;
        assert!(flags.contains(BindFlags::RENDER_TARGET));
        assert!(!flags.contains(BindFlags::DEPTH_STENCIL));
        assert_eq!(flags.bits(), 0x28);
    }

    #[test]
    fn test_texture_layout_with_mips() {
        let mut desc = TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm);
        desc.mip_levels = 3;
        desc.array_size = 2;
        // 64 + 16 + 4 per slice.
        assert_eq!(desc.byte_size(), 2 * 84);
        let sub = desc.subresource_layout(4).expect("slice 1 mip 1");
        assert_eq!(sub.offset, 84 + 64);
        assert_eq!(sub.len, 16);
        assert_eq!((sub.width, sub.height), (2, 2));
        assert!(desc.subresource_layout(6).is_none());
    }

    #[test]
    fn test_msaa_size() {
        let desc = TextureDesc::new_2d(2, 2, Format::R32Float).with_samples(4);
        assert_eq!(desc.byte_size(), 2 * 2 * 4 * 4);
    }

    #[test]
    fn test_replay_config_defaults_from_empty_json() {
        let config: ReplayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.debug_view_capacity, 64);
        assert_eq!(config.counter_passes, 2);
    }

    #[test]
    fn test_interface_version_ordering() {
        assert!(InterfaceVersion::V3 > InterfaceVersion::V1);
        assert_eq!(InterfaceVersion::from_code(2), Some(InterfaceVersion::V2));
        assert_eq!(InterfaceVersion::from_code(9), None);
    }
}
