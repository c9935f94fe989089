//! Deterministic software backend.
//!
//! Runs every operation synchronously on the CPU. Timestamps come from a tick
//! clock that advances by the work each operation does (one tick per sample
//! or byte touched plus a fixed per-operation overhead), so timings are
//! reproducible across runs. Queries become available only after a
//! configurable number of polls to exercise callers' wait loops.

mod context;
mod raster;
mod texel;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use gpucap_ipc::{
    BufferDesc, DeviceCaps, Format, QueryKind, TextureDesc, TextureDimension, Usage, ViewDesc,
    ViewKind,
};

use crate::device::{DriverContext, DriverDevice, DriverStats};
use crate::handle::HandleTable;
use crate::{DriverError, DriverResult, NativeHandle};

pub use context::SoftContext;
pub(crate) use context::SoftOp;

/// Tick frequency of the software clock (one tick per nanosecond).
pub const SOFT_TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

/// Largest texture edge the software backend accepts.
pub const SOFT_MAX_TEXTURE_DIMENSION: u32 = 16_384;

/// Configuration for a [`SoftDevice`].
#[derive(Debug, Clone)]
pub struct SoftConfig {
    /// Capabilities reported to callers.
    pub caps: DeviceCaps,

    /// Polls a query stays pending after it ends (default: 2).
    pub query_latency: u32,

    /// Report every timestamp-disjoint query as disjoint, as a GPU whose
    /// clock changed mid-measurement would (default: false).
    pub report_disjoint: bool,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            caps: DeviceCaps::default(),
            query_latency: 2,
            report_disjoint: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum QueryState {
    Idle,
    Building { start_ticks: u64, start_samples: u64 },
    Ended { result: QueryResult, polls_left: u32 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum QueryResult {
    Event,
    Occlusion(u64),
    Timestamp(u64),
    Disjoint,
}

pub(crate) enum SoftObject {
    Texture { desc: TextureDesc, data: Vec<u8> },
    Buffer { desc: BufferDesc, data: Vec<u8> },
    View { resource: NativeHandle, desc: ViewDesc },
    Query { kind: QueryKind, state: QueryState },
    CommandList(Vec<SoftOp>),
}

impl SoftObject {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Texture { .. } => "texture",
            Self::Buffer { .. } => "buffer",
            Self::View { .. } => "view",
            Self::Query { .. } => "query",
            Self::CommandList(_) => "command list",
        }
    }
}

#[derive(Default)]
struct SoftCounters {
    textures_created: AtomicU64,
    buffers_created: AtomicU64,
    views_created: AtomicU64,
    queries_created: AtomicU64,
}

/// State shared by the device and all of its contexts.
pub(crate) struct SoftShared {
    pub(crate) config: SoftConfig,
    pub(crate) objects: Mutex<HandleTable<SoftObject>>,
    /// Tick clock, advanced by executed work.
    pub(crate) clock: AtomicU64,
    /// Samples that passed the depth test since creation.
    pub(crate) samples_passed: AtomicU64,
    counters: SoftCounters,
}

impl SoftShared {
    pub(crate) fn advance_clock(&self, ticks: u64) {
        self.clock.fetch_add(ticks, Ordering::SeqCst);
    }
}

/// Software device.
pub struct SoftDevice {
    shared: Arc<SoftShared>,
    immediate: Arc<SoftContext>,
}

impl SoftDevice {
    pub fn new(config: SoftConfig) -> Self {
        debug!(
            interface_version = ?config.caps.interface_version,
            thread_safe = config.caps.thread_safe,
            "Created software device"
        );
        let shared = Arc::new(SoftShared {
            config,
            objects: Mutex::new(HandleTable::new()),
            clock: AtomicU64::new(0),
            samples_passed: AtomicU64::new(0),
            counters: SoftCounters::default(),
        });
        let immediate = Arc::new(SoftContext::new(Arc::clone(&shared), false));
        Self { shared, immediate }
    }

    /// Current value of the tick clock.
    pub fn ticks(&self) -> u64 {
        self.shared.clock.load(Ordering::SeqCst)
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new(SoftConfig::default())
    }
}

fn validate_texture(desc: &TextureDesc, caps: &DeviceCaps) -> DriverResult<()> {
    if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
        return Err(DriverError::InvalidArgument(format!(
            "texture extent {}x{}x{}",
            desc.width, desc.height, desc.depth
        )));
    }
    if desc.width > SOFT_MAX_TEXTURE_DIMENSION || desc.height > SOFT_MAX_TEXTURE_DIMENSION {
        return Err(DriverError::InvalidArgument(format!(
            "texture extent {}x{} exceeds {}",
            desc.width, desc.height, SOFT_MAX_TEXTURE_DIMENSION
        )));
    }
    if desc.format == Format::Unknown {
        return Err(DriverError::InvalidArgument("texture format unknown".into()));
    }
    if desc.sample_count > 1 {
        if desc.sample_count > caps.max_sample_count || !desc.sample_count.is_power_of_two() {
            return Err(DriverError::InvalidArgument(format!(
                "sample count {}",
                desc.sample_count
            )));
        }
        if desc.dimension != TextureDimension::D2 || desc.mip_levels > 1 {
            return Err(DriverError::InvalidArgument(
                "multisampled textures must be single-mip 2D".into(),
            ));
        }
    }
    if desc.format.is_yuv() && (desc.width % 2 != 0 || desc.height % 2 != 0) {
        return Err(DriverError::InvalidArgument(
            "planar YUV textures need even dimensions".into(),
        ));
    }
    if desc.format.is_depth() && !desc.bind_flags.contains(gpucap_ipc::BindFlags::DEPTH_STENCIL) {
        return Err(DriverError::InvalidArgument(
            "depth format without depth-stencil binding".into(),
        ));
    }
    Ok(())
}

fn initial_storage(len: usize, usage: Usage, initial_data: Option<&[u8]>) -> DriverResult<Vec<u8>> {
    match initial_data {
        Some(data) if data.len() != len => Err(DriverError::InvalidArgument(format!(
            "initial data is {} bytes, resource needs {}",
            data.len(),
            len
        ))),
        Some(data) => Ok(data.to_vec()),
        None if usage == Usage::Immutable => Err(DriverError::InvalidArgument(
            "immutable resource without initial data".into(),
        )),
        None => Ok(vec![0; len]),
    }
}

/// Resolves a view's effective format and checks it against its resource.
fn validate_view(resource: &SoftObject, desc: &ViewDesc) -> DriverResult<ViewDesc> {
    let (bind, res_format) = match resource {
        SoftObject::Texture { desc: tex, .. } => (tex.bind_flags, tex.format),
        SoftObject::Buffer { desc: buf, .. } => (buf.bind_flags, Format::Unknown),
        other => {
            return Err(DriverError::InvalidArgument(format!(
                "cannot view a {}",
                other.kind_name()
            )))
        }
    };
    if !bind.contains(desc.kind.required_bind()) {
        return Err(DriverError::InvalidArgument(format!(
            "resource lacks the bind flag for a {:?} view",
            desc.kind
        )));
    }
    let format = if desc.format == Format::Unknown {
        res_format
    } else {
        desc.format
    };
    if res_format == Format::Unknown {
        // Buffer views: raw or any single format.
        return Ok(ViewDesc { format, ..*desc });
    }

    let compatible = if res_format.is_yuv() {
        res_format.plane_views().get(desc.plane as usize) == Some(&format)
            || (desc.plane == 0 && format == res_format)
    } else {
        desc.plane == 0 && format.typeless() == res_format.typeless()
    };
    if !compatible {
        return Err(DriverError::InvalidArgument(format!(
            "view format {} (plane {}) incompatible with {}",
            format.name(),
            desc.plane,
            res_format.name()
        )));
    }
    if format.is_typeless() {
        return Err(DriverError::InvalidArgument(format!(
            "typeless view format {}",
            format.name()
        )));
    }
    match desc.kind {
        ViewKind::DepthStencil if !format.is_depth() => Err(DriverError::InvalidArgument(
            format!("{} is not a depth format", format.name()),
        )),
        ViewKind::RenderTarget if format.is_depth_family() => Err(DriverError::InvalidArgument(
            format!("{} cannot be a render target", format.name()),
        )),
        _ => Ok(ViewDesc { format, ..*desc }),
    }
}

impl DriverDevice for SoftDevice {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn caps(&self) -> DeviceCaps {
        self.shared.config.caps
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<NativeHandle> {
        validate_texture(desc, &self.shared.config.caps)?;
        let data = initial_storage(desc.byte_size(), desc.usage, initial_data)?;
        let handle = self.shared.objects.lock().insert(SoftObject::Texture {
            desc: *desc,
            data,
        });
        self.shared
            .counters
            .textures_created
            .fetch_add(1, Ordering::SeqCst);
        trace!(%handle, width = desc.width, height = desc.height, format = desc.format.name(), "Created texture");
        Ok(handle)
    }

    fn create_buffer(
        &self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<NativeHandle> {
        if desc.byte_width == 0 {
            return Err(DriverError::InvalidArgument("zero-sized buffer".into()));
        }
        let data = initial_storage(desc.byte_width as usize, desc.usage, initial_data)?;
        let handle = self
            .shared
            .objects
            .lock()
            .insert(SoftObject::Buffer { desc: *desc, data });
        self.shared
            .counters
            .buffers_created
            .fetch_add(1, Ordering::SeqCst);
        trace!(%handle, bytes = desc.byte_width, "Created buffer");
        Ok(handle)
    }

    fn create_view(&self, resource: NativeHandle, desc: &ViewDesc) -> DriverResult<NativeHandle> {
        let mut objects = self.shared.objects.lock();
        let target = objects
            .get(resource)
            .ok_or(DriverError::InvalidHandle(resource))?;
        let resolved = validate_view(target, desc)?;
        // A view keeps its resource alive.
        objects.add_ref(resource);
        let handle = objects.insert(SoftObject::View {
            resource,
            desc: resolved,
        });
        self.shared
            .counters
            .views_created
            .fetch_add(1, Ordering::SeqCst);
        trace!(%handle, %resource, kind = ?desc.kind, "Created view");
        Ok(handle)
    }

    fn create_query(&self, kind: QueryKind) -> DriverResult<NativeHandle> {
        let handle = self.shared.objects.lock().insert(SoftObject::Query {
            kind,
            state: QueryState::Idle,
        });
        self.shared
            .counters
            .queries_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn create_deferred_context(&self) -> DriverResult<Arc<dyn DriverContext>> {
        Ok(Arc::new(SoftContext::new(Arc::clone(&self.shared), true)))
    }

    fn immediate_context(&self) -> Arc<dyn DriverContext> {
        self.immediate.clone()
    }

    fn release(&self, handle: NativeHandle) {
        let mut objects = self.shared.objects.lock();
        let mut next = Some(handle);
        while let Some(handle) = next.take() {
            if let Some(SoftObject::View { resource, .. }) = objects.release(handle) {
                next = Some(resource);
            }
        }
    }

    fn stats(&self) -> DriverStats {
        let c = &self.shared.counters;
        DriverStats {
            textures_created: c.textures_created.load(Ordering::SeqCst),
            buffers_created: c.buffers_created.load(Ordering::SeqCst),
            views_created: c.views_created.load(Ordering::SeqCst),
            queries_created: c.queries_created.load(Ordering::SeqCst),
            live_objects: self.shared.objects.lock().len() as u64,
        }
    }
}
