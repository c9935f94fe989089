//! Cache of normalized views used to display resources.
//!
//! A view is keyed by resource, requested component type and the raw flag.
//! Sources a shader cannot sample directly get a temporary copy: multisampled
//! color is resolved, depth is copied into its typeless family, typeless
//! color into a typed format, and anything without shader-resource binding
//! into a copy that has it. Temporaries are refreshed from the source on
//! every request, hit or miss.

use std::sync::Arc;

use tracing::{debug, trace};

use gpucap_capture::{CaptureError, ResourceManager};
use gpucap_driver::{DriverContext, DriverDevice, DriverResult, NativeHandle};
use gpucap_ipc::{
    BindFlags, BufferDesc, CompType, DebugViewInfo, DebugViewType, Format, ResourceDesc, ResourceId,
    TextureDesc, TextureDimension, Usage, ViewDesc, ViewKind,
};

use crate::{ReplayError, ReplayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugViewKey {
    pub resource: ResourceId,
    pub comp_type: CompType,
    pub raw: bool,
}

/// A cached view set. Handles stay valid until the entry is evicted.
#[derive(Debug, Clone)]
pub struct DebugView {
    pub info: DebugViewInfo,
    /// Resource the views look at: the temporary when there is one.
    pub texture: NativeHandle,
    /// One shader-resource view per plane.
    pub views: Vec<NativeHandle>,
}

#[derive(Debug, Clone, Copy)]
enum Refresh {
    None,
    Copy,
    Resolve(Format),
}

struct Entry {
    key: DebugViewKey,
    source: NativeHandle,
    temporary: Option<NativeHandle>,
    refresh: Refresh,
    view: DebugView,
}

pub struct DebugViewCache {
    device: Arc<dyn DriverDevice>,
    capacity: usize,
    /// Most recently used first.
    entries: Vec<Entry>,
    temporaries_created: u64,
}

impl DebugViewCache {
    pub fn new(device: Arc<dyn DriverDevice>, capacity: usize) -> Self {
        Self {
            device,
            capacity: capacity.max(1),
            entries: Vec::new(),
            temporaries_created: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Temporaries created over the cache's lifetime.
    pub fn temporaries_created(&self) -> u64 {
        self.temporaries_created
    }

    pub fn contains(&self, key: &DebugViewKey) -> bool {
        self.entries.iter().any(|e| e.key == *key)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<DebugViewKey> {
        self.entries.iter().map(|e| e.key).collect()
    }

    /// Returns the view set for a resource, building it on a miss. A hit
    /// moves the entry to the front; a miss on a full cache evicts the
    /// least recently used entry.
    pub fn get_or_create(
        &mut self,
        resources: &ResourceManager,
        context: &dyn DriverContext,
        resource: ResourceId,
        comp_type: CompType,
        raw: bool,
    ) -> ReplayResult<DebugView> {
        let key = DebugViewKey {
            resource,
            comp_type,
            raw,
        };
        let source = resources.resolve(resource)?;

        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            let entry = self.entries.remove(pos);
            if entry.source == source {
                trace!(%resource, "Debug view cache hit");
                let view = refresh(&entry, context);
                self.entries.insert(0, entry);
                return view;
            }
            // The id now names another native object.
            self.release(entry);
        }

        let desc = resources.desc(resource)?;
        let default_output = resources.is_default_output(resource);
        let entry = self.build(key, source, &desc, default_output)?;
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop() {
                debug!(resource = %evicted.key.resource, "Evicting debug view");
                self.release(evicted);
            }
        }
        let view = refresh(&entry, context);
        self.entries.insert(0, entry);
        view
    }

    fn build(
        &mut self,
        key: DebugViewKey,
        source: NativeHandle,
        desc: &ResourceDesc,
        default_output: bool,
    ) -> ReplayResult<Entry> {
        let plan = match desc {
            ResourceDesc::Texture(texture) => plan_texture(texture, key, default_output),
            ResourceDesc::Buffer(buffer) => {
                let temporary = (!buffer.bind_flags.contains(BindFlags::SHADER_RESOURCE)).then(
                    || {
                        let mut desc = *buffer;
                        desc.bind_flags = BindFlags::SHADER_RESOURCE;
                        desc.usage = Usage::Default;
                        TemporaryDesc::Buffer(desc)
                    },
                );
                ViewPlan {
                    view_type: DebugViewType::Buffer,
                    temporary,
                    refresh: Refresh::Copy,
                    view_formats: vec![Format::Unknown],
                    planar: false,
                    extent: (buffer.byte_width, 1, 1),
                    srgb_corrected: false,
                }
            }
            other => {
                return Err(ReplayError::Capture(CaptureError::WrongKind {
                    id: key.resource,
                    expected: if other.kind().is_view() {
                        "resource (got a view)"
                    } else {
                        "texture or buffer"
                    },
                }))
            }
        };

        let temporary = match &plan.temporary {
            Some(TemporaryDesc::Texture(desc)) => Some(self.device.create_texture(desc, None)?),
            Some(TemporaryDesc::Buffer(desc)) => Some(self.device.create_buffer(desc, None)?),
            None => None,
        };
        if temporary.is_some() {
            self.temporaries_created += 1;
        }
        let target = temporary.unwrap_or(source);

        let views = match self.create_views(target, &plan) {
            Ok(views) => views,
            Err(e) => {
                if let Some(temporary) = temporary {
                    self.device.release(temporary);
                }
                return Err(e.into());
            }
        };

        let (width, height, depth) = plan.extent;
        debug!(
            resource = %key.resource,
            view_type = ?plan.view_type,
            temporary = temporary.is_some(),
            "Built debug view"
        );
        Ok(Entry {
            key,
            source,
            temporary,
            refresh: if temporary.is_some() {
                plan.refresh
            } else {
                Refresh::None
            },
            view: DebugView {
                info: DebugViewInfo {
                    resource: key.resource,
                    comp_type: key.comp_type,
                    raw: key.raw,
                    view_type: plan.view_type,
                    view_formats: plan.view_formats,
                    width,
                    height,
                    depth,
                    has_temporary: temporary.is_some(),
                    srgb_corrected: plan.srgb_corrected,
                },
                texture: target,
                views,
            },
        })
    }

    fn create_views(&self, target: NativeHandle, plan: &ViewPlan) -> DriverResult<Vec<NativeHandle>> {
        let mut views = Vec::with_capacity(plan.view_formats.len());
        for (plane, format) in plan.view_formats.iter().enumerate() {
            let desc = ViewDesc::new(ViewKind::ShaderResource)
                .with_format(*format)
                .with_plane(if plan.planar { plane as u32 } else { 0 });
            match self.device.create_view(target, &desc) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        self.device.release(view);
                    }
                    return Err(e);
                }
            }
        }
        Ok(views)
    }

    fn release(&self, entry: Entry) {
        for view in entry.view.views {
            self.device.release(view);
        }
        if let Some(temporary) = entry.temporary {
            self.device.release(temporary);
        }
    }

    /// Releases every entry.
    pub fn clear(&mut self) {
        for entry in std::mem::take(&mut self.entries) {
            self.release(entry);
        }
    }
}

impl Drop for DebugViewCache {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Brings a temporary up to date with its source.
fn refresh(entry: &Entry, context: &dyn DriverContext) -> ReplayResult<DebugView> {
    if let Some(temporary) = entry.temporary {
        match entry.refresh {
            Refresh::Copy => context.copy_resource(temporary, entry.source)?,
            Refresh::Resolve(format) => context.resolve_subresource(temporary, entry.source, format)?,
            Refresh::None => {}
        }
    }
    Ok(entry.view.clone())
}

enum TemporaryDesc {
    Texture(TextureDesc),
    Buffer(BufferDesc),
}

struct ViewPlan {
    view_type: DebugViewType,
    temporary: Option<TemporaryDesc>,
    refresh: Refresh,
    view_formats: Vec<Format>,
    /// One view per plane of a planar format.
    planar: bool,
    extent: (u32, u32, u32),
    srgb_corrected: bool,
}

fn plan_texture(texture: &TextureDesc, key: DebugViewKey, default_output: bool) -> ViewPlan {
    let format = texture.format;
    let typed = format.typed(key.comp_type);
    let shader_visible = texture.bind_flags.contains(BindFlags::SHADER_RESOURCE);
    let temp_base = texture
        .with_bind_flags(BindFlags::SHADER_RESOURCE)
        .with_usage(Usage::Default);

    let view_type = if format.is_depth_family() {
        if texture.is_multisampled() {
            DebugViewType::DepthMs
        } else {
            DebugViewType::Depth
        }
    } else if format.is_yuv() {
        DebugViewType::Yuv
    } else if texture.is_multisampled() {
        DebugViewType::Texture2DMs
    } else {
        match texture.dimension {
            TextureDimension::D1 => DebugViewType::Texture1D,
            TextureDimension::D2 => DebugViewType::Texture2D,
            TextureDimension::D3 => DebugViewType::Texture3D,
        }
    };

    let mut srgb_corrected = false;
    let (temporary, refresh, view_formats) = if format.is_depth_family() {
        let mut formats = vec![format.depth_plane_view()];
        formats.extend(format.stencil_plane_view());
        let temp = temp_base.with_format(format.typeless());
        (Some(temp), Refresh::Copy, formats)
    } else if format.is_yuv() {
        let temp = (!shader_visible).then_some(temp_base);
        (temp, Refresh::Copy, format.plane_views().to_vec())
    } else {
        let view_format = if key.raw {
            typed.linear()
        } else if default_output && !typed.is_srgb() && typed.srgb() != typed {
            srgb_corrected = true;
            typed.srgb()
        } else {
            typed
        };
        if texture.is_multisampled() {
            let temp = temp_base.with_format(typed).with_samples(1);
            (Some(temp), Refresh::Resolve(typed), vec![view_format])
        } else if format.is_typeless() || !shader_visible {
            (Some(temp_base.with_format(typed)), Refresh::Copy, vec![view_format])
        } else {
            (None, Refresh::None, vec![view_format])
        }
    };

    ViewPlan {
        view_type,
        temporary: temporary.map(TemporaryDesc::Texture),
        refresh,
        view_formats,
        planar: format.is_yuv(),
        extent: (texture.width, texture.height, texture.depth),
        srgb_corrected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::SoftDevice;

    struct Fixture {
        device: Arc<dyn DriverDevice>,
        resources: ResourceManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                device: Arc::new(SoftDevice::default()),
                resources: ResourceManager::new(),
            }
        }

        fn texture(&self, raw: u64, desc: TextureDesc) -> ResourceId {
            let id = ResourceId::from_raw(raw);
            let native = self.device.create_texture(&desc, None).unwrap();
            self.resources
                .register(id, ResourceDesc::Texture(desc), Some(native))
                .unwrap();
            id
        }
    }

    #[test]
    fn test_lru_eviction_order() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 2);
        let desc = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm);
        let (a, b, c) = (fx.texture(1, desc), fx.texture(2, desc), fx.texture(3, desc));
        let key = |resource| DebugViewKey {
            resource,
            comp_type: CompType::Typeless,
            raw: false,
        };

        cache.get_or_create(&fx.resources, &*ctx, a, CompType::Typeless, false).unwrap();
        cache.get_or_create(&fx.resources, &*ctx, b, CompType::Typeless, false).unwrap();
        // Hit on `a` makes `b` the oldest.
        cache.get_or_create(&fx.resources, &*ctx, a, CompType::Typeless, false).unwrap();
        cache.get_or_create(&fx.resources, &*ctx, c, CompType::Typeless, false).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys(), vec![key(c), key(a)]);
        assert!(!cache.contains(&key(b)));
        assert_eq!(cache.temporaries_created(), 0);
    }

    #[test]
    fn test_eviction_releases_natives() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let desc = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Typeless);
        let a = fx.texture(1, desc);
        let b = fx.texture(2, desc);
        let baseline = fx.device.stats().live_objects;

        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 1);
        cache.get_or_create(&fx.resources, &*ctx, a, CompType::UInt, false).unwrap();
        // One temporary and one view.
        assert_eq!(fx.device.stats().live_objects, baseline + 2);
        cache.get_or_create(&fx.resources, &*ctx, b, CompType::UInt, false).unwrap();
        assert_eq!(fx.device.stats().live_objects, baseline + 2);
        cache.clear();
        assert_eq!(fx.device.stats().live_objects, baseline);
    }

    #[test]
    fn test_typeless_gets_typed_temporary() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let id = fx.texture(1, TextureDesc::new_2d(2, 2, Format::R8G8B8A8Typeless));
        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 4);
        let view = cache
            .get_or_create(&fx.resources, &*ctx, id, CompType::UInt, false)
            .unwrap();
        assert!(view.info.has_temporary);
        assert_eq!(view.info.view_formats, vec![Format::R8G8B8A8Uint]);
        assert_eq!(view.info.view_type, DebugViewType::Texture2D);
    }

    #[test]
    fn test_default_output_is_srgb_corrected_unless_raw() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let id = fx.texture(1, TextureDesc::new_2d(4, 4, Format::B8G8R8A8Unorm));
        fx.resources.set_default_output(id);
        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 4);

        let corrected = cache
            .get_or_create(&fx.resources, &*ctx, id, CompType::Typeless, false)
            .unwrap();
        assert!(corrected.info.srgb_corrected);
        assert_eq!(corrected.info.view_formats, vec![Format::B8G8R8A8UnormSrgb]);

        let raw = cache
            .get_or_create(&fx.resources, &*ctx, id, CompType::Typeless, true)
            .unwrap();
        assert!(!raw.info.srgb_corrected);
        assert_eq!(raw.info.view_formats, vec![Format::B8G8R8A8Unorm]);
        assert!(!raw.info.has_temporary);
    }

    #[test]
    fn test_depth_stencil_gets_plane_views() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let id = fx.texture(1, TextureDesc::new_2d(4, 4, Format::D24UnormS8Uint));
        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 4);
        let view = cache
            .get_or_create(&fx.resources, &*ctx, id, CompType::Typeless, false)
            .unwrap();
        assert_eq!(view.info.view_type, DebugViewType::Depth);
        assert_eq!(
            view.info.view_formats,
            vec![Format::R24UnormX8Typeless, Format::X24TypelessG8Uint]
        );
        assert_eq!(view.views.len(), 2);
        assert!(view.info.has_temporary);
    }

    #[test]
    fn test_nv12_plane_views_without_temporary() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let desc = TextureDesc::new_2d(4, 4, Format::Nv12).with_bind_flags(BindFlags::SHADER_RESOURCE);
        let id = fx.texture(1, desc);
        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 4);
        let view = cache
            .get_or_create(&fx.resources, &*ctx, id, CompType::Typeless, false)
            .unwrap();
        assert_eq!(view.info.view_type, DebugViewType::Yuv);
        assert_eq!(view.views.len(), 2);
        assert!(!view.info.has_temporary);
    }

    #[test]
    fn test_views_are_rejected() {
        let fx = Fixture::new();
        let ctx = fx.device.immediate_context();
        let tex = fx.texture(1, TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm));
        let parent = fx.resources.resolve(tex).unwrap();
        let rtv_desc = ViewDesc::new(ViewKind::RenderTarget);
        let rtv = fx.device.create_view(parent, &rtv_desc).unwrap();
        let view_id = ResourceId::from_raw(2);
        fx.resources
            .register(
                view_id,
                ResourceDesc::View {
                    resource: tex,
                    desc: rtv_desc,
                },
                Some(rtv),
            )
            .unwrap();
        let mut cache = DebugViewCache::new(Arc::clone(&fx.device), 4);
        assert!(cache
            .get_or_create(&fx.resources, &*ctx, view_id, CompType::Typeless, false)
            .is_err());
        assert!(cache.is_empty());
    }
}
