//! Direct3D 11 backend.

mod context;
mod convert;
mod pipeline;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, trace};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D::{
    D3D11_SRV_DIMENSION_BUFFEREX, D3D11_SRV_DIMENSION_TEXTURE2D, D3D11_SRV_DIMENSION_TEXTURE2DMS,
    D3D_DRIVER_TYPE_HARDWARE, WKPDID_D3DDebugObjectName,
};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32_TYPELESS;

use gpucap_ipc::{
    BufferDesc, DeviceCaps, Format, InterfaceVersion, QueryKind, TextureDesc, TextureDimension,
    ViewDesc, ViewKind,
};

use crate::device::{DriverContext, DriverDevice, DriverStats};
use crate::handle::HandleTable;
use crate::{DriverError, DriverResult, NativeHandle};

pub use context::D3D11Context;
use convert::{buffer_desc, dxgi_format, row_count, row_pitch};
use pipeline::Pipeline;

pub(crate) enum NativeView {
    RenderTarget(ID3D11RenderTargetView),
    DepthStencil(ID3D11DepthStencilView),
    ShaderResource(ID3D11ShaderResourceView),
    UnorderedAccess(ID3D11UnorderedAccessView),
}

pub(crate) enum D3D11Object {
    Texture {
        desc: TextureDesc,
        resource: ID3D11Resource,
    },
    Buffer {
        desc: BufferDesc,
        buffer: ID3D11Buffer,
    },
    View {
        resource: NativeHandle,
        desc: ViewDesc,
        view: NativeView,
    },
    Query {
        kind: QueryKind,
        query: ID3D11Query,
    },
    CommandList(ID3D11CommandList),
}

impl D3D11Object {
    pub(crate) fn resource(&self) -> Option<ID3D11Resource> {
        match self {
            Self::Texture { resource, .. } => Some(resource.clone()),
            Self::Buffer { buffer, .. } => buffer.cast().ok(),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Counters {
    textures: AtomicU64,
    buffers: AtomicU64,
    views: AtomicU64,
    queries: AtomicU64,
}

pub(crate) struct D3D11Shared {
    pub(crate) device: ID3D11Device,
    pub(crate) objects: Mutex<HandleTable<D3D11Object>>,
    pub(crate) pipeline: Pipeline,
    pub(crate) caps: DeviceCaps,
    counters: Counters,
}

// SAFETY: Direct3D 11 devices are free-threaded; the object table is
// serialized by its mutex.
unsafe impl Send for D3D11Shared {}
unsafe impl Sync for D3D11Shared {}

fn created<T>(object: Option<T>, what: &str) -> DriverResult<T> {
    object.ok_or_else(|| DriverError::WindowsApi {
        message: format!("Failed to create {what}"),
        source: None,
    })
}

/// Hardware Direct3D 11 device.
pub struct D3D11Device {
    shared: Arc<D3D11Shared>,
    immediate: Arc<D3D11Context>,
}

impl D3D11Device {
    /// Creates a hardware device and its immediate context.
    #[instrument(name = "d3d11_create_device")]
    pub fn new() -> DriverResult<Self> {
        let mut device = None;
        let mut context = None;

        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )?;
        }

        let device: ID3D11Device = created(device, "D3D11 device")?;
        let context: ID3D11DeviceContext = created(context, "D3D11 device context")?;

        let interface_version = if device.cast::<ID3D11Device1>().is_ok() {
            InterfaceVersion::V3
        } else {
            InterfaceVersion::V1
        };
        let caps = DeviceCaps {
            interface_version,
            thread_safe: true,
            max_sample_count: 8,
        };
        let pipeline = Pipeline::new(&device)?;
        let shared = Arc::new(D3D11Shared {
            device,
            objects: Mutex::new(HandleTable::new()),
            pipeline,
            caps,
            counters: Counters::default(),
        });
        let immediate = Arc::new(D3D11Context::new(Arc::clone(&shared), context, false));

        debug!(?interface_version, "Created D3D11 replay device");
        Ok(Self { shared, immediate })
    }

    fn create_texture_resource(
        &self,
        desc: &TextureDesc,
        initial: Option<&[D3D11_SUBRESOURCE_DATA]>,
    ) -> DriverResult<ID3D11Resource> {
        let device = &self.shared.device;
        let initial = initial.map(|data| data.as_ptr());
        unsafe {
            match desc.dimension {
                TextureDimension::D1 => {
                    let mut texture: Option<ID3D11Texture1D> = None;
                    device.CreateTexture1D(
                        &convert::texture1d_desc(desc),
                        initial,
                        Some(&mut texture),
                    )?;
                    Ok(created(texture, "1D texture")?.cast()?)
                }
                TextureDimension::D2 => {
                    let mut texture: Option<ID3D11Texture2D> = None;
                    device.CreateTexture2D(
                        &convert::texture2d_desc(desc),
                        initial,
                        Some(&mut texture),
                    )?;
                    Ok(created(texture, "2D texture")?.cast()?)
                }
                TextureDimension::D3 => {
                    let mut texture: Option<ID3D11Texture3D> = None;
                    device.CreateTexture3D(
                        &convert::texture3d_desc(desc),
                        initial,
                        Some(&mut texture),
                    )?;
                    Ok(created(texture, "3D texture")?.cast()?)
                }
            }
        }
    }

    fn create_native_view(
        &self,
        target: &D3D11Object,
        desc: &ViewDesc,
    ) -> DriverResult<(ViewDesc, NativeView)> {
        let device = &self.shared.device;
        match target {
            D3D11Object::Texture { desc: tex, resource } => {
                if tex.dimension != TextureDimension::D2 {
                    return Err(DriverError::NotSupported(
                        "views of non-2D textures".into(),
                    ));
                }
                let format = if desc.format == Format::Unknown {
                    tex.format
                } else {
                    desc.format
                };
                let resolved = ViewDesc { format, ..*desc };
                let ms = tex.is_multisampled();
                let dxgi = dxgi_format(format);
                let view = unsafe {
                    match desc.kind {
                        ViewKind::RenderTarget => {
                            let rtv = D3D11_RENDER_TARGET_VIEW_DESC {
                                Format: dxgi,
                                ViewDimension: if ms {
                                    D3D11_RTV_DIMENSION_TEXTURE2DMS
                                } else {
                                    D3D11_RTV_DIMENSION_TEXTURE2D
                                },
                                Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
                                    Texture2D: D3D11_TEX2D_RTV { MipSlice: 0 },
                                },
                            };
                            let mut view = None;
                            device.CreateRenderTargetView(resource, Some(&rtv), Some(&mut view))?;
                            NativeView::RenderTarget(created(view, "render-target view")?)
                        }
                        ViewKind::DepthStencil => {
                            let dsv = D3D11_DEPTH_STENCIL_VIEW_DESC {
                                Format: dxgi,
                                ViewDimension: if ms {
                                    D3D11_DSV_DIMENSION_TEXTURE2DMS
                                } else {
                                    D3D11_DSV_DIMENSION_TEXTURE2D
                                },
                                Flags: 0,
                                Anonymous: D3D11_DEPTH_STENCIL_VIEW_DESC_0 {
                                    Texture2D: D3D11_TEX2D_DSV { MipSlice: 0 },
                                },
                            };
                            let mut view = None;
                            device.CreateDepthStencilView(resource, Some(&dsv), Some(&mut view))?;
                            NativeView::DepthStencil(created(view, "depth-stencil view")?)
                        }
                        ViewKind::ShaderResource => {
                            let srv = D3D11_SHADER_RESOURCE_VIEW_DESC {
                                Format: dxgi,
                                ViewDimension: if ms {
                                    D3D11_SRV_DIMENSION_TEXTURE2DMS
                                } else {
                                    D3D11_SRV_DIMENSION_TEXTURE2D
                                },
                                Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                                    Texture2D: D3D11_TEX2D_SRV {
                                        MostDetailedMip: 0,
                                        MipLevels: tex.mip_levels,
                                    },
                                },
                            };
                            let mut view = None;
                            device.CreateShaderResourceView(
                                resource,
                                Some(&srv),
                                Some(&mut view),
                            )?;
                            NativeView::ShaderResource(created(view, "shader-resource view")?)
                        }
                        ViewKind::UnorderedAccess => {
                            let uav = D3D11_UNORDERED_ACCESS_VIEW_DESC {
                                Format: dxgi,
                                ViewDimension: D3D11_UAV_DIMENSION_TEXTURE2D,
                                Anonymous: D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                                    Texture2D: D3D11_TEX2D_UAV { MipSlice: 0 },
                                },
                            };
                            let mut view = None;
                            device.CreateUnorderedAccessView(
                                resource,
                                Some(&uav),
                                Some(&mut view),
                            )?;
                            NativeView::UnorderedAccess(created(view, "unordered-access view")?)
                        }
                    }
                };
                Ok((resolved, view))
            }
            D3D11Object::Buffer { desc: buf, buffer } => {
                let elements = buf.byte_width / 4;
                let view = unsafe {
                    match desc.kind {
                        ViewKind::UnorderedAccess => {
                            let uav = D3D11_UNORDERED_ACCESS_VIEW_DESC {
                                Format: DXGI_FORMAT_R32_TYPELESS,
                                ViewDimension: D3D11_UAV_DIMENSION_BUFFER,
                                Anonymous: D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                                    Buffer: D3D11_BUFFER_UAV {
                                        FirstElement: 0,
                                        NumElements: elements,
                                        Flags: D3D11_BUFFER_UAV_FLAG_RAW.0 as u32,
                                    },
                                },
                            };
                            let mut view = None;
                            device.CreateUnorderedAccessView(buffer, Some(&uav), Some(&mut view))?;
                            NativeView::UnorderedAccess(created(view, "buffer UAV")?)
                        }
                        ViewKind::ShaderResource => {
                            let srv = D3D11_SHADER_RESOURCE_VIEW_DESC {
                                Format: DXGI_FORMAT_R32_TYPELESS,
                                ViewDimension: D3D11_SRV_DIMENSION_BUFFEREX,
                                Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                                    BufferEx: D3D11_BUFFEREX_SRV {
                                        FirstElement: 0,
                                        NumElements: elements,
                                        Flags: D3D11_BUFFEREX_SRV_FLAG_RAW.0 as u32,
                                    },
                                },
                            };
                            let mut view = None;
                            device.CreateShaderResourceView(buffer, Some(&srv), Some(&mut view))?;
                            NativeView::ShaderResource(created(view, "buffer SRV")?)
                        }
                        kind => {
                            return Err(DriverError::InvalidArgument(format!(
                                "{kind:?} views of buffers"
                            )))
                        }
                    }
                };
                Ok((*desc, view))
            }
            _ => Err(DriverError::InvalidArgument("cannot view this object".into())),
        }
    }
}

impl DriverDevice for D3D11Device {
    fn name(&self) -> &'static str {
        "d3d11"
    }

    fn caps(&self) -> DeviceCaps {
        self.shared.caps
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<NativeHandle> {
        let resource = match initial_data {
            Some(_) if desc.is_multisampled() => {
                return Err(DriverError::InvalidArgument(
                    "multisampled textures cannot take initial data".into(),
                ))
            }
            Some(data) => {
                if data.len() != desc.byte_size() {
                    return Err(DriverError::InvalidArgument(format!(
                        "initial data is {} bytes, texture needs {}",
                        data.len(),
                        desc.byte_size()
                    )));
                }
                let subresources = (0..desc.subresource_count())
                    .filter_map(|i| desc.subresource_layout(i))
                    .map(|layout| {
                        let pitch = row_pitch(desc.format, layout.width);
                        D3D11_SUBRESOURCE_DATA {
                            pSysMem: data[layout.offset..].as_ptr().cast(),
                            SysMemPitch: pitch as u32,
                            SysMemSlicePitch: (pitch * row_count(desc.format, layout.height))
                                as u32,
                        }
                    })
                    .collect::<Vec<_>>();
                self.create_texture_resource(desc, Some(&subresources))?
            }
            None => self.create_texture_resource(desc, None)?,
        };
        let handle = self.shared.objects.lock().insert(D3D11Object::Texture {
            desc: *desc,
            resource,
        });
        self.shared.counters.textures.fetch_add(1, Ordering::SeqCst);
        trace!(%handle, width = desc.width, height = desc.height, format = desc.format.name(), "Created texture");
        Ok(handle)
    }

    fn create_buffer(
        &self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<NativeHandle> {
        let initial = initial_data.map(|data| D3D11_SUBRESOURCE_DATA {
            pSysMem: data.as_ptr().cast(),
            SysMemPitch: 0,
            SysMemSlicePitch: 0,
        });
        let mut buffer = None;
        unsafe {
            self.shared.device.CreateBuffer(
                &buffer_desc(desc),
                initial.as_ref().map(|d| d as *const _),
                Some(&mut buffer),
            )?;
        }
        let buffer = created(buffer, "buffer")?;
        let handle = self
            .shared
            .objects
            .lock()
            .insert(D3D11Object::Buffer { desc: *desc, buffer });
        self.shared.counters.buffers.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn create_view(&self, resource: NativeHandle, desc: &ViewDesc) -> DriverResult<NativeHandle> {
        let mut objects = self.shared.objects.lock();
        let target = objects
            .get(resource)
            .ok_or(DriverError::InvalidHandle(resource))?;
        let (resolved, view) = self.create_native_view(target, desc)?;
        objects.add_ref(resource);
        let handle = objects.insert(D3D11Object::View {
            resource,
            desc: resolved,
            view,
        });
        self.shared.counters.views.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn create_query(&self, kind: QueryKind) -> DriverResult<NativeHandle> {
        let desc = D3D11_QUERY_DESC {
            Query: match kind {
                QueryKind::Event => D3D11_QUERY_EVENT,
                QueryKind::Occlusion => D3D11_QUERY_OCCLUSION,
                QueryKind::Timestamp => D3D11_QUERY_TIMESTAMP,
                QueryKind::TimestampDisjoint => D3D11_QUERY_TIMESTAMP_DISJOINT,
            },
            MiscFlags: 0,
        };
        let mut query = None;
        unsafe { self.shared.device.CreateQuery(&desc, Some(&mut query))? };
        let query = created(query, "query")?;
        let handle = self
            .shared
            .objects
            .lock()
            .insert(D3D11Object::Query { kind, query });
        self.shared.counters.queries.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn create_deferred_context(&self) -> DriverResult<Arc<dyn DriverContext>> {
        let mut context = None;
        unsafe {
            self.shared
                .device
                .CreateDeferredContext(0, Some(&mut context))?;
        }
        let context = created(context, "deferred context")?;
        Ok(Arc::new(D3D11Context::new(
            Arc::clone(&self.shared),
            context,
            true,
        )))
    }

    fn immediate_context(&self) -> Arc<dyn DriverContext> {
        self.immediate.clone()
    }

    fn release(&self, handle: NativeHandle) {
        let mut objects = self.shared.objects.lock();
        let mut next = Some(handle);
        while let Some(handle) = next.take() {
            if let Some(D3D11Object::View { resource, .. }) = objects.release(handle) {
                next = Some(resource);
            }
        }
    }

    fn set_debug_name(&self, handle: NativeHandle, name: &str) {
        let objects = self.shared.objects.lock();
        let child: Option<ID3D11DeviceChild> = match objects.get(handle) {
            Some(D3D11Object::Texture { resource, .. }) => resource.cast().ok(),
            Some(D3D11Object::Buffer { buffer, .. }) => buffer.cast().ok(),
            _ => None,
        };
        if let Some(child) = child {
            unsafe {
                let _ = child.SetPrivateData(
                    &WKPDID_D3DDebugObjectName,
                    name.len() as u32,
                    Some(name.as_ptr().cast()),
                );
            }
        }
    }

    fn stats(&self) -> DriverStats {
        let c = &self.shared.counters;
        DriverStats {
            textures_created: c.textures.load(Ordering::SeqCst),
            buffers_created: c.buffers.load(Ordering::SeqCst),
            views_created: c.views.load(Ordering::SeqCst),
            queries_created: c.queries.load(Ordering::SeqCst),
            live_objects: self.shared.objects.lock().len() as u64,
        }
    }
}
