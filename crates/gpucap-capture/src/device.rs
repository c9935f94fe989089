//! The wrapped device: object creation, naming and capture scope.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use gpucap_driver::{DriverDevice, DriverError, DriverResult, NativeHandle};
use gpucap_ipc::{
    BindFlags, BufferDesc, CaptureOptions, DeviceCaps, Format, InitialContents, InterfaceVersion,
    QueryKind, ResourceDesc, ResourceId, TextureDesc, Usage, ViewDesc,
};
use gpucap_log::{Call, ChunkLog, ChunkWriter};

use crate::context::WrappedContext;
use crate::contents::read_contents;
use crate::handles::{Buffer, DeviceChild, HandleInner, Query, ResourceRef, Texture, View};
use crate::initial::InitialContentsPlan;
use crate::{CaptureError, CaptureResult, ResourceManager};

#[derive(Default)]
struct Recorder {
    writer: Option<ChunkWriter>,
    frame: u32,
}

/// State shared by the device wrapper, its contexts and every handle.
pub(crate) struct DeviceShared {
    pub(crate) driver: Arc<dyn DriverDevice>,
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) caps: DeviceCaps,
    options: CaptureOptions,
    /// Coarse lock over id-table and log mutations.
    serial: Mutex<()>,
    /// Whether context rendering calls also take `serial`.
    lock_contexts: bool,
    recorder: Mutex<Recorder>,
}

impl DeviceShared {
    pub(crate) fn lock_device(&self) -> MutexGuard<'_, ()> {
        self.serial.lock()
    }

    pub(crate) fn lock_context(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock_contexts.then(|| self.serial.lock())
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.recorder.lock().writer.is_some()
    }

    pub(crate) fn supports(&self, version: InterfaceVersion) -> bool {
        self.caps.interface_version >= version
    }

    /// Appends calls as one contiguous block when a capture is running.
    pub(crate) fn record_all(&self, calls: impl IntoIterator<Item = (ResourceId, Call)>) {
        if let Some(writer) = self.recorder.lock().writer.as_mut() {
            for (context, call) in calls {
                writer.append(context, &call);
            }
        }
    }

    pub(crate) fn record(&self, context: ResourceId, call: Call) {
        self.record_all([(context, call)]);
    }

    /// Maps a driver result, logging unsupported entry points.
    pub(crate) fn forward<T>(&self, call: &'static str, result: DriverResult<T>) -> CaptureResult<T> {
        result.map_err(|e| {
            if e.is_not_supported() {
                warn!(call, device = self.driver.name(), "Unsupported call");
            } else {
                debug!(call, error = %e, "Driver call failed");
            }
            CaptureError::from(e)
        })
    }

    pub(crate) fn unsupported(&self, call: &'static str, needs: InterfaceVersion) -> CaptureError {
        warn!(
            call,
            needs = ?needs,
            has = ?self.caps.interface_version,
            "Entry point not available on this interface version"
        );
        CaptureError::NotSupported(call.to_string())
    }

    /// Called when the last owner of an object goes away.
    pub(crate) fn release_object(&self, id: ResourceId) {
        let _device = self.lock_device();
        match self.resources.release_resource(id) {
            Ok(native) => {
                if let Some(native) = native {
                    self.driver.release(native);
                }
                self.record(ResourceId::NULL, Call::ReleaseResource { id });
            }
            Err(e) => warn!(%id, error = %e, "Release of untracked object"),
        }
    }
}

/// Wraps a native device. Every creation goes through the resource manager
/// and, while a capture runs, into the log.
#[derive(Clone)]
pub struct WrappedDevice {
    shared: Arc<DeviceShared>,
    immediate: WrappedContext,
}

impl WrappedDevice {
    pub fn new(driver: Arc<dyn DriverDevice>, options: CaptureOptions) -> Self {
        Self::with_resources(driver, options, Arc::new(ResourceManager::new()))
    }

    pub fn with_resources(
        driver: Arc<dyn DriverDevice>,
        options: CaptureOptions,
        resources: Arc<ResourceManager>,
    ) -> Self {
        let caps = driver.caps();
        let lock_contexts = options.force_device_lock.unwrap_or(caps.thread_safe);
        let immediate_driver = driver.immediate_context();
        let shared = Arc::new(DeviceShared {
            driver,
            resources,
            caps,
            options,
            serial: Mutex::new(()),
            lock_contexts,
            recorder: Mutex::new(Recorder::default()),
        });
        debug!(
            device = shared.driver.name(),
            version = ?caps.interface_version,
            lock_contexts,
            "Wrapped device"
        );
        let immediate = WrappedContext::immediate(Arc::clone(&shared), immediate_driver);
        Self { shared, immediate }
    }

    pub fn caps(&self) -> DeviceCaps {
        self.shared.caps
    }

    /// Runtime check for an interface generation.
    pub fn supports(&self, version: InterfaceVersion) -> bool {
        self.shared.supports(version)
    }

    pub fn driver(&self) -> &Arc<dyn DriverDevice> {
        &self.shared.driver
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.shared.resources
    }

    pub fn immediate_context(&self) -> WrappedContext {
        self.immediate.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing()
    }

    fn create_object(
        &self,
        what: &'static str,
        desc: ResourceDesc,
        parent: Option<Arc<HandleInner>>,
        create: impl FnOnce() -> DriverResult<NativeHandle>,
        call: impl FnOnce(ResourceId) -> Call,
    ) -> CaptureResult<Arc<HandleInner>> {
        let _device = self.shared.lock_device();
        let native = self.shared.forward(what, create())?;
        let id = self.shared.resources.create_resource(desc, || Ok(Some(native)))?;
        self.shared.record(ResourceId::NULL, call(id));
        Ok(HandleInner::new(id, Arc::clone(&self.shared), parent))
    }

    pub fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> CaptureResult<Texture> {
        let desc = *desc;
        let inner = self.create_object(
            "CreateTexture",
            ResourceDesc::Texture(desc),
            None,
            || self.shared.driver.create_texture(&desc, initial_data),
            |id| Call::CreateTexture {
                id,
                desc,
                initial_data: initial_data.map(Bytes::copy_from_slice),
            },
        )?;
        if initial_data.is_some() {
            self.shared.resources.mark_written(inner.id);
        }
        Ok(Texture::new(inner))
    }

    /// Creates a presentable back buffer.
    pub fn create_swap_buffer(&self, width: u32, height: u32, format: Format) -> CaptureResult<Texture> {
        let desc = TextureDesc::new_2d(width, height, format)
            .with_bind_flags(BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE);
        let inner = self.create_object(
            "CreateSwapBuffer",
            ResourceDesc::Texture(desc),
            None,
            || self.shared.driver.create_texture(&desc, None),
            |id| Call::CreateSwapBuffer { id, desc },
        )?;
        self.shared.resources.set_default_output(inner.id);
        Ok(Texture::new(inner))
    }

    pub fn create_buffer(
        &self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> CaptureResult<Buffer> {
        let desc = *desc;
        let inner = self.create_object(
            "CreateBuffer",
            ResourceDesc::Buffer(desc),
            None,
            || self.shared.driver.create_buffer(&desc, initial_data),
            |id| Call::CreateBuffer {
                id,
                desc,
                initial_data: initial_data.map(Bytes::copy_from_slice),
            },
        )?;
        if initial_data.is_some() {
            self.shared.resources.mark_written(inner.id);
        }
        Ok(Buffer::new(inner))
    }

    pub fn create_view<'a>(
        &self,
        resource: impl Into<ResourceRef<'a>>,
        desc: &ViewDesc,
    ) -> CaptureResult<View> {
        let resource = resource.into();
        let resource_id = resource.id();
        let native = self.shared.resources.resolve(resource_id)?;
        let desc = *desc;
        let inner = self.create_object(
            "CreateView",
            ResourceDesc::View {
                resource: resource_id,
                desc,
            },
            Some(Arc::clone(resource.inner())),
            || self.shared.driver.create_view(native, &desc),
            |id| Call::CreateView {
                id,
                resource: resource_id,
                desc,
            },
        )?;
        Ok(View::new(inner))
    }

    pub fn create_query(&self, kind: QueryKind) -> CaptureResult<Query> {
        let inner = self.create_object(
            "CreateQuery",
            ResourceDesc::Query(kind),
            None,
            || self.shared.driver.create_query(kind),
            |id| Call::CreateQuery { id, kind },
        )?;
        Ok(Query::new(inner))
    }

    pub fn create_deferred_context(&self) -> CaptureResult<WrappedContext> {
        let _device = self.shared.lock_device();
        let driver = self
            .shared
            .forward("CreateDeferredContext", self.shared.driver.create_deferred_context())?;
        let id = self
            .shared
            .resources
            .create_resource(ResourceDesc::DeferredContext, || Ok(None))?;
        self.shared
            .record(ResourceId::NULL, Call::CreateDeferredContext { id });
        let handle = HandleInner::new(id, Arc::clone(&self.shared), None);
        Ok(WrappedContext::deferred(Arc::clone(&self.shared), driver, handle))
    }

    pub fn set_resource_name(&self, object: &dyn DeviceChild, name: &str) -> CaptureResult<()> {
        let _device = self.shared.lock_device();
        let id = object.id();
        self.shared.resources.set_name(id, name)?;
        if let Ok(native) = self.shared.resources.resolve(id) {
            self.shared.driver.set_debug_name(native, name);
        }
        self.shared.record(
            ResourceId::NULL,
            Call::SetResourceName {
                id,
                name: name.to_string(),
            },
        );
        Ok(())
    }

    /// Starts recording. The log opens with the device capabilities, the
    /// creation of every live object and the contents of every live
    /// resource.
    #[instrument(name = "begin_capture", skip(self))]
    pub fn begin_capture(&self) -> CaptureResult<()> {
        let _device = self.shared.lock_device();
        let mut recorder = self.shared.recorder.lock();
        if recorder.writer.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }

        let mut writer = ChunkWriter::new();
        writer.append(ResourceId::NULL, &Call::DeviceInit { caps: self.shared.caps });

        let resources = &self.shared.resources;
        let context = self.shared.driver.immediate_context();
        let live = resources.live_ids();
        for &id in &live {
            let Some(record) = resources.record(id) else {
                continue;
            };
            let immutable_data = || -> Option<Bytes> {
                let native = record.native?;
                if record.desc.usage() != Usage::Immutable {
                    return None;
                }
                read_contents(&*context, native, &record.desc)
                    .map_err(|e| warn!(%id, error = %e, "Failed to read immutable contents"))
                    .ok()
            };
            let call = match record.desc {
                ResourceDesc::Texture(desc) if record.default_output => {
                    Call::CreateSwapBuffer { id, desc }
                }
                ResourceDesc::Texture(desc) => Call::CreateTexture {
                    id,
                    desc,
                    initial_data: immutable_data(),
                },
                ResourceDesc::Buffer(desc) => Call::CreateBuffer {
                    id,
                    desc,
                    initial_data: immutable_data(),
                },
                ResourceDesc::View { resource, desc } => Call::CreateView { id, resource, desc },
                ResourceDesc::Query(kind) => Call::CreateQuery { id, kind },
                ResourceDesc::DeferredContext => Call::CreateDeferredContext { id },
                ResourceDesc::CommandList => continue,
            };
            writer.append(ResourceId::NULL, &call);
            if let Some(name) = record.name {
                writer.append(ResourceId::NULL, &Call::SetResourceName { id, name });
            }
        }

        let mut stored = 0usize;
        for &id in &live {
            let Some(record) = resources.record(id) else {
                continue;
            };
            if !record.has_data && !self.shared.options.capture_all_initial_contents {
                continue;
            }
            let contents = match resources.policy().plan_at_capture(&record.desc, record.has_data) {
                InitialContentsPlan::NoneNeeded => continue,
                InitialContentsPlan::Clear(value) => InitialContents::Clear(value),
                InitialContentsPlan::Copy => {
                    let read = record
                        .native
                        .ok_or(DriverError::InvalidArgument("no native object".into()))
                        .and_then(|native| read_contents(&*context, native, &record.desc));
                    match read {
                        Ok(data) => InitialContents::Copy(data),
                        Err(e) => {
                            warn!(%id, error = %e, "Failed to read initial contents");
                            continue;
                        }
                    }
                }
            };
            writer.append(ResourceId::NULL, &Call::InitialContents { id, contents });
            stored += 1;
        }

        writer.append(
            ResourceId::NULL,
            &Call::BeginCapture {
                frame: recorder.frame,
            },
        );
        info!(
            frame = recorder.frame,
            objects = live.len(),
            initial_contents = stored,
            "Capture started"
        );
        recorder.writer = Some(writer);
        Ok(())
    }

    /// Stops recording and returns the log.
    #[instrument(name = "end_capture", skip(self))]
    pub fn end_capture(&self) -> CaptureResult<ChunkLog> {
        let _device = self.shared.lock_device();
        let mut recorder = self.shared.recorder.lock();
        let mut writer = recorder.writer.take().ok_or(CaptureError::NotCapturing)?;
        writer.append(ResourceId::NULL, &Call::EndCapture);
        let frame = recorder.frame;
        recorder.frame += 1;
        let log = writer.finish();
        info!(frame, chunks = log.len(), "Capture finished");
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::{SoftConfig, SoftDevice};
    use gpucap_log::ChunkType;

    fn device() -> WrappedDevice {
        WrappedDevice::new(Arc::new(SoftDevice::default()), CaptureOptions::default())
    }

    fn chunk_types(log: &ChunkLog) -> Vec<ChunkType> {
        log.chunks().iter().map(|c| c.chunk_type).collect()
    }

    #[test]
    fn test_failed_creation_records_nothing() {
        let device = device();
        device.begin_capture().unwrap();
        let bad = TextureDesc::new_2d(0, 0, Format::R8G8B8A8Unorm);
        assert!(matches!(
            device.create_texture(&bad, None),
            Err(CaptureError::Driver(_))
        ));
        let log = device.end_capture().unwrap();
        assert_eq!(
            chunk_types(&log),
            vec![ChunkType::DeviceInit, ChunkType::BeginCapture, ChunkType::EndCapture]
        );
        assert_eq!(device.resources().live_count(), 0);
    }

    #[test]
    fn test_capture_prologue() {
        let device = device();
        let desc = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        let blank = device.create_texture(&desc, None).unwrap();
        let filled = device.create_texture(&desc, Some(&[7u8; 16])).unwrap();
        let _view = device.create_view(&filled, &ViewDesc::new(gpucap_ipc::ViewKind::RenderTarget)).unwrap();
        device.set_resource_name(&blank, "blank").unwrap();

        device.begin_capture().unwrap();
        assert!(matches!(device.begin_capture(), Err(CaptureError::AlreadyCapturing)));
        let log = device.end_capture().unwrap();
        assert_eq!(
            chunk_types(&log),
            vec![
                ChunkType::DeviceInit,
                ChunkType::CreateTexture,
                ChunkType::SetResourceName,
                ChunkType::CreateTexture,
                ChunkType::CreateView,
                ChunkType::InitialContents,
                ChunkType::InitialContents,
                ChunkType::BeginCapture,
                ChunkType::EndCapture,
            ]
        );
        let contents: Vec<_> = log
            .chunks()
            .iter()
            .filter_map(|c| match c.call().unwrap() {
                Call::InitialContents { id, contents } => Some((id, contents)),
                _ => None,
            })
            .collect();
        assert_eq!(
            contents[0],
            (blank.id(), InitialContents::Clear(gpucap_ipc::ClearValue::Zeroed))
        );
        assert_eq!(
            contents[1],
            (filled.id(), InitialContents::Copy(Bytes::from_static(&[7u8; 16])))
        );
        assert!(matches!(device.end_capture(), Err(CaptureError::NotCapturing)));
    }

    #[test]
    fn test_last_owner_releases() {
        let soft = Arc::new(SoftDevice::default());
        let device = WrappedDevice::new(soft.clone(), CaptureOptions::default());
        let desc = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        let texture = device.create_texture(&desc, None).unwrap();
        let id = texture.id();
        let view = device
            .create_view(&texture, &ViewDesc::new(gpucap_ipc::ViewKind::RenderTarget))
            .unwrap();
        let second_owner = texture.clone();
        drop(texture);
        drop(second_owner);
        // The view still owns the texture.
        assert!(device.resources().resolve(id).is_ok());

        device.begin_capture().unwrap();
        drop(view);
        let log = device.end_capture().unwrap();
        assert!(matches!(
            device.resources().resolve(id),
            Err(CaptureError::Released(_))
        ));
        assert_eq!(soft.stats().live_objects, 0);
        let released = log
            .chunks()
            .iter()
            .filter(|c| c.chunk_type == ChunkType::ReleaseResource)
            .count();
        assert_eq!(released, 2);
    }

    #[test]
    fn test_lock_policy_follows_caps() {
        let mut config = SoftConfig::default();
        config.caps.thread_safe = false;
        let device = WrappedDevice::new(Arc::new(SoftDevice::new(config)), CaptureOptions::default());
        assert!(!device.shared.lock_contexts);
        let forced = WrappedDevice::new(
            Arc::new(SoftDevice::default()),
            CaptureOptions {
                force_device_lock: Some(false),
                ..Default::default()
            },
        );
        assert!(!forced.shared.lock_contexts);
    }
}
