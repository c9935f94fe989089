//! Presentation surfaces.
//!
//! The windowing glue is an external collaborator. Replay only needs a place
//! to render previews into and read screenshots back from, which
//! [`HeadlessSurfaces`] provides on top of any [`DriverDevice`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use gpucap_ipc::{Format, TextureDesc, ViewDesc, ViewKind};

use crate::{DriverContext, DriverDevice, DriverError, DriverResult, NativeHandle};

/// Identifies a surface created by a [`PresentationSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(u64);

impl SurfaceHandle {
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Contract of the windowing collaborator.
pub trait PresentationSurface: Send + Sync {
    /// Creates a surface for an OS window handle.
    fn create_surface(&self, window: u64, width: u32, height: u32)
        -> DriverResult<SurfaceHandle>;

    /// Recreates the back buffer at a new size.
    fn resize_surface(&self, surface: SurfaceHandle, width: u32, height: u32) -> DriverResult<()>;

    fn present(&self, surface: SurfaceHandle) -> DriverResult<()>;

    /// Binds the back buffer as the only render target of `context` and
    /// returns its render-target view.
    fn bind_surface_as_render_target(
        &self,
        surface: SurfaceHandle,
        context: &dyn DriverContext,
    ) -> DriverResult<NativeHandle>;

    /// Reads the back buffer for screenshots.
    fn read_surface_pixels(&self, surface: SurfaceHandle) -> DriverResult<Bytes>;

    fn surface_size(&self, surface: SurfaceHandle) -> Option<(u32, u32)>;

    fn destroy_surface(&self, surface: SurfaceHandle);
}

struct Surface {
    window: u64,
    width: u32,
    height: u32,
    back_buffer: NativeHandle,
    render_target: NativeHandle,
    presents: u64,
}

/// Offscreen surfaces backed by plain textures.
pub struct HeadlessSurfaces {
    device: Arc<dyn DriverDevice>,
    format: Format,
    surfaces: Mutex<HashMap<u64, Surface>>,
    next: AtomicU64,
}

impl HeadlessSurfaces {
    /// Back-buffer format of every surface.
    pub const BACK_BUFFER_FORMAT: Format = Format::B8G8R8A8Unorm;

    pub fn new(device: Arc<dyn DriverDevice>) -> Self {
        Self {
            device,
            format: Self::BACK_BUFFER_FORMAT,
            surfaces: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Number of presents on a surface.
    pub fn present_count(&self, surface: SurfaceHandle) -> u64 {
        self.surfaces
            .lock()
            .get(&surface.0)
            .map_or(0, |s| s.presents)
    }

    fn create_targets(&self, width: u32, height: u32) -> DriverResult<(NativeHandle, NativeHandle)> {
        let texture = self
            .device
            .create_texture(&TextureDesc::new_2d(width, height, self.format), None)?;
        match self
            .device
            .create_view(texture, &ViewDesc::new(ViewKind::RenderTarget))
        {
            Ok(view) => Ok((texture, view)),
            Err(e) => {
                self.device.release(texture);
                Err(e)
            }
        }
    }

    fn with_surface<T>(
        &self,
        surface: SurfaceHandle,
        f: impl FnOnce(&mut Surface) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut surfaces = self.surfaces.lock();
        let entry = surfaces.get_mut(&surface.0).ok_or_else(|| {
            DriverError::InvalidArgument(format!("unknown surface {}", surface.0))
        })?;
        f(entry)
    }
}

impl PresentationSurface for HeadlessSurfaces {
    fn create_surface(
        &self,
        window: u64,
        width: u32,
        height: u32,
    ) -> DriverResult<SurfaceHandle> {
        let (back_buffer, render_target) = self.create_targets(width, height)?;
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.surfaces.lock().insert(
            id,
            Surface {
                window,
                width,
                height,
                back_buffer,
                render_target,
                presents: 0,
            },
        );
        debug!(surface = id, window, width, height, "Created headless surface");
        Ok(SurfaceHandle(id))
    }

    fn resize_surface(&self, surface: SurfaceHandle, width: u32, height: u32) -> DriverResult<()> {
        let (back_buffer, render_target) = self.create_targets(width, height)?;
        let old = self.with_surface(surface, |s| {
            let old = (s.back_buffer, s.render_target);
            s.back_buffer = back_buffer;
            s.render_target = render_target;
            s.width = width;
            s.height = height;
            debug!(window = s.window, width, height, "Resized headless surface");
            Ok(old)
        });
        match old {
            Ok((texture, view)) => {
                self.device.release(view);
                self.device.release(texture);
                Ok(())
            }
            Err(e) => {
                self.device.release(render_target);
                self.device.release(back_buffer);
                Err(e)
            }
        }
    }

    fn present(&self, surface: SurfaceHandle) -> DriverResult<()> {
        self.with_surface(surface, |s| {
            s.presents += 1;
            Ok(())
        })
    }

    fn bind_surface_as_render_target(
        &self,
        surface: SurfaceHandle,
        context: &dyn DriverContext,
    ) -> DriverResult<NativeHandle> {
        let view = self.with_surface(surface, |s| Ok(s.render_target))?;
        context.set_render_targets(&[view], None)?;
        Ok(view)
    }

    fn read_surface_pixels(&self, surface: SurfaceHandle) -> DriverResult<Bytes> {
        let texture = self.with_surface(surface, |s| Ok(s.back_buffer))?;
        self.device.immediate_context().read_subresource(texture, 0)
    }

    fn surface_size(&self, surface: SurfaceHandle) -> Option<(u32, u32)> {
        self.surfaces
            .lock()
            .get(&surface.0)
            .map(|s| (s.width, s.height))
    }

    fn destroy_surface(&self, surface: SurfaceHandle) {
        if let Some(s) = self.surfaces.lock().remove(&surface.0) {
            self.device.release(s.render_target);
            self.device.release(s.back_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftDevice;

    #[test]
    fn test_surface_lifecycle() {
        let device: Arc<dyn DriverDevice> = Arc::new(SoftDevice::default());
        let surfaces = HeadlessSurfaces::new(Arc::clone(&device));
        let s = surfaces.create_surface(0x1234, 4, 2).unwrap();
        assert_eq!(surfaces.surface_size(s), Some((4, 2)));

        let ctx = device.immediate_context();
        let rtv = surfaces.bind_surface_as_render_target(s, &*ctx).unwrap();
        ctx.clear_render_target(rtv, [1.0, 0.0, 0.0, 1.0]).unwrap();
        let pixels = surfaces.read_surface_pixels(s).unwrap();
        // BGRA
        assert_eq!(&pixels[..4], &[0, 0, 255, 255]);

        surfaces.present(s).unwrap();
        assert_eq!(surfaces.present_count(s), 1);

        surfaces.resize_surface(s, 8, 8).unwrap();
        assert_eq!(surfaces.read_surface_pixels(s).unwrap().len(), 8 * 8 * 4);

        surfaces.destroy_surface(s);
        assert_eq!(device.stats().live_objects, 0);
        assert!(surfaces.present(s).is_err());
    }
}
