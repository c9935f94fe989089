//! Preview windows that replayed output is presented into.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use gpucap_driver::{DriverContext, DriverDevice, NativeHandle, PresentationSurface, SurfaceHandle};
use gpucap_ipc::{BindFlags, ClearFlags, Format, TextureDesc, ViewDesc, ViewKind};

use crate::ReplayResult;

/// Format of the optional depth target.
pub const OUTPUT_DEPTH_FORMAT: Format = Format::D24UnormS8Uint;

struct DepthTarget {
    texture: NativeHandle,
    view: NativeHandle,
}

/// A window-backed render target plus an optional depth buffer of the same
/// size. The surface is destroyed when the window is dropped.
pub struct OutputWindow {
    surfaces: Arc<dyn PresentationSurface>,
    device: Arc<dyn DriverDevice>,
    window: u64,
    surface: SurfaceHandle,
    width: u32,
    height: u32,
    depth: Option<DepthTarget>,
}

impl OutputWindow {
    pub fn new(
        surfaces: Arc<dyn PresentationSurface>,
        device: Arc<dyn DriverDevice>,
        window: u64,
        width: u32,
        height: u32,
        with_depth: bool,
    ) -> ReplayResult<Self> {
        let surface = surfaces.create_surface(window, width, height)?;
        let mut output = Self {
            surfaces,
            device,
            window,
            surface,
            width,
            height,
            depth: None,
        };
        if with_depth {
            output.depth = Some(output.create_depth()?);
        }
        debug!(window, width, height, with_depth, "Created output window");
        Ok(output)
    }

    fn create_depth(&self) -> ReplayResult<DepthTarget> {
        let desc = TextureDesc::new_2d(self.width, self.height, OUTPUT_DEPTH_FORMAT)
            .with_bind_flags(BindFlags::DEPTH_STENCIL);
        let texture = self.device.create_texture(&desc, None)?;
        match self
            .device
            .create_view(texture, &ViewDesc::new(ViewKind::DepthStencil))
        {
            Ok(view) => Ok(DepthTarget { texture, view }),
            Err(e) => {
                self.device.release(texture);
                Err(e.into())
            }
        }
    }

    fn release_depth(&mut self) {
        if let Some(depth) = self.depth.take() {
            self.device.release(depth.view);
            self.device.release(depth.texture);
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn has_depth(&self) -> bool {
        self.depth.is_some()
    }

    /// Recreates the targets if the window now has a different size.
    /// Returns whether anything changed.
    pub fn check_resize(&mut self, width: u32, height: u32) -> ReplayResult<bool> {
        if (width, height) == (self.width, self.height) || width == 0 || height == 0 {
            return Ok(false);
        }
        self.surfaces.resize_surface(self.surface, width, height)?;
        self.width = width;
        self.height = height;
        if self.depth.is_some() {
            self.release_depth();
            self.depth = Some(self.create_depth()?);
        }
        debug!(window = self.window, width, height, "Output window resized");
        Ok(true)
    }

    /// Binds the back buffer, and the depth target if any, on `context`.
    pub fn bind(&self, context: &dyn DriverContext) -> ReplayResult<NativeHandle> {
        let target = self
            .surfaces
            .bind_surface_as_render_target(self.surface, context)?;
        if let Some(depth) = &self.depth {
            context.set_render_targets(&[target], Some(depth.view))?;
        }
        Ok(target)
    }

    /// Clears color to `color`, depth to 1 and stencil to 0.
    pub fn clear(&self, context: &dyn DriverContext, color: [f32; 4]) -> ReplayResult<()> {
        let target = self.bind(context)?;
        context.clear_render_target(target, color)?;
        if let Some(depth) = &self.depth {
            context.clear_depth_stencil(depth.view, ClearFlags::ALL, 1.0, 0)?;
        }
        Ok(())
    }

    pub fn present(&self) -> ReplayResult<()> {
        Ok(self.surfaces.present(self.surface)?)
    }

    /// Back-buffer contents, for screenshots.
    pub fn read_pixels(&self) -> ReplayResult<Bytes> {
        Ok(self.surfaces.read_surface_pixels(self.surface)?)
    }
}

impl Drop for OutputWindow {
    fn drop(&mut self) {
        self.release_depth();
        if self.surfaces.surface_size(self.surface).is_none() {
            warn!(window = self.window, "Output surface already gone");
            return;
        }
        self.surfaces.destroy_surface(self.surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::{HeadlessSurfaces, SoftDevice};

    fn setup() -> (Arc<dyn DriverDevice>, Arc<HeadlessSurfaces>) {
        let device: Arc<dyn DriverDevice> = Arc::new(SoftDevice::default());
        let surfaces = Arc::new(HeadlessSurfaces::new(Arc::clone(&device)));
        (device, surfaces)
    }

    #[test]
    fn test_clear_and_present() {
        let (device, surfaces) = setup();
        let output =
            OutputWindow::new(surfaces.clone(), Arc::clone(&device), 7, 4, 4, true).unwrap();
        assert!(output.has_depth());

        let ctx = device.immediate_context();
        output.clear(&*ctx, [0.0, 1.0, 0.0, 1.0]).unwrap();
        output.present().unwrap();
        let pixels = output.read_pixels().unwrap();
        assert_eq!(pixels.len(), 4 * 4 * 4);
        // BGRA
        assert_eq!(&pixels[..4], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_resize_recreates_targets() {
        let (device, surfaces) = setup();
        let mut output =
            OutputWindow::new(surfaces.clone(), Arc::clone(&device), 1, 4, 4, true).unwrap();
        assert!(!output.check_resize(4, 4).unwrap());
        assert!(!output.check_resize(0, 4).unwrap());
        assert!(output.check_resize(8, 2).unwrap());
        assert_eq!(output.size(), (8, 2));
        assert_eq!(output.read_pixels().unwrap().len(), 8 * 2 * 4);
        output
            .clear(&*device.immediate_context(), [0.0; 4])
            .unwrap();
    }

    #[test]
    fn test_drop_releases_everything() {
        let (device, surfaces) = setup();
        let output = OutputWindow::new(surfaces, Arc::clone(&device), 1, 2, 2, true).unwrap();
        assert_eq!(device.stats().live_objects, 4);
        drop(output);
        assert_eq!(device.stats().live_objects, 0);
    }
}
