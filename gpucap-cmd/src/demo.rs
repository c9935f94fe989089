//! Built-in scene for producing a capture without an application.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use gpucap_capture::WrappedDevice;
use gpucap_driver::{create_driver, DriverKind, SoftConfig};
use gpucap_ipc::{CaptureOptions, Format, TextureDesc, Triangle, ViewDesc, ViewKind};
use gpucap_log::ChunkLog;

const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

fn scene() -> [Triangle; 3] {
    [
        Triangle {
            vertices: [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0]],
            depth: 0.5,
            color: [1.0, 0.0, 0.0, 1.0],
        },
        Triangle {
            vertices: [[1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]],
            depth: 0.5,
            color: [0.0, 1.0, 0.0, 1.0],
        },
        Triangle {
            vertices: [[-0.5, -0.5], [0.5, -0.5], [0.0, 0.5]],
            depth: 0.25,
            color: [0.0, 0.0, 1.0, 1.0],
        },
    ]
}

/// Captures one frame of the demo scene at `width` x `height`.
pub fn record(driver: DriverKind, width: u32, height: u32) -> Result<ChunkLog> {
    let native = create_driver(driver, SoftConfig::default())?;
    let device = WrappedDevice::new(native, CaptureOptions::default());

    let target = device.create_texture(&TextureDesc::new_2d(width, height, Format::R8G8B8A8Unorm), None)?;
    device.set_resource_name(&target, "Backbuffer")?;
    let rtv = device.create_view(&target, &ViewDesc::new(ViewKind::RenderTarget))?;
    let ctx = device.immediate_context();

    device.begin_capture()?;
    ctx.set_render_targets(&[&rtv], None)?;
    ctx.clear_render_target_view(&rtv, CLEAR_COLOR)?;
    ctx.push_marker("Scene");
    for tri in scene() {
        ctx.draw(std::slice::from_ref(&tri))?;
    }
    ctx.pop_marker();
    let log = device.end_capture()?;

    info!(chunks = log.len(), "Demo frame captured");
    Ok(log)
}

/// Captures the demo scene and writes it to `path`.
pub fn record_to(path: &Path, driver: DriverKind, width: u32, height: u32) -> Result<ChunkLog> {
    let log = record(driver, width, height)?;
    log.save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_demo_scene() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.gcap");
        let log = record_to(&path, DriverKind::Soft, 8, 8).unwrap();

        assert!(path.exists());
        let reopened = ChunkLog::open(&path).unwrap();
        assert_eq!(reopened.len(), log.len());
        assert_eq!(reopened.last_event(), log.last_event());
    }
}
