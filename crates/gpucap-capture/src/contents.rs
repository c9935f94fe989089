//! Reading, writing and clearing the whole contents of a resource.

use bytes::{Bytes, BytesMut};

use gpucap_driver::{DriverContext, DriverDevice, DriverError, DriverResult, NativeHandle};
use gpucap_ipc::{
    BindFlags, ClearFlags, ClearValue, CompType, Format, ResourceDesc, TextureDesc, Usage,
    ViewDesc, ViewKind,
};

/// Format of the transient view a clear of `desc` goes through.
pub fn clear_view_format(desc: &TextureDesc) -> Format {
    if desc.bind_flags.contains(BindFlags::DEPTH_STENCIL) || desc.format.is_depth_family() {
        desc.format.depth_target()
    } else {
        desc.format.typed(CompType::UNorm)
    }
}

/// Reads every subresource of a texture or buffer, in layout order.
pub fn read_contents(
    context: &dyn DriverContext,
    resource: NativeHandle,
    desc: &ResourceDesc,
) -> DriverResult<Bytes> {
    match desc {
        ResourceDesc::Texture(texture) => {
            let mut out = BytesMut::with_capacity(texture.byte_size());
            for sub in 0..texture.subresource_count() {
                out.extend_from_slice(&context.read_subresource(resource, sub)?);
            }
            Ok(out.freeze())
        }
        ResourceDesc::Buffer(_) => context.read_subresource(resource, 0),
        other => Err(DriverError::InvalidArgument(format!(
            "{} has no contents",
            other.kind().name()
        ))),
    }
}

fn write_one(
    context: &dyn DriverContext,
    resource: NativeHandle,
    usage: Usage,
    subresource: u32,
    data: &[u8],
) -> DriverResult<()> {
    match usage {
        Usage::Dynamic | Usage::Staging => context.write_subresource(resource, subresource, data),
        Usage::Default => context.update_subresource(resource, subresource, data),
        Usage::Immutable => Err(DriverError::InvalidArgument(
            "immutable resources cannot be written".into(),
        )),
    }
}

/// Writes every subresource of a texture or buffer from `data`, which holds
/// them back to back in layout order.
pub fn write_contents(
    context: &dyn DriverContext,
    resource: NativeHandle,
    desc: &ResourceDesc,
    data: &[u8],
) -> DriverResult<()> {
    if data.len() != desc.byte_size() {
        return Err(DriverError::InvalidArgument(format!(
            "contents are {} bytes, resource holds {}",
            data.len(),
            desc.byte_size()
        )));
    }
    match desc {
        ResourceDesc::Texture(texture) => {
            for sub in 0..texture.subresource_count() {
                let layout = texture.subresource_layout(sub).ok_or_else(|| {
                    DriverError::InvalidArgument(format!("no subresource {sub}"))
                })?;
                let bytes = &data[layout.offset..layout.offset + layout.len];
                write_one(context, resource, texture.usage, sub, bytes)?;
            }
            Ok(())
        }
        ResourceDesc::Buffer(buffer) => write_one(context, resource, buffer.usage, 0, data),
        other => Err(DriverError::InvalidArgument(format!(
            "{} has no contents",
            other.kind().name()
        ))),
    }
}

/// Sets the whole resource to one value.
pub fn clear_contents(
    device: &dyn DriverDevice,
    context: &dyn DriverContext,
    resource: NativeHandle,
    desc: &ResourceDesc,
    value: ClearValue,
) -> DriverResult<()> {
    let texture = match (desc, value) {
        (_, ClearValue::Zeroed) => {
            return write_contents(context, resource, desc, &vec![0u8; desc.byte_size()]);
        }
        (ResourceDesc::Texture(texture), _) => texture,
        _ => {
            return Err(DriverError::InvalidArgument(
                "only textures clear to a value".into(),
            ))
        }
    };

    let format = clear_view_format(texture);
    let view_desc = match value {
        ClearValue::DepthStencil { .. } => ViewDesc::new(ViewKind::DepthStencil),
        _ => ViewDesc::new(ViewKind::RenderTarget),
    }
    .with_format(format);
    let view = device.create_view(resource, &view_desc)?;
    let result = match value {
        ClearValue::Color(color) => context.clear_render_target(view, color),
        ClearValue::DepthStencil { depth, stencil } => {
            let flags = if format.has_stencil() {
                ClearFlags::ALL
            } else {
                ClearFlags::DEPTH
            };
            context.clear_depth_stencil(view, flags, depth, stencil)
        }
        ClearValue::Zeroed => Ok(()),
    };
    device.release(view);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::SoftDevice;

    #[test]
    fn test_clear_view_format() {
        let color = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Typeless);
        assert_eq!(clear_view_format(&color), Format::R8G8B8A8Unorm);
        let depth = TextureDesc::new_2d(2, 2, Format::R24G8Typeless)
            .with_bind_flags(BindFlags::DEPTH_STENCIL);
        assert_eq!(clear_view_format(&depth), Format::D24UnormS8Uint);
        let srgb = TextureDesc::new_2d(2, 2, Format::B8G8R8A8UnormSrgb);
        assert_eq!(clear_view_format(&srgb), Format::B8G8R8A8UnormSrgb);
    }

    #[test]
    fn test_write_then_read_mips() {
        let device = SoftDevice::default();
        let mut texture = TextureDesc::new_2d(4, 4, Format::R8Unorm);
        texture.mip_levels = 3;
        let handle = device.create_texture(&texture, None).unwrap();
        let desc = ResourceDesc::Texture(texture);
        let data: Vec<u8> = (0..desc.byte_size() as u8).collect();

        let ctx = device.immediate_context();
        write_contents(&*ctx, handle, &desc, &data).unwrap();
        assert_eq!(&read_contents(&*ctx, handle, &desc).unwrap()[..], &data[..]);
        assert!(write_contents(&*ctx, handle, &desc, &data[1..]).is_err());
    }

    #[test]
    fn test_clear_color_and_depth() {
        let device = SoftDevice::default();
        let ctx = device.immediate_context();

        let color = TextureDesc::new_2d(2, 1, Format::R8G8B8A8Typeless)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        let handle = device.create_texture(&color, None).unwrap();
        let desc = ResourceDesc::Texture(color);
        clear_contents(&device, &*ctx, handle, &desc, ClearValue::Color([1.0, 0.0, 0.0, 1.0]))
            .unwrap();
        assert_eq!(
            &read_contents(&*ctx, handle, &desc).unwrap()[..],
            &[255, 0, 0, 255, 255, 0, 0, 255]
        );

        let depth = TextureDesc::new_2d(1, 1, Format::D32Float)
            .with_bind_flags(BindFlags::DEPTH_STENCIL);
        let handle = device.create_texture(&depth, None).unwrap();
        let desc = ResourceDesc::Texture(depth);
        let value = ClearValue::DepthStencil {
            depth: 1.0,
            stencil: 0,
        };
        clear_contents(&device, &*ctx, handle, &desc, value).unwrap();
        assert_eq!(
            &read_contents(&*ctx, handle, &desc).unwrap()[..],
            &1.0f32.to_le_bytes()
        );

        // Transient views are gone again.
        assert_eq!(device.stats().live_objects, 2);
    }
}
