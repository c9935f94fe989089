//! Conversions between gpucap descriptions and Direct3D 11 structures.

use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_CONSTANT_BUFFER, D3D11_BIND_DEPTH_STENCIL, D3D11_BIND_INDEX_BUFFER,
    D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_UNORDERED_ACCESS,
    D3D11_BIND_VERTEX_BUFFER, D3D11_BUFFER_DESC, D3D11_CPU_ACCESS_READ, D3D11_CPU_ACCESS_WRITE,
    D3D11_RESOURCE_MISC_BUFFER_ALLOW_RAW_VIEWS, D3D11_TEXTURE1D_DESC, D3D11_TEXTURE2D_DESC,
    D3D11_TEXTURE3D_DESC, D3D11_USAGE, D3D11_USAGE_DEFAULT, D3D11_USAGE_DYNAMIC,
    D3D11_USAGE_IMMUTABLE, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::*;

use gpucap_ipc::{BindFlags, BufferDesc, Format, TextureDesc, Usage};

pub(crate) fn dxgi_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Unknown => DXGI_FORMAT_UNKNOWN,
        Format::R8G8B8A8Typeless => DXGI_FORMAT_R8G8B8A8_TYPELESS,
        Format::R8G8B8A8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::R8G8B8A8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        Format::R8G8B8A8Uint => DXGI_FORMAT_R8G8B8A8_UINT,
        Format::R8G8B8A8Snorm => DXGI_FORMAT_R8G8B8A8_SNORM,
        Format::R8G8B8A8Sint => DXGI_FORMAT_R8G8B8A8_SINT,
        Format::B8G8R8A8Typeless => DXGI_FORMAT_B8G8R8A8_TYPELESS,
        Format::B8G8R8A8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::B8G8R8A8UnormSrgb => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        Format::R8Unorm => DXGI_FORMAT_R8_UNORM,
        Format::R8Uint => DXGI_FORMAT_R8_UINT,
        Format::R8G8Unorm => DXGI_FORMAT_R8G8_UNORM,
        Format::R32Typeless => DXGI_FORMAT_R32_TYPELESS,
        Format::R32Float => DXGI_FORMAT_R32_FLOAT,
        Format::R32Uint => DXGI_FORMAT_R32_UINT,
        Format::R32Sint => DXGI_FORMAT_R32_SINT,
        Format::D32Float => DXGI_FORMAT_D32_FLOAT,
        Format::R24G8Typeless => DXGI_FORMAT_R24G8_TYPELESS,
        Format::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        Format::R24UnormX8Typeless => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        Format::X24TypelessG8Uint => DXGI_FORMAT_X24_TYPELESS_G8_UINT,
        Format::R32G8X24Typeless => DXGI_FORMAT_R32G8X24_TYPELESS,
        Format::D32FloatS8X24Uint => DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
        Format::R32FloatX8X24Typeless => DXGI_FORMAT_R32_FLOAT_X8X24_TYPELESS,
        Format::X32TypelessG8X24Uint => DXGI_FORMAT_X32_TYPELESS_G8X24_UINT,
        Format::Nv12 => DXGI_FORMAT_NV12,
    }
}

pub(crate) fn usage(usage: Usage) -> D3D11_USAGE {
    match usage {
        Usage::Default => D3D11_USAGE_DEFAULT,
        Usage::Immutable => D3D11_USAGE_IMMUTABLE,
        Usage::Dynamic => D3D11_USAGE_DYNAMIC,
        Usage::Staging => D3D11_USAGE_STAGING,
    }
}

pub(crate) fn cpu_access(usage: Usage) -> u32 {
    match usage {
        Usage::Dynamic => D3D11_CPU_ACCESS_WRITE.0 as u32,
        Usage::Staging => (D3D11_CPU_ACCESS_READ.0 | D3D11_CPU_ACCESS_WRITE.0) as u32,
        Usage::Default | Usage::Immutable => 0,
    }
}

pub(crate) fn bind_flags(flags: BindFlags) -> u32 {
    [
        (BindFlags::VERTEX_BUFFER, D3D11_BIND_VERTEX_BUFFER.0),
        (BindFlags::INDEX_BUFFER, D3D11_BIND_INDEX_BUFFER.0),
        (BindFlags::CONSTANT_BUFFER, D3D11_BIND_CONSTANT_BUFFER.0),
        (BindFlags::SHADER_RESOURCE, D3D11_BIND_SHADER_RESOURCE.0),
        (BindFlags::RENDER_TARGET, D3D11_BIND_RENDER_TARGET.0),
        (BindFlags::DEPTH_STENCIL, D3D11_BIND_DEPTH_STENCIL.0),
        (BindFlags::UNORDERED_ACCESS, D3D11_BIND_UNORDERED_ACCESS.0),
    ]
    .into_iter()
    .filter(|(ours, _)| flags.contains(*ours))
    .fold(0u32, |acc, (_, theirs)| acc | theirs as u32)
}

fn sample_desc(count: u32) -> DXGI_SAMPLE_DESC {
    DXGI_SAMPLE_DESC {
        Count: count.max(1),
        Quality: 0,
    }
}

pub(crate) fn texture1d_desc(desc: &TextureDesc) -> D3D11_TEXTURE1D_DESC {
    D3D11_TEXTURE1D_DESC {
        Width: desc.width,
        MipLevels: desc.mip_levels,
        ArraySize: desc.array_size,
        Format: dxgi_format(desc.format),
        Usage: usage(desc.usage),
        BindFlags: bind_flags(desc.bind_flags),
        CPUAccessFlags: cpu_access(desc.usage),
        MiscFlags: 0,
    }
}

pub(crate) fn texture2d_desc(desc: &TextureDesc) -> D3D11_TEXTURE2D_DESC {
    D3D11_TEXTURE2D_DESC {
        Width: desc.width,
        Height: desc.height,
        MipLevels: desc.mip_levels,
        ArraySize: desc.array_size,
        Format: dxgi_format(desc.format),
        SampleDesc: sample_desc(desc.sample_count),
        Usage: usage(desc.usage),
        BindFlags: bind_flags(desc.bind_flags),
        CPUAccessFlags: cpu_access(desc.usage),
        MiscFlags: 0,
    }
}

pub(crate) fn texture3d_desc(desc: &TextureDesc) -> D3D11_TEXTURE3D_DESC {
    D3D11_TEXTURE3D_DESC {
        Width: desc.width,
        Height: desc.height,
        Depth: desc.depth,
        MipLevels: desc.mip_levels,
        Format: dxgi_format(desc.format),
        Usage: usage(desc.usage),
        BindFlags: bind_flags(desc.bind_flags),
        CPUAccessFlags: cpu_access(desc.usage),
        MiscFlags: 0,
    }
}

pub(crate) fn buffer_desc(desc: &BufferDesc) -> D3D11_BUFFER_DESC {
    let viewable = desc.bind_flags.contains(BindFlags::UNORDERED_ACCESS)
        || desc.bind_flags.contains(BindFlags::SHADER_RESOURCE);
    let misc = if viewable && !desc.bind_flags.contains(BindFlags::CONSTANT_BUFFER) {
        D3D11_RESOURCE_MISC_BUFFER_ALLOW_RAW_VIEWS.0 as u32
    } else {
        0
    };
    D3D11_BUFFER_DESC {
        ByteWidth: desc.byte_width,
        Usage: usage(desc.usage),
        BindFlags: bind_flags(desc.bind_flags),
        CPUAccessFlags: cpu_access(desc.usage),
        MiscFlags: misc,
        StructureByteStride: desc.structure_stride,
    }
}

/// Row pitch of a tightly packed mip row.
pub(crate) fn row_pitch(format: Format, width: u32) -> usize {
    if format.is_yuv() {
        width as usize
    } else {
        width as usize * format.bytes_per_pixel() as usize
    }
}

/// Rows of a tightly packed subresource, both NV12 planes included.
pub(crate) fn row_count(format: Format, height: u32) -> usize {
    if format.is_yuv() {
        height as usize + height.div_ceil(2) as usize
    } else {
        height as usize
    }
}
