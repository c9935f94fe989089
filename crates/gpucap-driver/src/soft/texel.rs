//! Texel encoding for the software backend.

use gpucap_ipc::Format;

const D24_MAX: f32 = 16_777_215.0;

fn unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn snorm8(c: f32) -> u8 {
    (c.clamp(-1.0, 1.0) * 127.0).round() as i8 as u8
}

fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn u32_at(texel: &[u8]) -> u32 {
    u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]])
}

/// Writes `color` into one texel of `format`. `out` is exactly one texel.
pub(crate) fn encode_color(format: Format, color: [f32; 4], out: &mut [u8]) {
    let [r, g, b, a] = color;
    match format.typed(gpucap_ipc::CompType::Typeless) {
        Format::R8G8B8A8Unorm => out.copy_from_slice(&[unorm8(r), unorm8(g), unorm8(b), unorm8(a)]),
        Format::R8G8B8A8UnormSrgb => out.copy_from_slice(&[
            unorm8(linear_to_srgb(r)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(b)),
            unorm8(a),
        ]),
        Format::R8G8B8A8Snorm => out.copy_from_slice(&[snorm8(r), snorm8(g), snorm8(b), snorm8(a)]),
        Format::R8G8B8A8Uint => {
            for (o, c) in out.iter_mut().zip(color) {
                *o = c.clamp(0.0, 255.0) as u8;
            }
        }
        Format::R8G8B8A8Sint => {
            for (o, c) in out.iter_mut().zip(color) {
                *o = c.clamp(-128.0, 127.0) as i8 as u8;
            }
        }
        Format::B8G8R8A8Unorm => out.copy_from_slice(&[unorm8(b), unorm8(g), unorm8(r), unorm8(a)]),
        Format::B8G8R8A8UnormSrgb => out.copy_from_slice(&[
            unorm8(linear_to_srgb(b)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(r)),
            unorm8(a),
        ]),
        Format::R8Unorm | Format::Nv12 => out[0] = unorm8(r),
        Format::R8Uint => out[0] = r.clamp(0.0, 255.0) as u8,
        Format::R8G8Unorm => out.copy_from_slice(&[unorm8(r), unorm8(g)]),
        Format::R32Float | Format::D32Float => out.copy_from_slice(&r.to_le_bytes()),
        Format::R32Uint => out.copy_from_slice(&(r.max(0.0) as u32).to_le_bytes()),
        Format::R32Sint => out.copy_from_slice(&(r as i32).to_le_bytes()),
        _ => out.fill(0),
    }
}

/// Reads one texel of `format` as a color. Unused channels read as 0 with
/// alpha 1.
pub(crate) fn decode_color(format: Format, texel: &[u8]) -> [f32; 4] {
    let n = |v: u8| v as f32 / 255.0;
    let s = |v: u8| (v as i8 as f32 / 127.0).max(-1.0);
    match format.typed(gpucap_ipc::CompType::Typeless) {
        Format::R8G8B8A8Unorm => [n(texel[0]), n(texel[1]), n(texel[2]), n(texel[3])],
        Format::R8G8B8A8UnormSrgb => [
            srgb_to_linear(n(texel[0])),
            srgb_to_linear(n(texel[1])),
            srgb_to_linear(n(texel[2])),
            n(texel[3]),
        ],
        Format::R8G8B8A8Snorm => [s(texel[0]), s(texel[1]), s(texel[2]), s(texel[3])],
        Format::R8G8B8A8Uint => [
            texel[0] as f32,
            texel[1] as f32,
            texel[2] as f32,
            texel[3] as f32,
        ],
        Format::R8G8B8A8Sint => [
            texel[0] as i8 as f32,
            texel[1] as i8 as f32,
            texel[2] as i8 as f32,
            texel[3] as i8 as f32,
        ],
        Format::B8G8R8A8Unorm => [n(texel[2]), n(texel[1]), n(texel[0]), n(texel[3])],
        Format::B8G8R8A8UnormSrgb => [
            srgb_to_linear(n(texel[2])),
            srgb_to_linear(n(texel[1])),
            srgb_to_linear(n(texel[0])),
            n(texel[3]),
        ],
        Format::R8Unorm | Format::Nv12 => [n(texel[0]), 0.0, 0.0, 1.0],
        Format::R8Uint => [texel[0] as f32, 0.0, 0.0, 1.0],
        Format::R8G8Unorm => [n(texel[0]), n(texel[1]), 0.0, 1.0],
        Format::R32Float | Format::D32Float => {
            [f32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]), 0.0, 0.0, 1.0]
        }
        Format::R32Uint => [u32_at(texel) as f32, 0.0, 0.0, 1.0],
        Format::R32Sint => [u32_at(texel) as i32 as f32, 0.0, 0.0, 1.0],
        Format::D24UnormS8Uint | Format::R24UnormX8Typeless => {
            [read_depth(format, texel), 0.0, 0.0, 1.0]
        }
        Format::X24TypelessG8Uint | Format::X32TypelessG8X24Uint => {
            [read_stencil(format, texel) as f32, 0.0, 0.0, 1.0]
        }
        Format::D32FloatS8X24Uint | Format::R32FloatX8X24Typeless => {
            [read_depth(format, texel), 0.0, 0.0, 1.0]
        }
        _ => [0.0, 0.0, 0.0, 1.0],
    }
}

pub(crate) fn read_depth(format: Format, texel: &[u8]) -> f32 {
    match format.typeless() {
        Format::R24G8Typeless => (u32_at(texel) & 0x00FF_FFFF) as f32 / D24_MAX,
        _ => f32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]),
    }
}

pub(crate) fn write_depth(format: Format, texel: &mut [u8], depth: f32) {
    match format.typeless() {
        Format::R24G8Typeless => {
            let stencil = u32_at(texel) & 0xFF00_0000;
            let d = (depth.clamp(0.0, 1.0) * D24_MAX).round() as u32;
            texel[..4].copy_from_slice(&(stencil | d).to_le_bytes());
        }
        _ => texel[..4].copy_from_slice(&depth.to_le_bytes()),
    }
}

pub(crate) fn read_stencil(format: Format, texel: &[u8]) -> u8 {
    match format.typeless() {
        Format::R24G8Typeless => texel[3],
        Format::R32G8X24Typeless => texel[4],
        _ => 0,
    }
}

pub(crate) fn write_stencil(format: Format, texel: &mut [u8], stencil: u8) {
    match format.typeless() {
        Format::R24G8Typeless => texel[3] = stencil,
        Format::R32G8X24Typeless => texel[4] = stencil,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unorm_round_trip() {
        let mut texel = [0u8; 4];
        encode_color(Format::R8G8B8A8Unorm, [1.0, 0.5, 0.0, 1.0], &mut texel);
        assert_eq!(texel, [255, 128, 0, 255]);
        let c = decode_color(Format::R8G8B8A8Unorm, &texel);
        assert!((c[1] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_bgra_swizzle() {
        let mut texel = [0u8; 4];
        encode_color(Format::B8G8R8A8Unorm, [1.0, 0.0, 0.0, 1.0], &mut texel);
        assert_eq!(texel, [0, 0, 255, 255]);
    }

    #[test]
    fn test_srgb_encoding_brightens_midtones() {
        let mut linear = [0u8; 4];
        let mut srgb = [0u8; 4];
        encode_color(Format::R8G8B8A8Unorm, [0.2, 0.2, 0.2, 1.0], &mut linear);
        encode_color(Format::R8G8B8A8UnormSrgb, [0.2, 0.2, 0.2, 1.0], &mut srgb);
        assert!(srgb[0] > linear[0]);
        let back = decode_color(Format::R8G8B8A8UnormSrgb, &srgb);
        assert!((back[0] - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_d24s8_planes_are_independent() {
        let mut texel = [0u8; 4];
        write_stencil(Format::D24UnormS8Uint, &mut texel, 0x7F);
        write_depth(Format::D24UnormS8Uint, &mut texel, 1.0);
        assert_eq!(read_stencil(Format::D24UnormS8Uint, &texel), 0x7F);
        assert!((read_depth(Format::D24UnormS8Uint, &texel) - 1.0).abs() < 1e-6);
        write_depth(Format::D24UnormS8Uint, &mut texel, 0.0);
        assert_eq!(read_stencil(Format::D24UnormS8Uint, &texel), 0x7F);
    }

    #[test]
    fn test_typeless_decodes_as_unorm() {
        let c = decode_color(Format::R8G8B8A8Typeless, &[255, 0, 0, 255]);
        assert_eq!(c, [1.0, 0.0, 0.0, 1.0]);
    }
}
