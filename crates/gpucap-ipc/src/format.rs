//! Texel formats and component interpretations.

use serde::{Deserialize, Serialize};

/// How the components of a texel are interpreted when a format family leaves
/// it open (typeless formats) or when a viewer asks for a specific reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompType {
    /// No preference, use whatever the resource declares.
    #[default]
    Typeless,
    Float,
    UNorm,
    SNorm,
    UInt,
    SInt,
    Depth,
}

/// Texel formats understood by the capture and replay layers.
///
/// This is the subset of the DXGI format table that the engine exercises:
/// 8-bit color in both channel orders, 32-bit single channel, the three depth
/// families with their typeless and per-plane view formats, and NV12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Format {
    #[default]
    Unknown,
    R8G8B8A8Typeless,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    R8G8B8A8Uint,
    R8G8B8A8Snorm,
    R8G8B8A8Sint,
    B8G8R8A8Typeless,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R8Unorm,
    R8Uint,
    R8G8Unorm,
    R32Typeless,
    R32Float,
    R32Uint,
    R32Sint,
    D32Float,
    R24G8Typeless,
    D24UnormS8Uint,
    R24UnormX8Typeless,
    X24TypelessG8Uint,
    R32G8X24Typeless,
    D32FloatS8X24Uint,
    R32FloatX8X24Typeless,
    X32TypelessG8X24Uint,
    Nv12,
}

impl Format {
    /// Size of one texel in bytes. For NV12 this is the luma plane texel size;
    /// use [`Format::surface_size`] for whole-surface sizes.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::R8Unorm | Self::R8Uint | Self::Nv12 => 1,
            Self::R8G8Unorm => 2,
            Self::R32G8X24Typeless
            | Self::D32FloatS8X24Uint
            | Self::R32FloatX8X24Typeless
            | Self::X32TypelessG8X24Uint => 8,
            _ => 4,
        }
    }

    /// Number of bytes needed for a `width` x `height` slice in this format.
    pub fn surface_size(self, width: u32, height: u32) -> usize {
        let texels = width as usize * height as usize;
        match self {
            // Full-resolution luma followed by half-resolution interleaved chroma.
            Self::Nv12 => texels + (width.div_ceil(2) as usize * height.div_ceil(2) as usize * 2),
            _ => texels * self.bytes_per_pixel() as usize,
        }
    }

    /// Returns true for formats that can be bound as a depth-stencil target.
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D32Float | Self::D24UnormS8Uint | Self::D32FloatS8X24Uint
        )
    }

    /// Returns true for any member of a depth family, including its typeless
    /// storage format and per-plane view formats.
    pub fn is_depth_family(self) -> bool {
        matches!(
            self.typeless(),
            Self::R24G8Typeless | Self::R32G8X24Typeless
        ) || self == Self::D32Float
    }

    /// Returns true when the format carries a stencil plane.
    pub fn has_stencil(self) -> bool {
        matches!(
            self.typeless(),
            Self::R24G8Typeless | Self::R32G8X24Typeless
        )
    }

    pub fn is_typeless(self) -> bool {
        matches!(
            self,
            Self::R8G8B8A8Typeless
                | Self::B8G8R8A8Typeless
                | Self::R32Typeless
                | Self::R24G8Typeless
                | Self::R32G8X24Typeless
        )
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Self::R8G8B8A8UnormSrgb | Self::B8G8R8A8UnormSrgb)
    }

    /// Returns true for planar YUV formats.
    pub fn is_yuv(self) -> bool {
        matches!(self, Self::Nv12)
    }

    /// Returns true when all channels are stored as integers.
    pub fn is_integer(self) -> bool {
        matches!(self.comp_type(), CompType::UInt | CompType::SInt)
    }

    /// The typeless storage format of this format's family.
    pub fn typeless(self) -> Format {
        match self {
            Self::R8G8B8A8Typeless
            | Self::R8G8B8A8Unorm
            | Self::R8G8B8A8UnormSrgb
            | Self::R8G8B8A8Uint
            | Self::R8G8B8A8Snorm
            | Self::R8G8B8A8Sint => Self::R8G8B8A8Typeless,
            Self::B8G8R8A8Typeless | Self::B8G8R8A8Unorm | Self::B8G8R8A8UnormSrgb => {
                Self::B8G8R8A8Typeless
            }
            Self::R32Typeless | Self::R32Float | Self::R32Uint | Self::R32Sint | Self::D32Float => {
                Self::R32Typeless
            }
            Self::R24G8Typeless
            | Self::D24UnormS8Uint
            | Self::R24UnormX8Typeless
            | Self::X24TypelessG8Uint => Self::R24G8Typeless,
            Self::R32G8X24Typeless
            | Self::D32FloatS8X24Uint
            | Self::R32FloatX8X24Typeless
            | Self::X32TypelessG8X24Uint => Self::R32G8X24Typeless,
            other => other,
        }
    }

    /// Resolves this format's family to a concrete format for the requested
    /// component interpretation. A `Typeless` hint keeps typed formats as they
    /// are and picks the family's natural reading for typeless ones.
    pub fn typed(self, hint: CompType) -> Format {
        match (self.typeless(), hint) {
            (_, CompType::Typeless) if !self.is_typeless() => self,
            (Self::R8G8B8A8Typeless, CompType::UInt) => Self::R8G8B8A8Uint,
            (Self::R8G8B8A8Typeless, CompType::SInt) => Self::R8G8B8A8Sint,
            (Self::R8G8B8A8Typeless, CompType::SNorm) => Self::R8G8B8A8Snorm,
            (Self::R8G8B8A8Typeless, _) => {
                if self.is_srgb() {
                    self
                } else {
                    Self::R8G8B8A8Unorm
                }
            }
            (Self::B8G8R8A8Typeless, _) => {
                if self.is_srgb() {
                    self
                } else {
                    Self::B8G8R8A8Unorm
                }
            }
            (Self::R32Typeless, CompType::UInt) => Self::R32Uint,
            (Self::R32Typeless, CompType::SInt) => Self::R32Sint,
            (Self::R32Typeless, _) => Self::R32Float,
            (Self::R24G8Typeless, CompType::UInt) => Self::X24TypelessG8Uint,
            (Self::R24G8Typeless, _) => Self::R24UnormX8Typeless,
            (Self::R32G8X24Typeless, CompType::UInt) => Self::X32TypelessG8X24Uint,
            (Self::R32G8X24Typeless, _) => Self::R32FloatX8X24Typeless,
            (family, _) => family,
        }
    }

    /// The sRGB member of this format's family, or the format itself when the
    /// family has none.
    pub fn srgb(self) -> Format {
        match self.typeless() {
            Self::R8G8B8A8Typeless if !self.is_integer() => Self::R8G8B8A8UnormSrgb,
            Self::B8G8R8A8Typeless => Self::B8G8R8A8UnormSrgb,
            _ => self,
        }
    }

    /// The linear member of an sRGB format.
    pub fn linear(self) -> Format {
        match self {
            Self::R8G8B8A8UnormSrgb => Self::R8G8B8A8Unorm,
            Self::B8G8R8A8UnormSrgb => Self::B8G8R8A8Unorm,
            other => other,
        }
    }

    /// The format used to write this family as a depth-stencil target.
    pub fn depth_target(self) -> Format {
        match self.typeless() {
            Self::R24G8Typeless => Self::D24UnormS8Uint,
            Self::R32G8X24Typeless => Self::D32FloatS8X24Uint,
            Self::R32Typeless => Self::D32Float,
            other => other,
        }
    }

    /// Shader-resource view format reading the depth plane.
    pub fn depth_plane_view(self) -> Format {
        match self.typeless() {
            Self::R24G8Typeless => Self::R24UnormX8Typeless,
            Self::R32G8X24Typeless => Self::R32FloatX8X24Typeless,
            Self::R32Typeless => Self::R32Float,
            other => other,
        }
    }

    /// Shader-resource view format reading the stencil plane, if there is one.
    pub fn stencil_plane_view(self) -> Option<Format> {
        match self.typeless() {
            Self::R24G8Typeless => Some(Self::X24TypelessG8Uint),
            Self::R32G8X24Typeless => Some(Self::X32TypelessG8X24Uint),
            _ => None,
        }
    }

    /// View formats of the individual planes of a planar format.
    pub fn plane_views(self) -> &'static [Format] {
        match self {
            Self::Nv12 => &[Self::R8Unorm, Self::R8G8Unorm],
            _ => &[],
        }
    }

    /// The natural component interpretation of this format.
    pub fn comp_type(self) -> CompType {
        match self {
            Self::R8G8B8A8Uint | Self::R8Uint | Self::R32Uint | Self::X24TypelessG8Uint
            | Self::X32TypelessG8X24Uint => CompType::UInt,
            Self::R8G8B8A8Sint | Self::R32Sint => CompType::SInt,
            Self::R8G8B8A8Snorm => CompType::SNorm,
            Self::R32Float => CompType::Float,
            Self::D32Float
            | Self::D24UnormS8Uint
            | Self::D32FloatS8X24Uint
            | Self::R24UnormX8Typeless
            | Self::R32FloatX8X24Typeless => CompType::Depth,
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8UnormSrgb
            | Self::B8G8R8A8Unorm
            | Self::B8G8R8A8UnormSrgb
            | Self::R8Unorm
            | Self::R8G8Unorm
            | Self::Nv12 => CompType::UNorm,
            _ => CompType::Typeless,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::R8G8B8A8Typeless => "R8G8B8A8_TYPELESS",
            Self::R8G8B8A8Unorm => "R8G8B8A8_UNORM",
            Self::R8G8B8A8UnormSrgb => "R8G8B8A8_UNORM_SRGB",
            Self::R8G8B8A8Uint => "R8G8B8A8_UINT",
            Self::R8G8B8A8Snorm => "R8G8B8A8_SNORM",
            Self::R8G8B8A8Sint => "R8G8B8A8_SINT",
            Self::B8G8R8A8Typeless => "B8G8R8A8_TYPELESS",
            Self::B8G8R8A8Unorm => "B8G8R8A8_UNORM",
            Self::B8G8R8A8UnormSrgb => "B8G8R8A8_UNORM_SRGB",
            Self::R8Unorm => "R8_UNORM",
            Self::R8Uint => "R8_UINT",
            Self::R8G8Unorm => "R8G8_UNORM",
            Self::R32Typeless => "R32_TYPELESS",
            Self::R32Float => "R32_FLOAT",
            Self::R32Uint => "R32_UINT",
            Self::R32Sint => "R32_SINT",
            Self::D32Float => "D32_FLOAT",
            Self::R24G8Typeless => "R24G8_TYPELESS",
            Self::D24UnormS8Uint => "D24_UNORM_S8_UINT",
            Self::R24UnormX8Typeless => "R24_UNORM_X8_TYPELESS",
            Self::X24TypelessG8Uint => "X24_TYPELESS_G8_UINT",
            Self::R32G8X24Typeless => "R32G8X24_TYPELESS",
            Self::D32FloatS8X24Uint => "D32_FLOAT_S8X24_UINT",
            Self::R32FloatX8X24Typeless => "R32_FLOAT_X8X24_TYPELESS",
            Self::X32TypelessG8X24Uint => "X32_TYPELESS_G8X24_UINT",
            Self::Nv12 => "NV12",
        }
    }

    /// Stable numeric code used by the log encoding.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Inverse of [`Format::code`].
    pub fn from_code(code: u32) -> Option<Format> {
        ALL_FORMATS.get(code as usize).copied()
    }
}

const ALL_FORMATS: [Format; 27] = [
    Format::Unknown,
    Format::R8G8B8A8Typeless,
    Format::R8G8B8A8Unorm,
    Format::R8G8B8A8UnormSrgb,
    Format::R8G8B8A8Uint,
    Format::R8G8B8A8Snorm,
    Format::R8G8B8A8Sint,
    Format::B8G8R8A8Typeless,
    Format::B8G8R8A8Unorm,
    Format::B8G8R8A8UnormSrgb,
    Format::R8Unorm,
    Format::R8Uint,
    Format::R8G8Unorm,
    Format::R32Typeless,
    Format::R32Float,
    Format::R32Uint,
    Format::R32Sint,
    Format::D32Float,
    Format::R24G8Typeless,
    Format::D24UnormS8Uint,
    Format::R24UnormX8Typeless,
    Format::X24TypelessG8Uint,
    Format::R32G8X24Typeless,
    Format::D32FloatS8X24Uint,
    Format::R32FloatX8X24Typeless,
    Format::X32TypelessG8X24Uint,
    Format::Nv12,
];

impl CompType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<CompType> {
        const ALL: [CompType; 7] = [
            CompType::Typeless,
            CompType::Float,
            CompType::UNorm,
            CompType::SNorm,
            CompType::UInt,
            CompType::SInt,
            CompType::Depth,
        ];
        ALL.get(code as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_codes_are_dense() {
        for (i, f) in ALL_FORMATS.iter().enumerate() {
            assert_eq!(f.code() as usize, i);
            assert_eq!(Format::from_code(f.code()), Some(*f));
        }
        assert_eq!(Format::from_code(ALL_FORMATS.len() as u32), None);
    }

    #[test]
    fn test_typeless_resolution() {
        assert_eq!(Format::R8G8B8A8Typeless.typed(CompType::Typeless), Format::R8G8B8A8Unorm);
        assert_eq!(Format::R8G8B8A8Typeless.typed(CompType::UInt), Format::R8G8B8A8Uint);
        assert_eq!(Format::R8G8B8A8Unorm.typed(CompType::Typeless), Format::R8G8B8A8Unorm);
        assert_eq!(Format::R8G8B8A8Unorm.typed(CompType::UInt), Format::R8G8B8A8Uint);
        assert_eq!(Format::R32Typeless.typed(CompType::Float), Format::R32Float);
    }

    #[test]
    fn test_depth_families() {
        assert!(Format::D24UnormS8Uint.is_depth());
        assert!(Format::R24G8Typeless.is_depth_family());
        assert!(Format::D32Float.is_depth_family());
        assert!(!Format::R32Float.is_depth_family());
        assert_eq!(Format::D24UnormS8Uint.depth_plane_view(), Format::R24UnormX8Typeless);
        assert_eq!(Format::D24UnormS8Uint.stencil_plane_view(), Some(Format::X24TypelessG8Uint));
        assert_eq!(Format::D32Float.stencil_plane_view(), None);
        assert_eq!(Format::R24G8Typeless.depth_target(), Format::D24UnormS8Uint);
    }

    #[test]
    fn test_srgb_pairs() {
        assert_eq!(Format::R8G8B8A8Unorm.srgb(), Format::R8G8B8A8UnormSrgb);
        assert_eq!(Format::B8G8R8A8UnormSrgb.linear(), Format::B8G8R8A8Unorm);
        assert_eq!(Format::R32Float.srgb(), Format::R32Float);
    }

    #[test]
    fn test_nv12_surface_size() {
        assert_eq!(Format::Nv12.surface_size(4, 4), 16 + 8);
        assert_eq!(Format::Nv12.plane_views().len(), 2);
        assert_eq!(Format::R8G8B8A8Unorm.surface_size(4, 4), 64);
    }
}
