//! Little-endian field codec shared by every chunk payload.
//!
//! Writing goes straight into a [`BytesMut`]; reading goes through [`Reader`],
//! which checks the remaining length before every field so a truncated or
//! corrupt payload becomes a [`LogError`] instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use gpucap_ipc::{
    BindFlags, BufferDesc, ClearFlags, ClearValue, DeviceCaps, DispatchArgs, EventId, Format,
    InitialContents, InterfaceVersion, QueryKind, ResourceId, TextureDesc, TextureDimension,
    Triangle, Usage, ViewDesc, ViewKind,
};

use crate::{LogError, LogResult};

/// Bounds-checked cursor over one chunk payload.
pub struct Reader {
    buf: Bytes,
    event_id: EventId,
}

impl Reader {
    pub fn new(buf: Bytes, event_id: EventId) -> Self {
        Self { buf, event_id }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Builds a corruption error for the chunk being read.
    pub fn corrupt(&self, reason: impl Into<String>) -> LogError {
        LogError::Corrupt {
            event_id: self.event_id,
            reason: reason.into(),
        }
    }

    fn need(&self, needed: usize, what: &'static str) -> LogResult<()> {
        if self.buf.remaining() < needed {
            return Err(LogError::Truncated {
                what,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &'static str) -> LogResult<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self, what: &'static str) -> LogResult<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self, what: &'static str) -> LogResult<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self, what: &'static str) -> LogResult<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn f32(&mut self, what: &'static str) -> LogResult<f32> {
        self.need(4, what)?;
        Ok(self.buf.get_f32_le())
    }

    /// Reads `len` raw bytes without a length prefix.
    pub fn raw(&mut self, len: usize, what: &'static str) -> LogResult<Bytes> {
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    /// Reads a value of any [`Serialise`] type.
    pub fn read<T: Serialise>(&mut self) -> LogResult<T> {
        T::deserialise(self)
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> LogResult<()> {
        if self.buf.has_remaining() {
            return Err(self.corrupt(format!(
                "{} trailing bytes in payload",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// A value with a fixed binary encoding inside chunk payloads.
pub trait Serialise: Sized {
    fn serialise(&self, out: &mut BytesMut);
    fn deserialise(r: &mut Reader) -> LogResult<Self>;
}

impl Serialise for u8 {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(*self);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        r.u8("u8")
    }
}

impl Serialise for u32 {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(*self);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        r.u32("u32")
    }
}

impl Serialise for u64 {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u64_le(*self);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        r.u64("u64")
    }
}

impl Serialise for f32 {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_f32_le(*self);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        r.f32("f32")
    }
}

impl Serialise for bool {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(u8::from(*self));
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        match r.u8("bool")? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(r.corrupt(format!("invalid bool {other}"))),
        }
    }
}

impl Serialise for [f32; 4] {
    fn serialise(&self, out: &mut BytesMut) {
        for v in self {
            out.put_f32_le(*v);
        }
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        Ok([r.f32("vec4")?, r.f32("vec4")?, r.f32("vec4")?, r.f32("vec4")?])
    }
}

impl Serialise for Bytes {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(self.len() as u32);
        out.put_slice(self);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let len = r.u32("byte length")? as usize;
        r.raw(len, "byte data")
    }
}

impl Serialise for String {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(self.len() as u32);
        out.put_slice(self.as_bytes());
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let len = r.u32("string length")? as usize;
        let raw = r.raw(len, "string data")?;
        String::from_utf8(raw.to_vec()).map_err(|_| r.corrupt("string is not utf-8"))
    }
}

impl<T: Serialise> Serialise for Vec<T> {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(self.len() as u32);
        for item in self {
            item.serialise(out);
        }
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let count = r.u32("element count")? as usize;
        // Every element takes at least one byte.
        if count > r.remaining() {
            return Err(r.corrupt(format!("element count {count} exceeds payload")));
        }
        (0..count).map(|_| T::deserialise(r)).collect()
    }
}

impl<T: Serialise> Serialise for Option<T> {
    fn serialise(&self, out: &mut BytesMut) {
        match self {
            Some(value) => {
                out.put_u8(1);
                value.serialise(out);
            }
            None => out.put_u8(0),
        }
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        if bool::deserialise(r)? {
            Ok(Some(T::deserialise(r)?))
        } else {
            Ok(None)
        }
    }
}

impl Serialise for ResourceId {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u64_le(self.as_raw());
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        Ok(ResourceId::from_raw(r.u64("resource id")?))
    }
}

impl Serialise for Format {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(self.code());
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let code = r.u32("format")?;
        Format::from_code(code).ok_or_else(|| r.corrupt(format!("unknown format {code}")))
    }
}

impl Serialise for Usage {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(match self {
            Usage::Default => 0,
            Usage::Immutable => 1,
            Usage::Dynamic => 2,
            Usage::Staging => 3,
        });
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        match r.u8("usage")? {
            0 => Ok(Usage::Default),
            1 => Ok(Usage::Immutable),
            2 => Ok(Usage::Dynamic),
            3 => Ok(Usage::Staging),
            other => Err(r.corrupt(format!("unknown usage {other}"))),
        }
    }
}

impl Serialise for BindFlags {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(self.bits());
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        Ok(BindFlags::from_bits(r.u32("bind flags")?))
    }
}

impl Serialise for ClearFlags {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(self.bits());
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        Ok(ClearFlags::from_bits(r.u8("clear flags")?))
    }
}

impl Serialise for TextureDesc {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(match self.dimension {
            TextureDimension::D1 => 1,
            TextureDimension::D2 => 2,
            TextureDimension::D3 => 3,
        });
        out.put_u32_le(self.width);
        out.put_u32_le(self.height);
        out.put_u32_le(self.depth);
        out.put_u32_le(self.array_size);
        out.put_u32_le(self.mip_levels);
        self.format.serialise(out);
        out.put_u32_le(self.sample_count);
        self.usage.serialise(out);
        self.bind_flags.serialise(out);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let dimension = match r.u8("texture dimension")? {
            1 => TextureDimension::D1,
            2 => TextureDimension::D2,
            3 => TextureDimension::D3,
            other => return Err(r.corrupt(format!("unknown texture dimension {other}"))),
        };
        Ok(TextureDesc {
            dimension,
            width: r.u32("width")?,
            height: r.u32("height")?,
            depth: r.u32("depth")?,
            array_size: r.u32("array size")?,
            mip_levels: r.u32("mip levels")?,
            format: r.read()?,
            sample_count: r.u32("sample count")?,
            usage: r.read()?,
            bind_flags: r.read()?,
        })
    }
}

impl Serialise for BufferDesc {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u32_le(self.byte_width);
        self.usage.serialise(out);
        self.bind_flags.serialise(out);
        out.put_u32_le(self.structure_stride);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        Ok(BufferDesc {
            byte_width: r.u32("byte width")?,
            usage: r.read()?,
            bind_flags: r.read()?,
            structure_stride: r.u32("structure stride")?,
        })
    }
}

impl Serialise for ViewDesc {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(match self.kind {
            ViewKind::RenderTarget => 0,
            ViewKind::DepthStencil => 1,
            ViewKind::ShaderResource => 2,
            ViewKind::UnorderedAccess => 3,
        });
        self.format.serialise(out);
        out.put_u32_le(self.plane);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let kind = match r.u8("view kind")? {
            0 => ViewKind::RenderTarget,
            1 => ViewKind::DepthStencil,
            2 => ViewKind::ShaderResource,
            3 => ViewKind::UnorderedAccess,
            other => return Err(r.corrupt(format!("unknown view kind {other}"))),
        };
        Ok(ViewDesc {
            kind,
            format: r.read()?,
            plane: r.u32("plane")?,
        })
    }
}

impl Serialise for QueryKind {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(match self {
            QueryKind::Event => 0,
            QueryKind::Occlusion => 1,
            QueryKind::Timestamp => 2,
            QueryKind::TimestampDisjoint => 3,
        });
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        match r.u8("query kind")? {
            0 => Ok(QueryKind::Event),
            1 => Ok(QueryKind::Occlusion),
            2 => Ok(QueryKind::Timestamp),
            3 => Ok(QueryKind::TimestampDisjoint),
            other => Err(r.corrupt(format!("unknown query kind {other}"))),
        }
    }
}

impl Serialise for DeviceCaps {
    fn serialise(&self, out: &mut BytesMut) {
        out.put_u8(self.interface_version.code());
        self.thread_safe.serialise(out);
        out.put_u32_le(self.max_sample_count);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let code = r.u8("interface version")?;
        let interface_version = InterfaceVersion::from_code(code)
            .ok_or_else(|| r.corrupt(format!("unknown interface version {code}")))?;
        Ok(DeviceCaps {
            interface_version,
            thread_safe: r.read()?,
            max_sample_count: r.u32("max sample count")?,
        })
    }
}

impl Serialise for Triangle {
    fn serialise(&self, out: &mut BytesMut) {
        for [x, y] in self.vertices {
            out.put_f32_le(x);
            out.put_f32_le(y);
        }
        out.put_f32_le(self.depth);
        self.color.serialise(out);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        let mut vertices = [[0.0f32; 2]; 3];
        for v in &mut vertices {
            *v = [r.f32("vertex x")?, r.f32("vertex y")?];
        }
        Ok(Triangle {
            vertices,
            depth: r.f32("depth")?,
            color: r.read()?,
        })
    }
}

impl Serialise for DispatchArgs {
    fn serialise(&self, out: &mut BytesMut) {
        for g in self.groups {
            out.put_u32_le(g);
        }
        out.put_u32_le(self.threads_per_group);
        out.put_u32_le(self.value);
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        Ok(DispatchArgs {
            groups: [r.u32("groups x")?, r.u32("groups y")?, r.u32("groups z")?],
            threads_per_group: r.u32("threads per group")?,
            value: r.u32("dispatch value")?,
        })
    }
}

impl Serialise for ClearValue {
    fn serialise(&self, out: &mut BytesMut) {
        match self {
            ClearValue::Color(color) => {
                out.put_u8(0);
                color.serialise(out);
            }
            ClearValue::DepthStencil { depth, stencil } => {
                out.put_u8(1);
                out.put_f32_le(*depth);
                out.put_u8(*stencil);
            }
            ClearValue::Zeroed => out.put_u8(2),
        }
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        match r.u8("clear value")? {
            0 => Ok(ClearValue::Color(r.read()?)),
            1 => Ok(ClearValue::DepthStencil {
                depth: r.f32("clear depth")?,
                stencil: r.u8("clear stencil")?,
            }),
            2 => Ok(ClearValue::Zeroed),
            other => Err(r.corrupt(format!("unknown clear value tag {other}"))),
        }
    }
}

impl Serialise for InitialContents {
    fn serialise(&self, out: &mut BytesMut) {
        match self {
            InitialContents::Copy(data) => {
                out.put_u8(0);
                data.serialise(out);
            }
            InitialContents::Clear(value) => {
                out.put_u8(1);
                value.serialise(out);
            }
            InitialContents::NoneNeeded => out.put_u8(2),
        }
    }
    fn deserialise(r: &mut Reader) -> LogResult<Self> {
        match r.u8("initial contents")? {
            0 => Ok(InitialContents::Copy(r.read()?)),
            1 => Ok(InitialContents::Clear(r.read()?)),
            2 => Ok(InitialContents::NoneNeeded),
            other => Err(r.corrupt(format!("unknown initial contents tag {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_field_is_an_error() {
        let mut r = Reader::new(Bytes::from_static(&[1, 2]), 7);
        match r.u32("width") {
            Err(LogError::Truncated {
                what,
                needed,
                remaining,
            }) => {
                assert_eq!(what, "width");
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_vec_count_rejected() {
        let mut out = BytesMut::new();
        out.put_u32_le(1_000_000);
        let mut r = Reader::new(out.freeze(), 3);
        assert!(matches!(
            r.read::<Vec<ResourceId>>(),
            Err(LogError::Corrupt { event_id: 3, .. })
        ));
    }

    #[test]
    fn test_texture_desc_encoding_is_stable() {
        let desc = TextureDesc::new_2d(16, 8, Format::R8G8B8A8Unorm);
        let mut out = BytesMut::new();
        desc.serialise(&mut out);
        // tag + 5 dims + format + samples + usage + bind flags
        assert_eq!(out.len(), 1 + 5 * 4 + 4 + 4 + 1 + 4);
        let mut r = Reader::new(out.freeze(), 0);
        assert_eq!(r.read::<TextureDesc>().unwrap(), desc);
        r.finish().unwrap();
    }

    #[test]
    fn test_bad_bool_is_corrupt() {
        let mut r = Reader::new(Bytes::from_static(&[5]), 1);
        assert!(matches!(r.read::<bool>(), Err(LogError::Corrupt { .. })));
    }
}
