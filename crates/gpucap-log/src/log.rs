//! The chunk log container: header, chunk framing, writer and reader.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, instrument};

use gpucap_ipc::{EventId, ResourceId};

use crate::call::{chunk_type_for, Call, ChunkType};
use crate::{
    LogError, LogResult, CURRENT_VERSION, FIRST_CONTEXT_ID_VERSION, FIRST_HEADER_FLAGS_VERSION,
    LOG_MAGIC, SUPPORTED_VERSIONS,
};

/// Capability flags stored in the log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogFlags(u32);

impl LogFlags {
    /// Log contains command lists recorded on deferred contexts.
    pub const DEFERRED_CONTEXTS: LogFlags = LogFlags(0x1);
    /// Log carries initial contents for its resources.
    pub const INITIAL_CONTENTS: LogFlags = LogFlags(0x2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: LogFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LogFlags) {
        self.0 |= other.0;
    }
}

/// Header at the start of every log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u32,
    pub flags: LogFlags,
}

impl Default for LogHeader {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            flags: LogFlags::default(),
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub event_id: EventId,
    pub chunk_type: ChunkType,
    /// Context that issued the call; `ResourceId::NULL` is the immediate
    /// context.
    pub context: ResourceId,
    pub payload: Bytes,
}

impl Chunk {
    /// Decodes the chunk's payload.
    pub fn call(&self) -> LogResult<Call> {
        Call::decode(self.chunk_type, self.payload.clone(), self.event_id)
    }
}

/// Append-only chunk sink used while capturing.
///
/// Event ids are assigned here, in append order, starting from zero.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    flags: LogFlags,
    chunks: Vec<Chunk>,
    next_event: EventId,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call and returns the event id it was given.
    pub fn append(&mut self, context: ResourceId, call: &Call) -> EventId {
        let event_id = self.next_event;
        self.next_event += 1;
        if !context.is_null() {
            self.flags.insert(LogFlags::DEFERRED_CONTEXTS);
        }
        if matches!(call, Call::InitialContents { .. }) {
            self.flags.insert(LogFlags::INITIAL_CONTENTS);
        }
        self.chunks.push(Chunk {
            event_id,
            chunk_type: call.chunk_type(),
            context,
            payload: call.encode(),
        });
        event_id
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Event id the next appended chunk will receive.
    pub fn next_event(&self) -> EventId {
        self.next_event
    }

    /// Closes the writer into an immutable log.
    pub fn finish(self) -> ChunkLog {
        ChunkLog {
            header: LogHeader {
                version: CURRENT_VERSION,
                flags: self.flags,
            },
            chunks: self.chunks,
        }
    }
}

/// An ordered, versioned sequence of chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLog {
    header: LogHeader,
    chunks: Vec<Chunk>,
}

impl ChunkLog {
    pub fn header(&self) -> LogHeader {
        self.header
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Last event id in the log.
    pub fn last_event(&self) -> Option<EventId> {
        self.chunks.last().map(|c| c.event_id)
    }

    /// Index of the chunk with the given event id.
    pub fn position(&self, event_id: EventId) -> Option<usize> {
        self.chunks
            .binary_search_by_key(&event_id, |c| c.event_id)
            .ok()
    }

    /// Chunk with the given event id.
    pub fn find(&self, event_id: EventId) -> Option<&Chunk> {
        self.position(event_id).map(|i| &self.chunks[i])
    }

    /// All chunks with `first <= event_id <= last`.
    pub fn range(&self, first: EventId, last: EventId) -> &[Chunk] {
        let lo = self.chunks.partition_point(|c| c.event_id < first);
        let hi = self.chunks.partition_point(|c| c.event_id <= last);
        if lo >= hi {
            return &[];
        }
        &self.chunks[lo..hi]
    }

    /// Encodes the log at the current version.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        encode_into(&mut out, CURRENT_VERSION, self.header.flags, &self.chunks);
        out.freeze()
    }

    /// Encodes the log at an older supported version, so that captures can be
    /// handed to tools that predate the current framing.
    pub fn encode_version(&self, version: u32) -> LogResult<Bytes> {
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(LogError::UnsupportedVersion(version));
        }
        let mut out = BytesMut::new();
        encode_into(&mut out, version, self.header.flags, &self.chunks);
        Ok(out.freeze())
    }

    /// Decodes a log, rejecting unknown versions before touching any chunk.
    pub fn decode(mut data: Bytes) -> LogResult<ChunkLog> {
        let header = decode_header(&mut data)?;
        let mut chunks = Vec::new();
        let mut previous: Option<EventId> = None;

        while data.has_remaining() {
            let chunk = decode_chunk(&mut data, header.version)?;
            if let Some(previous) = previous {
                if chunk.event_id <= previous {
                    return Err(LogError::OutOfOrder {
                        previous,
                        event_id: chunk.event_id,
                    });
                }
            }
            previous = Some(chunk.event_id);
            chunks.push(chunk);
        }

        debug!(
            version = header.version,
            chunks = chunks.len(),
            "Decoded chunk log"
        );
        Ok(ChunkLog { header, chunks })
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> LogResult<()> {
        writer.write_all(&self.encode())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> LogResult<ChunkLog> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::decode(Bytes::from(data))
    }

    /// Writes the log to a file.
    #[instrument(name = "log_save", skip(self), fields(chunks = self.chunks.len()))]
    pub fn save(&self, path: &Path) -> LogResult<()> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))?;
        info!(path = %path.display(), "Saved capture log");
        Ok(())
    }

    /// Reads a log from a file.
    #[instrument(name = "log_open")]
    pub fn open(path: &Path) -> LogResult<ChunkLog> {
        let file = File::open(path)?;
        let log = Self::read_from(BufReader::new(file))?;
        info!(
            version = format_args!("0x{:02X}", log.version()),
            chunks = log.len(),
            "Opened capture log"
        );
        Ok(log)
    }
}

fn encode_into(out: &mut BytesMut, version: u32, flags: LogFlags, chunks: &[Chunk]) {
    out.put_slice(&LOG_MAGIC);
    out.put_u32_le(version);
    if version >= FIRST_HEADER_FLAGS_VERSION {
        out.put_u32_le(flags.bits());
    }
    for chunk in chunks {
        out.put_u16_le(chunk.chunk_type.code());
        out.put_u16_le(0);
        out.put_u32_le(chunk.event_id);
        if version >= FIRST_CONTEXT_ID_VERSION {
            out.put_u64_le(chunk.context.as_raw());
        }
        out.put_u32_le(chunk.payload.len() as u32);
        out.put_slice(&chunk.payload);
    }
}

fn take(data: &mut Bytes, needed: usize, what: &'static str) -> LogResult<()> {
    if data.remaining() < needed {
        return Err(LogError::Truncated {
            what,
            needed,
            remaining: data.remaining(),
        });
    }
    Ok(())
}

fn decode_header(data: &mut Bytes) -> LogResult<LogHeader> {
    take(data, 8, "header")?;
    let mut magic = [0u8; 4];
    data.copy_to_slice(&mut magic);
    if magic != LOG_MAGIC {
        return Err(LogError::BadMagic(magic));
    }
    let version = data.get_u32_le();
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(LogError::UnsupportedVersion(version));
    }
    let flags = if version >= FIRST_HEADER_FLAGS_VERSION {
        take(data, 4, "header flags")?;
        LogFlags::from_bits(data.get_u32_le())
    } else {
        LogFlags::default()
    };
    Ok(LogHeader { version, flags })
}

fn decode_chunk(data: &mut Bytes, version: u32) -> LogResult<Chunk> {
    take(data, 8, "chunk header")?;
    let code = data.get_u16_le();
    let _flags = data.get_u16_le();
    let event_id = data.get_u32_le();
    let chunk_type = chunk_type_for(code, event_id)?;
    let context = if version >= FIRST_CONTEXT_ID_VERSION {
        take(data, 8, "chunk context")?;
        ResourceId::from_raw(data.get_u64_le())
    } else {
        ResourceId::NULL
    };
    take(data, 4, "chunk length")?;
    let len = data.get_u32_le() as usize;
    take(data, len, "chunk payload")?;
    let payload = data.split_to(len);
    Ok(Chunk {
        event_id,
        chunk_type,
        context,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_log() -> ChunkLog {
        let mut writer = ChunkWriter::new();
        writer.append(ResourceId::NULL, &Call::BeginCapture { frame: 1 });
        writer.append(
            ResourceId::NULL,
            &Call::PushMarker {
                name: "pass".into(),
            },
        );
        writer.append(ResourceId::from_raw(4), &Call::PopMarker);
        writer.append(ResourceId::NULL, &Call::EndCapture);
        writer.finish()
    }

    #[test]
    fn test_writer_assigns_sequential_events() {
        let log = small_log();
        let ids: Vec<_> = log.chunks().iter().map(|c| c.event_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(log.header().flags.contains(LogFlags::DEFERRED_CONTEXTS));
        assert!(!log.header().flags.contains(LogFlags::INITIAL_CONTENTS));
    }

    #[test]
    fn test_find_and_range() {
        let log = small_log();
        assert_eq!(log.find(2).unwrap().chunk_type, ChunkType::PopMarker);
        assert!(log.find(9).is_none());
        assert_eq!(log.range(1, 2).len(), 2);
        assert!(log.range(3, 1).is_empty());
        assert_eq!(log.last_event(), Some(3));
    }

    #[test]
    fn test_decode_current_version() {
        let log = small_log();
        let decoded = ChunkLog::decode(log.encode()).unwrap();
        assert_eq!(decoded, log);
    }

    #[test]
    fn test_reject_unknown_version() {
        let mut data = BytesMut::new();
        data.put_slice(&LOG_MAGIC);
        data.put_u32_le(0x0C);
        data.put_u32_le(0);
        assert!(matches!(
            ChunkLog::decode(data.freeze()),
            Err(LogError::UnsupportedVersion(0x0C))
        ));
    }

    #[test]
    fn test_reject_bad_magic() {
        let data = Bytes::from_static(b"NOPE\x0b\x00\x00\x00");
        assert!(matches!(ChunkLog::decode(data), Err(LogError::BadMagic(_))));
    }

    #[test]
    fn test_version_0a_has_no_header_flags() {
        let log = small_log();
        let data = log.encode_version(0x0A).unwrap();
        assert_eq!(data.len(), log.encode().len() - 4);
        let decoded = ChunkLog::decode(data).unwrap();
        assert_eq!(decoded.version(), 0x0A);
        assert_eq!(decoded.header().flags, LogFlags::default());
        assert_eq!(decoded.chunks(), log.chunks());
    }

    #[test]
    fn test_version_09_drops_context_ids() {
        let log = small_log();
        let decoded = ChunkLog::decode(log.encode_version(0x09).unwrap()).unwrap();
        assert_eq!(decoded.len(), log.len());
        assert!(decoded.chunks().iter().all(|c| c.context.is_null()));
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        let mut data = BytesMut::new();
        data.put_slice(&LOG_MAGIC);
        data.put_u32_le(CURRENT_VERSION);
        data.put_u32_le(0);
        for event in [5u32, 5] {
            data.put_u16_le(ChunkType::PopMarker.code());
            data.put_u16_le(0);
            data.put_u32_le(event);
            data.put_u64_le(0);
            data.put_u32_le(0);
        }
        assert!(matches!(
            ChunkLog::decode(data.freeze()),
            Err(LogError::OutOfOrder {
                previous: 5,
                event_id: 5
            })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut data = small_log().encode().to_vec();
        // The last chunk has an empty payload, so this cuts into its length.
        data.truncate(data.len() - 1);
        assert!(matches!(
            ChunkLog::decode(Bytes::from(data)),
            Err(LogError::Truncated { .. })
        ));
    }
}
