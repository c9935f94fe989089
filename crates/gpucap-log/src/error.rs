//! Error types for the chunk log.

use thiserror::Error;

use gpucap_ipc::EventId;

/// Errors that can occur while encoding or decoding a chunk log.
#[derive(Debug, Error)]
pub enum LogError {
    /// File does not start with the log magic.
    #[error("Not a capture log (bad magic {0:02x?})")]
    BadMagic([u8; 4]),

    /// Header names a version this reader does not understand.
    #[error("Unsupported log version 0x{0:02X}")]
    UnsupportedVersion(u32),

    /// Data ended in the middle of a field.
    #[error("Truncated log while reading {what}: need {needed} bytes, {remaining} left")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// Chunk type code is not known.
    #[error("Unknown chunk type {code} at event {event_id}")]
    UnknownChunkType { code: u16, event_id: EventId },

    /// Chunk payload does not decode.
    #[error("Corrupt chunk at event {event_id}: {reason}")]
    Corrupt { event_id: EventId, reason: String },

    /// Event ids are not strictly increasing.
    #[error("Event {event_id} follows event {previous}")]
    OutOfOrder { previous: EventId, event_id: EventId },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
