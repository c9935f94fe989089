//! Versioned binary chunk log for gpucap captures.
//!
//! A log is a header (magic, format version, capability flags) followed by an
//! ordered stream of chunks. Each chunk carries a call-type code, the event id
//! assigned at capture, the issuing context and a little-endian payload that
//! decodes into a [`Call`].

mod call;
mod error;
mod log;
pub mod serialise;

pub use call::{Call, ChunkType};
pub use error::LogError;
pub use log::{Chunk, ChunkLog, ChunkWriter, LogFlags, LogHeader};

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Magic bytes at the start of every log.
pub const LOG_MAGIC: [u8; 4] = *b"GCAP";

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 0x0B;

/// First version whose chunk framing carries the issuing context id.
pub const FIRST_CONTEXT_ID_VERSION: u32 = 0x0A;

/// First version whose header carries capability flags.
pub const FIRST_HEADER_FLAGS_VERSION: u32 = 0x0B;

/// Versions this build can read.
pub const SUPPORTED_VERSIONS: [u32; 3] = [0x09, 0x0A, 0x0B];
