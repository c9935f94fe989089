//! Shared vocabulary and typed controller messages for gpucap.
//!
//! This crate defines the identifiers, resource descriptions and replay state
//! used by every other crate, plus the messages exchanged between a client and
//! the replay controller.

mod commands;
mod events;
mod format;
mod state;
mod types;

pub use commands::ReplayCommand;
pub use events::ReplayEvent;
pub use format::{CompType, Format};
pub use state::{ReplayMode, ReplayState};
pub use types::{
    ActionKind, BindFlags, BufferDesc, CaptureOptions, ClearFlags, ClearValue, CounterDescription,
    CounterResult, CounterUnit, DebugViewInfo, DebugViewType, DeviceCaps, DispatchArgs,
    DrawcallDescription, EventId, GpuCounter, InitialContents, InterfaceVersion, MapMode,
    QueryData, QueryKind, ReplayAnomaly, ReplayConfig, ResourceDesc, ResourceId, ResourceKind,
    SubresourceLayout, TextureDesc, TextureDimension, Triangle, Usage, ViewDesc, ViewKind,
};

use crossbeam_channel::{Receiver, Sender};

/// Requests a client may queue before the replay controller picks them up.
/// A full queue blocks the client rather than dropping work.
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Replies and state transitions buffered for the client. State changes are
/// posted without blocking and dropped when this fills, and one range replay
/// can report several of them.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pair used by a client to drive the replay controller: the client keeps the
/// sender and hands the receiver to `create_controller`.
pub fn command_channel() -> (Sender<ReplayCommand>, Receiver<ReplayCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Pair the replay controller answers on: the controller owns the sender and
/// the client waits on the receiver for the event answering each command.
pub fn event_channel() -> (Sender<ReplayEvent>, Receiver<ReplayEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
