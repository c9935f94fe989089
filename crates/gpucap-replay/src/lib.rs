//! Replay side of gpucap.
//!
//! A [`ReplaySession`] recreates the objects of a captured log on a driver
//! device and replays any event range of the captured frame, restoring the
//! resources the range touches to their state at its start. On top of it
//! sit the per-draw counter pipeline, the debug-view cache used to display
//! arbitrary textures, output windows, and a [`ReplayController`] that
//! serves typed commands from its own thread.

mod controller;
mod counters;
mod debug_view;
mod drawcalls;
mod error;
mod output;
mod session;

pub use controller::{DeviceFactory, ReplayController};
pub use counters::{
    fetch_counters, gpu_duration_description, CounterPipeline, CounterRegistry, CounterReport,
    CounterSource,
};
pub use debug_view::{DebugView, DebugViewCache, DebugViewKey};
pub use drawcalls::{build_drawcalls, find_action, timed_events};
pub use error::ReplayError;
pub use output::{OutputWindow, OUTPUT_DEPTH_FORMAT};
pub use session::{FrameBounds, ReplaySession, StateObserver};

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use gpucap_driver::{create_driver, DriverDevice, DriverKind, SoftConfig};
use gpucap_ipc::{ReplayCommand, ReplayConfig, ReplayEvent};

/// Result type for replay operations.
pub type ReplayResult<T> = Result<T, ReplayError>;

/// Create a replay controller with IPC channels, replaying on a fresh
/// device of `kind` for every opened capture.
pub fn create_controller(
    command_rx: Receiver<ReplayCommand>,
    event_tx: Sender<ReplayEvent>,
    config: ReplayConfig,
    kind: DriverKind,
) -> ReplayController {
    let thread_safe = config.soft_thread_safe;
    let factory: DeviceFactory = Box::new(move || -> ReplayResult<Arc<dyn DriverDevice>> {
        let mut soft = SoftConfig::default();
        soft.caps.thread_safe = thread_safe;
        Ok(create_driver(kind, soft)?)
    });
    ReplayController::new(command_rx, event_tx, config, factory)
}

/// Like [`create_controller`], replaying every capture on `device`.
pub fn create_controller_with_device(
    command_rx: Receiver<ReplayCommand>,
    event_tx: Sender<ReplayEvent>,
    config: ReplayConfig,
    device: Arc<dyn DriverDevice>,
) -> ReplayController {
    ReplayController::new(
        command_rx,
        event_tx,
        config,
        Box::new(move || -> ReplayResult<Arc<dyn DriverDevice>> { Ok(Arc::clone(&device)) }),
    )
}
