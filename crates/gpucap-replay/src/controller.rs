//! Command loop that owns a replay session.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use gpucap_driver::DriverDevice;
use gpucap_ipc::{
    CompType, EventId, GpuCounter, ReplayCommand, ReplayConfig, ReplayEvent, ReplayMode,
    ReplayState, ResourceId,
};

use crate::counters::CounterRegistry;
use crate::session::ReplaySession;
use crate::{ReplayError, ReplayResult};

/// Produces the device a newly opened capture is replayed on.
pub type DeviceFactory = Box<dyn Fn() -> ReplayResult<Arc<dyn DriverDevice>> + Send>;

/// Serves [`ReplayCommand`]s and answers with [`ReplayEvent`]s.
pub struct ReplayController {
    command_rx: Receiver<ReplayCommand>,
    event_tx: Sender<ReplayEvent>,
    config: ReplayConfig,
    factory: DeviceFactory,
    registry: CounterRegistry,
    session: Option<ReplaySession>,
    state: Arc<RwLock<ReplayState>>,
}

impl ReplayController {
    pub fn new(
        command_rx: Receiver<ReplayCommand>,
        event_tx: Sender<ReplayEvent>,
        config: ReplayConfig,
        factory: DeviceFactory,
    ) -> Self {
        Self {
            command_rx,
            event_tx,
            config,
            factory,
            registry: CounterRegistry::new(),
            session: None,
            state: Arc::new(RwLock::new(ReplayState::Idle)),
        }
    }

    /// Shared view of the open session's state, updated on every
    /// transition.
    pub fn state(&self) -> Arc<RwLock<ReplayState>> {
        Arc::clone(&self.state)
    }

    /// Counter sources beyond the built-in GPU duration.
    pub fn registry_mut(&mut self) -> &mut CounterRegistry {
        &mut self.registry
    }

    /// Run the controller (blocking).
    #[instrument(name = "controller_run", skip(self))]
    pub fn run(&mut self) {
        info!("Replay controller starting");
        self.send_event(ReplayEvent::Ready);

        loop {
            match self.command_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    break;
                }
            }
        }

        self.session = None;
        info!("Replay controller stopped");
    }

    /// Runs the controller on its own thread.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("gpucap-replay".into())
            .spawn(move || self.run())
    }

    /// Handle a command. Returns false if the controller should stop.
    fn handle_command(&mut self, command: ReplayCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            ReplayCommand::OpenCapture { path } => self.open_capture(&path),
            ReplayCommand::ReplayRange { start, end, mode } => self.replay_range(start, end, mode),
            ReplayCommand::FetchCounters {
                counters,
                min_event,
                max_event,
            } => self.fetch_counters(&counters, min_event, max_event),
            ReplayCommand::EnumerateCounters => {
                self.send_event(ReplayEvent::CounterList(self.registry.enumerate()));
            }
            ReplayCommand::DescribeCounter(counter) => match self.registry.describe(counter) {
                Ok(desc) => self.send_event(ReplayEvent::CounterDescription(desc)),
                Err(e) => self.send_error(&e),
            },
            ReplayCommand::GetDebugView {
                resource,
                comp_type,
                raw,
            } => self.debug_view(resource, comp_type, raw),
            ReplayCommand::GetDrawcalls => match &self.session {
                Some(session) => {
                    self.send_event(ReplayEvent::Drawcalls(session.drawcalls().to_vec()));
                }
                None => self.send_error(&ReplayError::NoCapture),
            },
            ReplayCommand::GetState => self.send_state(),
            ReplayCommand::Shutdown => {
                self.session = None;
                self.send_event(ReplayEvent::Shutdown);
                return false;
            }
        }

        true
    }

    /// Opens a capture, replacing any open one.
    #[instrument(name = "open_capture", skip(self))]
    fn open_capture(&mut self, path: &Path) {
        if let Some(previous) = self.session.take() {
            debug!(chunks = previous.log().len(), "Closing previous capture");
            *self.state.write() = ReplayState::Idle;
        }

        let opened = (self.factory)()
            .and_then(|device| ReplaySession::open_file(device, path, self.config.clone()));
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                error!(path = %path.display(), "Failed to open capture: {}", e);
                // Nothing is open until another capture loads.
                self.send_event(ReplayEvent::Error {
                    recoverable: false,
                    message: e.to_string(),
                });
                return;
            }
        };

        for anomaly in session.open_anomalies() {
            warn!(%anomaly, "Capture opened with anomaly");
        }

        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        session.set_state_observer(Box::new(move |previous, current| {
            *state.write() = current.clone();
            let event = ReplayEvent::StateChanged {
                previous: Box::new(previous.clone()),
                current: Box::new(current.clone()),
            };
            if let Err(e) = event_tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }));

        let log = session.log();
        let opened = ReplayEvent::CaptureOpened {
            version: log.version(),
            chunk_count: log.len(),
            frame_first: session.frame().first,
            frame_last: session.frame().last,
            last_event: log.last_event().unwrap_or_default(),
        };
        info!(path = %path.display(), chunks = log.len(), "Capture opened");
        self.session = Some(session);
        self.send_event(opened);
    }

    fn replay_range(&mut self, start: EventId, end: EventId, mode: ReplayMode) {
        let result = self.with_session(|session| {
            session.reset_state();
            session.replay_range(start, end, mode)
        });
        match result {
            Ok(anomalies) => self.send_event(ReplayEvent::RangeReplayed { anomalies }),
            Err(e) => self.send_error(&e),
        }
    }

    fn fetch_counters(&mut self, counters: &[GpuCounter], min_event: EventId, max_event: EventId) {
        let Some(session) = self.session.as_mut() else {
            self.send_error(&ReplayError::NoCapture);
            return;
        };
        session.reset_state();
        match session.fetch_counters(&mut self.registry, counters, min_event, max_event) {
            Ok(report) => self.send_event(ReplayEvent::Counters {
                results: report.results,
                anomalies: report.anomalies,
            }),
            Err(e) => self.send_error(&e),
        }
    }

    fn debug_view(&mut self, resource: ResourceId, comp_type: CompType, raw: bool) {
        match self.with_session(|session| session.debug_view(resource, comp_type, raw)) {
            Ok(view) => self.send_event(ReplayEvent::DebugView(view.info)),
            Err(e) => self.send_error(&e),
        }
    }

    fn with_session<T>(
        &mut self,
        f: impl FnOnce(&mut ReplaySession) -> ReplayResult<T>,
    ) -> ReplayResult<T> {
        self.session.as_mut().ok_or(ReplayError::NoCapture).and_then(f)
    }

    fn send_state(&self) {
        let state = self.state.read().clone();
        self.send_event(ReplayEvent::StateChanged {
            previous: Box::new(state.clone()),
            current: Box::new(state),
        });
    }

    fn send_error(&self, e: &ReplayError) {
        self.send_event(ReplayEvent::Error {
            recoverable: true,
            message: e.to_string(),
        });
    }

    fn send_event(&self, event: ReplayEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::SoftDevice;

    fn controller() -> (ReplayController, Receiver<ReplayEvent>) {
        let (_command_tx, command_rx) = gpucap_ipc::command_channel();
        let (event_tx, event_rx) = gpucap_ipc::event_channel();
        let factory: DeviceFactory = Box::new(|| -> ReplayResult<Arc<dyn DriverDevice>> {
            Ok(Arc::new(SoftDevice::default()))
        });
        let controller = ReplayController::new(command_rx, event_tx, ReplayConfig::default(), factory);
        (controller, event_rx)
    }

    #[test]
    fn test_commands_without_capture() {
        let (mut controller, events) = controller();
        assert!(controller.handle_command(ReplayCommand::GetDrawcalls));
        assert!(controller.handle_command(ReplayCommand::ReplayRange {
            start: 1,
            end: 2,
            mode: ReplayMode::Full,
        }));
        for _ in 0..2 {
            match events.try_recv().unwrap() {
                ReplayEvent::Error {
                    recoverable,
                    message,
                } => {
                    assert!(recoverable);
                    assert_eq!(message, ReplayError::NoCapture.to_string());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_missing_file_reports_error() {
        let (mut controller, events) = controller();
        controller.handle_command(ReplayCommand::OpenCapture {
            path: "/nonexistent/frame.gcap".into(),
        });
        assert!(matches!(
            events.try_recv().unwrap(),
            ReplayEvent::Error {
                recoverable: false,
                ..
            }
        ));
        assert!(controller.session.is_none());
    }

    #[test]
    fn test_state_and_shutdown() {
        let (mut controller, events) = controller();
        controller.handle_command(ReplayCommand::GetState);
        match events.try_recv().unwrap() {
            ReplayEvent::StateChanged { current, .. } => assert!(current.is_idle()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!controller.handle_command(ReplayCommand::Shutdown));
        assert!(matches!(events.try_recv().unwrap(), ReplayEvent::Shutdown));
    }
}
