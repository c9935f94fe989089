//! Request/response wrapper over the replay controller's channels.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use gpucap_driver::DriverKind;
use gpucap_ipc::{ReplayCommand, ReplayConfig, ReplayEvent, ReplayState};
use gpucap_replay::create_controller;

/// How long to wait for the controller to answer one command.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Owns a controller thread and talks to it.
pub struct ReplayClient {
    command_tx: Sender<ReplayCommand>,
    event_rx: Receiver<ReplayEvent>,
    controller: Option<JoinHandle<()>>,
    /// Last state reported by the controller.
    pub state: ReplayState,
}

impl ReplayClient {
    pub fn start(config: ReplayConfig, driver: DriverKind) -> Result<Self> {
        let (command_tx, command_rx) = gpucap_ipc::command_channel();
        let (event_tx, event_rx) = gpucap_ipc::event_channel();
        let controller = create_controller(command_rx, event_tx, config, driver)
            .spawn()
            .context("Failed to start replay controller")?;

        let mut client = Self {
            command_tx,
            event_rx,
            controller: Some(controller),
            state: ReplayState::Idle,
        };
        client.wait_for(|event| matches!(event, ReplayEvent::Ready).then_some(()))?;
        Ok(client)
    }

    /// Sends `command` and waits for the event `pick` accepts.
    pub fn request<T>(
        &mut self,
        command: ReplayCommand,
        pick: impl FnMut(ReplayEvent) -> Option<T>,
    ) -> Result<T> {
        debug!(?command, "Sending command");
        self.command_tx
            .send(command)
            .map_err(|e| anyhow!("Failed to send command: {}", e))?;
        self.wait_for(pick)
    }

    fn wait_for<T>(&mut self, mut pick: impl FnMut(ReplayEvent) -> Option<T>) -> Result<T> {
        loop {
            let event = self
                .event_rx
                .recv_timeout(RESPONSE_TIMEOUT)
                .context("Timeout waiting for the replay controller")?;
            match event {
                ReplayEvent::StateChanged { previous, current } => {
                    debug!(state = current.name(), "Replay state");
                    self.state = (*current).clone();
                    if let Some(value) = pick(ReplayEvent::StateChanged { previous, current }) {
                        return Ok(value);
                    }
                }
                ReplayEvent::Error {
                    recoverable,
                    message,
                } => {
                    if !recoverable {
                        warn!("Controller reported an unrecoverable error");
                    }
                    bail!(message);
                }
                ReplayEvent::Shutdown => bail!("Replay controller shut down"),
                other => {
                    if let Some(value) = pick(other) {
                        return Ok(value);
                    }
                }
            }
        }
    }
}

impl Drop for ReplayClient {
    fn drop(&mut self) {
        let _ = self.command_tx.send(ReplayCommand::Shutdown);
        if let Some(handle) = self.controller.take() {
            let _ = handle.join();
        }
    }
}
