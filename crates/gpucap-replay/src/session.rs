//! The replay engine.
//!
//! A session owns one opened log and the native objects recreated from it.
//! Every object the log creates, in the setup section or inside the frame, is
//! made once at open under its logged id. A range replay then only has to put
//! resource contents and output bindings back to what they were at the range
//! start before walking the range's chunks on the immediate context.
//!
//! Command lists are not rebuilt: their recorded children follow the submit
//! chunk in the log and run inline, with the bindings scoping a real
//! submission would have.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, trace, warn};

use gpucap_capture::{
    clear_contents, read_contents, write_contents, BindingState, CaptureError, CaptureResult,
    CommandListTracker, ResourceManager, UsageIndex,
};
use gpucap_driver::{DriverContext, DriverDevice, DriverError, NativeHandle};
use gpucap_ipc::{
    ClearValue, CompType, DeviceCaps, DrawcallDescription, EventId, ReplayAnomaly, ReplayConfig,
    ReplayMode, ReplayState, ResourceDesc, ResourceId, Usage,
};
use gpucap_log::{Call, Chunk, ChunkLog, ChunkType};

use crate::debug_view::{DebugView, DebugViewCache};
use crate::drawcalls::build_drawcalls;
use crate::{ReplayError, ReplayResult};

/// Called with the previous and the new state on every transition.
pub type StateObserver = Box<dyn FnMut(&ReplayState, &ReplayState) + Send>;

/// Where the captured frame sits in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBounds {
    /// The begin-capture marker.
    pub begin: EventId,
    /// First frame event.
    pub first: EventId,
    /// Last frame event. Below `first` when the frame is empty.
    pub last: EventId,
}

impl FrameBounds {
    pub fn contains(&self, event_id: EventId) -> bool {
        event_id >= self.first && event_id <= self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }
}

/// Bindings as they stood at a prepared range start.
#[derive(Debug, Clone)]
struct SavedBindings {
    start: EventId,
    bindings: BindingState,
    lists: CommandListTracker,
    /// Highest event executed since the bindings were saved.
    reached: EventId,
}

/// Why one chunk could not be applied.
enum ChunkFailure {
    /// An id in the chunk does not resolve. Aborts the range.
    Resolution {
        resource: ResourceId,
        source: CaptureError,
    },
    Corrupt(String),
    /// The driver refused the call. The range goes on.
    Driver(DriverError),
}

impl From<DriverError> for ChunkFailure {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

pub struct ReplaySession {
    device: Arc<dyn DriverDevice>,
    context: Arc<dyn DriverContext>,
    log: ChunkLog,
    usage: UsageIndex,
    resources: Arc<ResourceManager>,
    drawcalls: Vec<DrawcallDescription>,
    frame: FrameBounds,
    captured_caps: DeviceCaps,
    config: ReplayConfig,
    state: ReplayState,
    observer: Option<StateObserver>,
    /// Last event whose effects the device holds.
    cursor: Option<EventId>,
    /// False once the device holds only part of the state at `cursor`, as
    /// after a faulted range.
    consistent: bool,
    bindings: BindingState,
    lists: CommandListTracker,
    saved: Option<SavedBindings>,
    open_anomalies: Vec<ReplayAnomaly>,
    debug_views: DebugViewCache,
}

impl ReplaySession {
    /// Reads a log from disk and opens it.
    pub fn open_file(
        device: Arc<dyn DriverDevice>,
        path: &Path,
        config: ReplayConfig,
    ) -> ReplayResult<Self> {
        let log = ChunkLog::open(path)?;
        Self::open(device, log, config)
    }

    /// Recreates every object of `log` on `device` and rewinds to the start
    /// of the captured frame.
    #[instrument(name = "replay_open", skip_all, fields(chunks = log.len(), version = log.version()))]
    pub fn open(
        device: Arc<dyn DriverDevice>,
        log: ChunkLog,
        config: ReplayConfig,
    ) -> ReplayResult<Self> {
        let frame = find_frame(&log)?;
        let usage = UsageIndex::build(&log)?;
        let drawcalls = build_drawcalls(&log, frame.first, frame.last)?;
        let context = device.immediate_context();
        let debug_views = DebugViewCache::new(Arc::clone(&device), config.debug_view_capacity);

        let mut session = Self {
            captured_caps: device.caps(),
            device,
            context,
            log,
            usage,
            resources: Arc::new(ResourceManager::new()),
            drawcalls,
            frame,
            config,
            state: ReplayState::Idle,
            observer: None,
            cursor: None,
            consistent: false,
            bindings: BindingState::default(),
            lists: CommandListTracker::new(),
            saved: None,
            open_anomalies: Vec::new(),
            debug_views,
        };
        session.create_objects()?;
        let restored = session.reset_to_frame_start();
        session.open_anomalies.extend(restored);

        info!(
            driver = session.device.name(),
            objects = session.resources.live_count(),
            frame_first = frame.first,
            frame_last = frame.last,
            anomalies = session.open_anomalies.len(),
            "Capture opened"
        );
        Ok(session)
    }

    fn create_objects(&mut self) -> ReplayResult<()> {
        let device_version = self.device.caps().interface_version;
        let mut anomalies = Vec::new();
        let mut captured_caps = None;

        for chunk in self.log.chunks() {
            let call = chunk.call().map_err(|e| ReplayError::Corrupt {
                event_id: chunk.event_id,
                reason: e.to_string(),
            })?;
            if let Call::DeviceInit { caps } = &call {
                if caps.interface_version > device_version {
                    warn!(
                        captured = ?caps.interface_version,
                        available = ?device_version,
                        "Replay device offers an older interface than the capture used"
                    );
                    anomalies.push(ReplayAnomaly::new(
                        chunk.event_id,
                        format!(
                            "captured on interface {:?}, replaying on {:?}",
                            caps.interface_version, device_version
                        ),
                    ));
                }
                captured_caps = Some(*caps);
                continue;
            }
            let in_setup = chunk.event_id < self.frame.begin;
            if let Err(e) = self.create_object(&call, in_setup) {
                warn!(
                    event_id = chunk.event_id,
                    chunk = chunk.chunk_type.name(),
                    error = %e,
                    "Failed to recreate object"
                );
                anomalies.push(ReplayAnomaly::new(
                    chunk.event_id,
                    format!("{} failed: {e}", chunk.chunk_type.name()),
                ));
            }
        }

        if let Some(caps) = captured_caps {
            self.captured_caps = caps;
        }
        self.open_anomalies.extend(anomalies);
        Ok(())
    }

    fn create_object(&self, call: &Call, in_setup: bool) -> CaptureResult<()> {
        let device = &*self.device;
        match call {
            Call::CreateTexture {
                id,
                desc,
                initial_data,
            } => {
                let native = device.create_texture(desc, initial_data.as_deref())?;
                self.register_native(*id, ResourceDesc::Texture(*desc), native)?;
            }
            Call::CreateSwapBuffer { id, desc } => {
                let native = device.create_texture(desc, None)?;
                self.register_native(*id, ResourceDesc::Texture(*desc), native)?;
                self.resources.set_default_output(*id);
            }
            Call::CreateBuffer {
                id,
                desc,
                initial_data,
            } => {
                let native = device.create_buffer(desc, initial_data.as_deref())?;
                self.register_native(*id, ResourceDesc::Buffer(*desc), native)?;
            }
            Call::CreateView { id, resource, desc } => {
                let parent = self.resources.resolve(*resource)?;
                let native = device.create_view(parent, desc)?;
                let desc = ResourceDesc::View {
                    resource: *resource,
                    desc: *desc,
                };
                self.register_native(*id, desc, native)?;
            }
            Call::CreateQuery { id, kind } => {
                let native = device.create_query(*kind)?;
                self.register_native(*id, ResourceDesc::Query(*kind), native)?;
            }
            Call::CreateDeferredContext { id } => {
                self.resources
                    .register(*id, ResourceDesc::DeferredContext, None)?;
            }
            Call::SetResourceName { id, name } => {
                self.resources.set_name(*id, name)?;
                if let Ok(native) = self.resources.resolve(*id) {
                    device.set_debug_name(native, name);
                }
            }
            Call::InitialContents { id, contents } if in_setup => {
                self.resources
                    .set_capture_initial_contents(*id, contents.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn register_native(
        &self,
        id: ResourceId,
        desc: ResourceDesc,
        native: NativeHandle,
    ) -> CaptureResult<()> {
        self.resources
            .register(id, desc, Some(native))
            .inspect_err(|_| self.device.release(native))
    }

    /// Rewinds to the start of the frame. The next range may then begin at
    /// the first frame event without further preparation.
    pub fn rewind(&mut self) -> Vec<ReplayAnomaly> {
        self.reset_to_frame_start()
    }

    /// Puts every resource back to its capture-start contents and clears
    /// all bindings.
    fn reset_to_frame_start(&mut self) -> Vec<ReplayAnomaly> {
        self.context.clear_state();
        self.bindings = BindingState::default();
        self.lists.reset();
        self.saved = None;
        let failures = self
            .resources
            .apply_capture_initial_contents(&*self.device, &*self.context);
        self.cursor = Some(self.frame.begin);
        self.consistent = true;
        debug!(failures = failures.len(), "Rewound to frame start");
        failures
            .into_iter()
            .map(|(id, e)| {
                ReplayAnomaly::new(self.frame.begin, format!("restoring {id}: {e}"))
            })
            .collect()
    }

    /// Replays `[start, end]` in `mode`. Driver failures along the way are
    /// returned as anomalies; an id that cannot be resolved faults the range.
    #[instrument(name = "replay_range", skip(self), fields(mode = mode.name()))]
    pub fn replay_range(
        &mut self,
        start: EventId,
        end: EventId,
        mode: ReplayMode,
    ) -> ReplayResult<Vec<ReplayAnomaly>> {
        if !self.state.accepts_range() {
            return Err(ReplayError::Busy);
        }
        let frame = self.frame;
        let (first, last) = mode
            .interval(start, end)
            .filter(|(first, last)| frame.contains(*first) && frame.contains(*last))
            .ok_or(ReplayError::InvalidRange { start, end })?;

        self.transition_to(ReplayState::Preparing {
            start: first,
            end: last,
        });
        let mut anomalies = Vec::new();
        let result = self
            .prepare(first, last, mode, &mut anomalies)
            .and_then(|()| self.execute_range(first, last, &mut anomalies));

        match result {
            Ok(()) => {
                self.cursor = Some(last);
                self.transition_to(ReplayState::Done {
                    last,
                    anomalies: anomalies.len(),
                });
                Ok(anomalies)
            }
            Err(e) => {
                warn!(error = %e, "Range replay faulted");
                self.cursor = None;
                self.consistent = false;
                self.transition_to(ReplayState::Faulted {
                    event_id: e.event_id().unwrap_or(first),
                    resource: e.resource(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn prepare(
        &mut self,
        first: EventId,
        last: EventId,
        mode: ReplayMode,
        anomalies: &mut Vec<ReplayAnomaly>,
    ) -> ReplayResult<()> {
        if self.consistent && self.cursor.map(|c| c + 1) == Some(first) {
            trace!(first, "Continuing from cursor");
            return Ok(());
        }
        if mode == ReplayMode::DrawOnly {
            warn!(
                event_id = first,
                cursor = ?self.cursor,
                "Draw requested without its setup, replaying the setup first"
            );
            anomalies.push(ReplayAnomaly::new(
                first,
                "draw requested without prior setup; setup replayed first",
            ));
        }

        let touched = self.usage.touched_in(first, last);
        if !self.restore_cached(first, &touched) {
            self.restore_by_replay(first, anomalies)?;
        }
        self.apply_touched(first, &touched, anomalies);
        Ok(())
    }

    /// Restores a range start from contents prepared earlier for the same
    /// start. Only worth it when reaching the start means replaying events.
    fn restore_cached(&mut self, first: EventId, touched: &[ResourceId]) -> bool {
        if first == self.frame.first {
            return false;
        }
        let Some(saved) = self.saved.as_ref().filter(|s| s.start == first) else {
            return false;
        };
        // Everything written after the start must be restored by the range.
        let stale = self
            .usage
            .touched_in(first, saved.reached)
            .into_iter()
            .find(|id| !touched.contains(id) && self.resources.desc(*id).is_ok());
        if let Some(id) = stale {
            debug!(
                start = first,
                reached = saved.reached,
                %id,
                "Cached start is stale, replaying instead"
            );
            return false;
        }
        let all_prepared = touched.iter().all(|id| {
            self.resources.is_prepared(*id, first) || self.resources.desc(*id).is_err()
        });
        if !all_prepared {
            return false;
        }

        self.bindings = saved.bindings.clone();
        self.lists = saved.lists.clone();
        self.context.clear_state();
        if self.bind_outputs().is_err() {
            debug!(start = first, "Cached bindings no longer apply, replaying instead");
            self.consistent = false;
            return false;
        }
        self.cursor = Some(first - 1);
        self.consistent = true;
        debug!(start = first, resources = touched.len(), "Restored range start from cache");
        true
    }

    fn restore_by_replay(
        &mut self,
        first: EventId,
        anomalies: &mut Vec<ReplayAnomaly>,
    ) -> ReplayResult<()> {
        let forward = self.consistent && self.cursor.is_some_and(|c| c < first);
        if !forward {
            let restored = self.reset_to_frame_start();
            anomalies.extend(restored);
        }
        let resume = self.cursor.map_or(self.frame.first, |c| c + 1);
        if resume < first {
            debug!(from = resume, to = first - 1, "Fast-forwarding to range start");
            self.execute_span(resume, first - 1, anomalies)?;
        }
        self.cursor = Some(first - 1);
        self.saved = Some(SavedBindings {
            start: first,
            bindings: self.bindings.clone(),
            lists: self.lists.clone(),
            reached: first - 1,
        });
        Ok(())
    }

    /// Applies initial contents to every resource the range uses.
    fn apply_touched(
        &mut self,
        first: EventId,
        touched: &[ResourceId],
        anomalies: &mut Vec<ReplayAnomaly>,
    ) {
        self.resources.begin_range(first);
        let context = Arc::clone(&self.context);
        for &id in touched {
            // Ids that never resolved fault when their chunk runs.
            if self.resources.desc(id).is_err() {
                continue;
            }
            let applied = self
                .resources
                .prepare_initial_contents(id, first, &self.usage, |native, desc| {
                    read_contents(&*context, native, desc)
                })
                .and_then(|contents| {
                    self.resources
                        .apply_initial_contents(id, &contents, &*self.device, &*context)
                });
            if let Err(e) = applied {
                warn!(%id, start = first, error = %e, "Failed to apply initial contents");
                anomalies.push(ReplayAnomaly::new(
                    first,
                    format!("initial contents of {id}: {e}"),
                ));
            }
        }
    }

    fn execute_range(
        &mut self,
        first: EventId,
        last: EventId,
        anomalies: &mut Vec<ReplayAnomaly>,
    ) -> ReplayResult<()> {
        self.transition_to(ReplayState::Executing {
            cursor: first,
            end: last,
        });
        self.execute_span(first, last, anomalies)
    }

    fn execute_span(
        &mut self,
        first: EventId,
        last: EventId,
        anomalies: &mut Vec<ReplayAnomaly>,
    ) -> ReplayResult<()> {
        let chunks: Vec<Chunk> = self.log.range(first, last).to_vec();
        for chunk in &chunks {
            if let ReplayState::Executing { cursor, .. } = &mut self.state {
                *cursor = chunk.event_id;
            }
            if let Some(saved) = self.saved.as_mut() {
                saved.reached = saved.reached.max(chunk.event_id);
            }
            self.execute_chunk(chunk, anomalies)?;
            self.cursor = Some(chunk.event_id);
        }
        Ok(())
    }

    fn execute_chunk(
        &mut self,
        chunk: &Chunk,
        anomalies: &mut Vec<ReplayAnomaly>,
    ) -> ReplayResult<()> {
        let event_id = chunk.event_id;
        let call = chunk.call().map_err(|e| ReplayError::Corrupt {
            event_id,
            reason: e.to_string(),
        })?;
        let applied = self.apply_call(event_id, &call);
        settle(event_id, chunk.chunk_type, applied, anomalies)?;

        if self.lists.leave(event_id, &mut self.bindings) {
            let rebound = self.bind_outputs();
            settle(event_id, chunk.chunk_type, rebound, anomalies)?;
        }
        Ok(())
    }

    fn apply_call(&mut self, event_id: EventId, call: &Call) -> Result<(), ChunkFailure> {
        let ctx = Arc::clone(&self.context);
        match call {
            Call::CreateTexture {
                id,
                desc,
                initial_data,
            } => self.reset_created(*id, desc.usage, initial_data.as_ref())?,
            Call::CreateBuffer {
                id,
                desc,
                initial_data,
            } => self.reset_created(*id, desc.usage, initial_data.as_ref())?,
            Call::CreateSwapBuffer { id, .. } => self.reset_created(*id, Usage::Default, None)?,
            Call::SetRenderTargets {
                render_targets,
                depth_stencil,
            } => {
                let bindings = BindingState {
                    render_targets: render_targets.clone(),
                    depth_stencil: *depth_stencil,
                    unordered_access: self.bindings.unordered_access.clone(),
                };
                let (rts, dsv) = self.output_natives(&bindings)?;
                ctx.set_render_targets(&rts, dsv)?;
                self.bindings = bindings;
            }
            Call::SetUnorderedAccess { views } => {
                let natives = self.natives(views)?;
                ctx.set_unordered_access(&natives)?;
                self.bindings.unordered_access = views.clone();
            }
            Call::ClearRenderTargetView { view, color } => {
                ctx.clear_render_target(self.native(*view)?, *color)?
            }
            Call::ClearDepthStencilView {
                view,
                flags,
                depth,
                stencil,
            } => ctx.clear_depth_stencil(self.native(*view)?, *flags, *depth, *stencil)?,
            Call::ClearView { view, color } => ctx.clear_view(self.native(*view)?, *color)?,
            Call::DiscardResource { id } => ctx.discard_resource(self.native(*id)?)?,
            Call::Draw { triangles } => ctx.draw(triangles)?,
            Call::Dispatch { args } => ctx.dispatch(args)?,
            Call::CopyResource { dst, src } => {
                ctx.copy_resource(self.native(*dst)?, self.native(*src)?)?
            }
            Call::UpdateSubresource {
                dst,
                subresource,
                data,
            } => ctx.update_subresource(self.native(*dst)?, *subresource, data)?,
            Call::ResolveSubresource { dst, src, format } => {
                ctx.resolve_subresource(self.native(*dst)?, self.native(*src)?, *format)?
            }
            Call::Unmap {
                id,
                subresource,
                data,
            } => ctx.write_subresource(self.native(*id)?, *subresource, data)?,
            Call::BeginQuery { query } => ctx.begin_query(self.native(*query)?)?,
            Call::EndQuery { query } => ctx.end_query(self.native(*query)?)?,
            Call::ExecuteCommandList {
                child_count,
                restore_state,
                ..
            } => {
                let last_child = if *child_count == 0 {
                    None
                } else {
                    let child = self
                        .log
                        .position(event_id)
                        .and_then(|pos| self.log.chunks().get(pos + *child_count as usize))
                        .ok_or_else(|| {
                            ChunkFailure::Corrupt(format!(
                                "command list claims {child_count} children past end of log"
                            ))
                        })?;
                    Some(child.event_id)
                };
                self.lists
                    .enter(event_id, last_child, *restore_state, &mut self.bindings);
                self.bind_outputs()?;
            }
            Call::PushMarker { name } => ctx.push_marker(name),
            Call::PopMarker => ctx.pop_marker(),
            Call::SetMarker { name } => ctx.set_marker(name),
            // Objects were made at open and names applied there; releases
            // are ignored so ids stay resolvable for every range.
            _ => {}
        }
        Ok(())
    }

    /// Re-running a creation chunk puts the resource back to its creation
    /// contents.
    fn reset_created(
        &self,
        id: ResourceId,
        usage: Usage,
        initial_data: Option<&Bytes>,
    ) -> Result<(), ChunkFailure> {
        if usage == Usage::Immutable {
            return Ok(());
        }
        let native = self.native(id)?;
        let desc = self
            .resources
            .desc(id)
            .map_err(|source| ChunkFailure::Resolution {
                resource: id,
                source,
            })?;
        match initial_data {
            Some(data) => write_contents(&*self.context, native, &desc, data)?,
            None => clear_contents(
                &*self.device,
                &*self.context,
                native,
                &desc,
                ClearValue::Zeroed,
            )?,
        }
        Ok(())
    }

    fn native(&self, id: ResourceId) -> Result<NativeHandle, ChunkFailure> {
        self.resources
            .resolve(id)
            .map_err(|source| ChunkFailure::Resolution {
                resource: id,
                source,
            })
    }

    fn natives(&self, ids: &[ResourceId]) -> Result<Vec<NativeHandle>, ChunkFailure> {
        ids.iter()
            .filter(|id| !id.is_null())
            .map(|id| self.native(*id))
            .collect()
    }

    fn output_natives(
        &self,
        bindings: &BindingState,
    ) -> Result<(Vec<NativeHandle>, Option<NativeHandle>), ChunkFailure> {
        let rts = self.natives(&bindings.render_targets)?;
        let dsv = if bindings.depth_stencil.is_null() {
            None
        } else {
            Some(self.native(bindings.depth_stencil)?)
        };
        Ok((rts, dsv))
    }

    /// Makes the native bindings match the tracked ones.
    fn bind_outputs(&self) -> Result<(), ChunkFailure> {
        let (rts, dsv) = self.output_natives(&self.bindings)?;
        let uavs = self.natives(&self.bindings.unordered_access)?;
        self.context.set_render_targets(&rts, dsv)?;
        self.context.set_unordered_access(&uavs)?;
        Ok(())
    }

    fn transition_to(&mut self, new_state: ReplayState) {
        let previous = std::mem::replace(&mut self.state, new_state);
        debug!(
            previous = %previous.name(),
            current = %self.state.name(),
            "State transition"
        );
        if let Some(observer) = self.observer.as_mut() {
            observer(&previous, &self.state);
        }
    }

    /// Registers a callback for state transitions.
    pub fn set_state_observer(&mut self, observer: StateObserver) {
        self.observer = Some(observer);
    }

    /// Returns to `Idle` after a finished or faulted range.
    pub fn reset_state(&mut self) {
        if self.state.accepts_range() && !self.state.is_idle() {
            self.transition_to(ReplayState::Idle);
        }
    }

    /// Returns a normalized view of a texture or buffer, refreshed from its
    /// current contents.
    pub fn debug_view(
        &mut self,
        id: ResourceId,
        comp_type: CompType,
        raw: bool,
    ) -> ReplayResult<DebugView> {
        self.debug_views
            .get_or_create(&self.resources, &*self.context, id, comp_type, raw)
    }

    /// Reads the current contents of a texture or buffer.
    pub fn read_resource(&self, id: ResourceId) -> ReplayResult<Bytes> {
        let desc = self.resources.desc(id)?;
        let native = self.resources.resolve(id)?;
        Ok(read_contents(&*self.context, native, &desc)?)
    }

    /// The presentable back buffer, if the log created one.
    pub fn default_output(&self) -> Option<ResourceId> {
        self.resources
            .live_ids()
            .into_iter()
            .find(|id| self.resources.is_default_output(*id))
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn cursor(&self) -> Option<EventId> {
        self.cursor
    }

    pub fn frame(&self) -> FrameBounds {
        self.frame
    }

    pub fn log(&self) -> &ChunkLog {
        &self.log
    }

    pub fn usage(&self) -> &UsageIndex {
        &self.usage
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn drawcalls(&self) -> &[DrawcallDescription] {
        &self.drawcalls
    }

    pub fn device(&self) -> &Arc<dyn DriverDevice> {
        &self.device
    }

    pub fn context(&self) -> &Arc<dyn DriverContext> {
        &self.context
    }

    /// Capabilities of the device the log was captured on.
    pub fn captured_caps(&self) -> DeviceCaps {
        self.captured_caps
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Problems found while opening the log.
    pub fn open_anomalies(&self) -> &[ReplayAnomaly] {
        &self.open_anomalies
    }

    pub fn debug_views(&self) -> &DebugViewCache {
        &self.debug_views
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        self.debug_views.clear();
        // Views go before the resources they look at.
        let mut ids = self.resources.live_ids();
        ids.sort_by_key(|id| {
            !matches!(self.resources.desc(*id), Ok(ResourceDesc::View { .. }))
        });
        for id in ids {
            if let Ok(Some(native)) = self.resources.release_resource(id) {
                self.device.release(native);
            }
        }
        debug!("Replay session closed");
    }
}

/// Turns a chunk outcome into an anomaly or an abort.
fn settle(
    event_id: EventId,
    chunk_type: ChunkType,
    outcome: Result<(), ChunkFailure>,
    anomalies: &mut Vec<ReplayAnomaly>,
) -> ReplayResult<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(ChunkFailure::Driver(e)) => {
            warn!(event_id, chunk = chunk_type.name(), error = %e, "Chunk failed during replay");
            anomalies.push(ReplayAnomaly::new(
                event_id,
                format!("{} failed: {e}", chunk_type.name()),
            ));
            Ok(())
        }
        Err(ChunkFailure::Resolution { resource, source }) => Err(ReplayError::Resolution {
            event_id,
            resource,
            message: source.to_string(),
        }),
        Err(ChunkFailure::Corrupt(reason)) => Err(ReplayError::Corrupt { event_id, reason }),
    }
}

fn find_frame(log: &ChunkLog) -> ReplayResult<FrameBounds> {
    let chunks = log.chunks();
    let begin = chunks
        .iter()
        .position(|c| c.chunk_type == ChunkType::BeginCapture)
        .ok_or(ReplayError::NoFrame)?;
    let begin_event = chunks[begin].event_id;
    let last = match chunks[begin + 1..]
        .iter()
        .find(|c| c.chunk_type == ChunkType::EndCapture)
    {
        Some(end) => end.event_id.saturating_sub(1),
        None => log.last_event().unwrap_or(begin_event),
    };
    Ok(FrameBounds {
        begin: begin_event,
        first: begin_event + 1,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::SoftDevice;
    use gpucap_ipc::{DeviceCaps, TextureDesc, Format};
    use gpucap_log::ChunkWriter;

    #[test]
    fn test_log_without_frame_is_rejected() {
        let mut w = ChunkWriter::new();
        w.append(
            ResourceId::NULL,
            &Call::DeviceInit {
                caps: DeviceCaps::default(),
            },
        );
        let device: Arc<dyn DriverDevice> = Arc::new(SoftDevice::default());
        let err = ReplaySession::open(device, w.finish(), ReplayConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ReplayError::NoFrame));
    }

    #[test]
    fn test_frame_bounds() {
        let mut w = ChunkWriter::new();
        let ctx = ResourceId::NULL;
        w.append(ctx, &Call::DeviceInit { caps: DeviceCaps::default() });
        let begin = w.append(ctx, &Call::BeginCapture { frame: 0 });
        w.append(ctx, &Call::SetMarker { name: "a".into() });
        let last = w.append(ctx, &Call::SetMarker { name: "b".into() });
        w.append(ctx, &Call::EndCapture);
        let frame = find_frame(&w.finish()).unwrap();
        assert_eq!(frame.begin, begin);
        assert_eq!(frame.first, begin + 1);
        assert_eq!(frame.last, last);
        assert!(!frame.contains(begin));
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_driver_failure_is_an_anomaly() {
        let mut w = ChunkWriter::new();
        let ctx = ResourceId::NULL;
        w.append(
            ctx,
            &Call::CreateTexture {
                id: ResourceId::from_raw(1),
                desc: TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm),
                initial_data: None,
            },
        );
        w.append(
            ctx,
            &Call::CreateTexture {
                id: ResourceId::from_raw(2),
                desc: TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm),
                initial_data: None,
            },
        );
        w.append(ctx, &Call::BeginCapture { frame: 0 });
        // Mismatched sizes, so the driver rejects the copy.
        let copy = w.append(
            ctx,
            &Call::CopyResource {
                dst: ResourceId::from_raw(1),
                src: ResourceId::from_raw(2),
            },
        );
        let last = w.append(ctx, &Call::SetMarker { name: "after".into() });
        w.append(ctx, &Call::EndCapture);

        let device: Arc<dyn DriverDevice> = Arc::new(SoftDevice::default());
        let mut session = ReplaySession::open(device, w.finish(), ReplayConfig::default()).unwrap();
        let anomalies = session.replay_range(copy, last, ReplayMode::Full).unwrap();
        assert!(anomalies.iter().any(|a| a.event_id == copy));
        assert!(session.state().is_done());
    }

    #[test]
    fn test_failed_creation_reported_at_open() {
        let mut w = ChunkWriter::new();
        let ctx = ResourceId::NULL;
        // Zero-sized textures are rejected by the driver.
        w.append(
            ctx,
            &Call::CreateTexture {
                id: ResourceId::from_raw(1),
                desc: TextureDesc::new_2d(0, 4, Format::R8G8B8A8Unorm),
                initial_data: None,
            },
        );
        w.append(ctx, &Call::BeginCapture { frame: 0 });
        w.append(ctx, &Call::EndCapture);
        let device: Arc<dyn DriverDevice> = Arc::new(SoftDevice::default());
        let session = ReplaySession::open(device, w.finish(), ReplayConfig::default()).unwrap();
        assert_eq!(session.open_anomalies().len(), 1);
        assert_eq!(session.open_anomalies()[0].event_id, 0);
        assert!(session.frame().is_empty());
    }
}
