//! Per-draw GPU counters.
//!
//! GPU duration is measured by replaying the frame with a timestamp pair
//! around every timed action in the requested window. Actions outside the
//! window are replayed in full without timers so that later actions still
//! see the right state. Vendor counters come from pluggable sources.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use gpucap_driver::{DriverContext, DriverDevice, NativeHandle};
use gpucap_ipc::{
    CounterDescription, CounterResult, CounterUnit, EventId, GpuCounter, QueryData, QueryKind,
    ReplayAnomaly, ReplayConfig, ReplayMode,
};

use crate::drawcalls::timed_events;
use crate::session::ReplaySession;
use crate::{ReplayError, ReplayResult};

/// An additional provider of counters, such as a vendor performance library.
pub trait CounterSource: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn counters(&self) -> Vec<GpuCounter>;

    fn describe(&self, counter: GpuCounter) -> Option<CounterDescription>;

    /// One value per event, in the order given.
    fn fetch(&mut self, counter: GpuCounter, events: &[EventId]) -> Result<Vec<f64>, String>;
}

/// Description of the built-in duration counter.
pub fn gpu_duration_description() -> CounterDescription {
    CounterDescription {
        counter: GpuCounter::EventGpuDuration,
        name: "GPU Duration".into(),
        description: "Time taken for this event on the GPU, as measured by delta between two \
                      GPU timestamps."
            .into(),
        unit: CounterUnit::Seconds,
        result_width: 8,
    }
}

/// Every counter the replay side can fetch.
#[derive(Default)]
pub struct CounterRegistry {
    sources: Vec<Box<dyn CounterSource>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: Box<dyn CounterSource>) {
        debug!(source = source.name(), counters = source.counters().len(), "Added counter source");
        self.sources.push(source);
    }

    /// Built-in counters first, then each source's in registration order.
    pub fn enumerate(&self) -> Vec<GpuCounter> {
        let mut counters = vec![GpuCounter::EventGpuDuration];
        for source in &self.sources {
            for counter in source.counters() {
                if !counters.contains(&counter) {
                    counters.push(counter);
                }
            }
        }
        counters
    }

    pub fn is_known(&self, counter: GpuCounter) -> bool {
        counter == GpuCounter::EventGpuDuration
            || self.sources.iter().any(|s| s.counters().contains(&counter))
    }

    pub fn describe(&self, counter: GpuCounter) -> ReplayResult<CounterDescription> {
        if counter == GpuCounter::EventGpuDuration {
            return Ok(gpu_duration_description());
        }
        self.sources
            .iter()
            .filter(|s| s.counters().contains(&counter))
            .find_map(|s| s.describe(counter))
            .ok_or(ReplayError::UnknownCounter(counter))
    }

    fn source_for(&mut self, counter: GpuCounter) -> Option<&mut Box<dyn CounterSource>> {
        self.sources
            .iter_mut()
            .find(|s| s.counters().contains(&counter))
    }
}

impl ReplaySession {
    /// Fetches `counters` for every timed action of the frame. See
    /// [`fetch_counters`].
    pub fn fetch_counters(
        &mut self,
        registry: &mut CounterRegistry,
        counters: &[GpuCounter],
        min_event: EventId,
        max_event: EventId,
    ) -> ReplayResult<CounterReport> {
        fetch_counters(self, registry, counters, min_event, max_event)
    }
}

/// Values and problems from one counter fetch.
#[derive(Debug, Clone, Default)]
pub struct CounterReport {
    pub results: Vec<CounterResult>,
    pub anomalies: Vec<ReplayAnomaly>,
    /// Timestamp pairs created by the duration pipeline.
    pub timers_created: usize,
}

/// Fetches `counters` for every timed action of the frame. Actions outside
/// `[min_event, max_event]` report 0.0.
#[instrument(name = "fetch_counters", skip(session, registry), fields(counters = counters.len()))]
pub fn fetch_counters(
    session: &mut ReplaySession,
    registry: &mut CounterRegistry,
    counters: &[GpuCounter],
    min_event: EventId,
    max_event: EventId,
) -> ReplayResult<CounterReport> {
    if let Some(unknown) = counters.iter().find(|c| !registry.is_known(**c)) {
        return Err(ReplayError::UnknownCounter(*unknown));
    }

    let events = timed_events(session.drawcalls());
    let mut report = CounterReport::default();
    for &counter in counters {
        match counter {
            GpuCounter::EventGpuDuration => {
                let mut pipeline = CounterPipeline::new(Arc::clone(session.device()), session.config());
                let durations = pipeline.fetch_durations(session, min_event, max_event)?;
                report.results.extend(durations.results);
                report.anomalies.extend(durations.anomalies);
                report.timers_created += durations.timers_created;
            }
            vendor => {
                let in_window = |e: &EventId| (min_event..=max_event).contains(e);
                let window: Vec<EventId> = events.iter().copied().filter(in_window).collect();
                let Some(source) = registry.source_for(vendor) else {
                    return Err(ReplayError::UnknownCounter(vendor));
                };
                let mut values = match source.fetch(vendor, &window) {
                    Ok(values) => values,
                    Err(message) => {
                        warn!(source = source.name(), %message, "Counter source failed");
                        report.anomalies.push(ReplayAnomaly::new(
                            min_event,
                            format!("{} failed: {message}", source.name()),
                        ));
                        Vec::new()
                    }
                }
                .into_iter();
                for &event_id in &events {
                    let value = if in_window(&event_id) {
                        values.next().unwrap_or(0.0)
                    } else {
                        0.0
                    };
                    report.results.push(CounterResult {
                        event_id,
                        counter: vendor,
                        value,
                    });
                }
            }
        }
    }
    Ok(report)
}

/// A timestamp pair around one action.
#[derive(Debug, Clone, Copy)]
struct GpuTimer {
    before: NativeHandle,
    after: NativeHandle,
}

/// Query objects for one duration fetch. Timers are pooled by position in
/// the action walk and reused by every pass.
pub struct CounterPipeline {
    device: Arc<dyn DriverDevice>,
    timers: Vec<Option<GpuTimer>>,
    disjoint: Option<NativeHandle>,
    session_start: Option<NativeHandle>,
    passes: u32,
    poll_limit: u32,
}

impl CounterPipeline {
    pub fn new(device: Arc<dyn DriverDevice>, config: &ReplayConfig) -> Self {
        Self {
            device,
            timers: Vec::new(),
            disjoint: None,
            session_start: None,
            passes: config.counter_passes.max(1),
            poll_limit: config.query_poll_limit.max(1),
        }
    }

    /// Timestamp pairs created so far.
    pub fn timers_created(&self) -> usize {
        self.timers.iter().flatten().count()
    }

    fn query(device: &dyn DriverDevice, slot: &mut Option<NativeHandle>, kind: QueryKind) -> ReplayResult<NativeHandle> {
        match slot {
            Some(query) => Ok(*query),
            None => {
                let query = device.create_query(kind)?;
                *slot = Some(query);
                Ok(query)
            }
        }
    }

    fn timer(&mut self, index: usize) -> ReplayResult<GpuTimer> {
        if self.timers.len() <= index {
            self.timers.resize(index + 1, None);
        }
        if let Some(timer) = self.timers[index] {
            return Ok(timer);
        }
        let before = self.device.create_query(QueryKind::Timestamp)?;
        let after = match self.device.create_query(QueryKind::Timestamp) {
            Ok(query) => query,
            Err(e) => {
                self.device.release(before);
                return Err(e.into());
            }
        };
        let timer = GpuTimer { before, after };
        self.timers[index] = Some(timer);
        Ok(timer)
    }

    /// Runs the timed passes and converts the last pass's timestamps to
    /// seconds.
    #[instrument(name = "fetch_gpu_durations", skip(self, session))]
    pub fn fetch_durations(
        &mut self,
        session: &mut ReplaySession,
        min_event: EventId,
        max_event: EventId,
    ) -> ReplayResult<CounterReport> {
        let events = timed_events(session.drawcalls());
        let frame = session.frame();
        let context = Arc::clone(session.context());
        let mut anomalies = Vec::new();
        let in_window = |e: EventId| (min_event..=max_event).contains(&e);

        if events.is_empty() {
            return Ok(CounterReport::default());
        }

        let device = Arc::clone(&self.device);
        let disjoint = Self::query(&*device, &mut self.disjoint, QueryKind::TimestampDisjoint)?;
        let session_start = Self::query(&*device, &mut self.session_start, QueryKind::Timestamp)?;

        for pass in 0..self.passes {
            let mut pass_anomalies = session.rewind();
            context.begin_query(disjoint)?;
            context.end_query(session_start)?;

            let mut next = frame.first;
            for (index, &event) in events.iter().enumerate() {
                if in_window(event) {
                    if event > next {
                        pass_anomalies.extend(session.replay_range(
                            next,
                            event,
                            ReplayMode::UpToDrawExclusive,
                        )?);
                    }
                    let timer = self.timer(index)?;
                    context.end_query(timer.before)?;
                    pass_anomalies.extend(session.replay_range(event, event, ReplayMode::DrawOnly)?);
                    context.end_query(timer.after)?;
                } else {
                    pass_anomalies.extend(session.replay_range(next, event, ReplayMode::Full)?);
                }
                next = event + 1;
            }

            context.end_query(disjoint)?;
            debug!(pass, timers = self.timers_created(), "Counter pass finished");
            if pass + 1 == self.passes {
                anomalies = pass_anomalies;
            }
        }

        let frequency = match self.poll(&*context, disjoint)? {
            Some(QueryData::TimestampDisjoint {
                frequency,
                disjoint: false,
            }) if frequency > 0 => Some(frequency),
            None => {
                warn!("Timestamp frequency never became available");
                anomalies.push(ReplayAnomaly::new(
                    frame.first,
                    "timestamp frequency never became available; durations reported as 0",
                ));
                None
            }
            _ => {
                warn!("GPU clock was disjoint during counter passes");
                anomalies.push(ReplayAnomaly::new(
                    frame.first,
                    "GPU timestamps were disjoint; durations reported as 0",
                ));
                None
            }
        };
        if let Some(QueryData::Timestamp(start)) = self.poll(&*context, session_start)? {
            debug!(start_ticks = start, "Counter session resolved");
        }

        let mut results = Vec::with_capacity(events.len());
        for (index, &event_id) in events.iter().enumerate() {
            let timer = self.timers.get(index).copied().flatten();
            let value = match (timer, frequency) {
                (Some(timer), Some(frequency)) => {
                    match (self.poll(&*context, timer.before)?, self.poll(&*context, timer.after)?) {
                        (Some(QueryData::Timestamp(t0)), Some(QueryData::Timestamp(t1))) => {
                            t1.saturating_sub(t0) as f64 / frequency as f64
                        }
                        _ => {
                            anomalies.push(ReplayAnomaly::new(
                                event_id,
                                "timestamps never became available",
                            ));
                            0.0
                        }
                    }
                }
                _ => 0.0,
            };
            results.push(CounterResult {
                event_id,
                counter: GpuCounter::EventGpuDuration,
                value,
            });
        }

        Ok(CounterReport {
            results,
            anomalies,
            timers_created: self.timers_created(),
        })
    }

    /// Polls a query until its result is available or the poll limit is hit.
    fn poll(&self, context: &dyn DriverContext, query: NativeHandle) -> ReplayResult<Option<QueryData>> {
        for _ in 0..self.poll_limit {
            if let Some(data) = context.query_data(query)? {
                return Ok(Some(data));
            }
            std::thread::yield_now();
        }
        warn!(%query, polls = self.poll_limit, "Query still pending");
        Ok(None)
    }
}

impl Drop for CounterPipeline {
    fn drop(&mut self) {
        for timer in self.timers.drain(..).flatten() {
            self.device.release(timer.before);
            self.device.release(timer.after);
        }
        for query in [self.disjoint.take(), self.session_start.take()]
            .into_iter()
            .flatten()
        {
            self.device.release(query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    impl CounterSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        fn counters(&self) -> Vec<GpuCounter> {
            vec![GpuCounter::Vendor(7)]
        }

        fn describe(&self, counter: GpuCounter) -> Option<CounterDescription> {
            Some(CounterDescription {
                counter,
                name: "Samples".into(),
                description: "Samples shaded".into(),
                unit: CounterUnit::Absolute,
                result_width: 8,
            })
        }

        fn fetch(&mut self, _counter: GpuCounter, events: &[EventId]) -> Result<Vec<f64>, String> {
            Ok(events.iter().map(|e| *e as f64).collect())
        }
    }

    #[test]
    fn test_enumerate_lists_duration_first() {
        let mut registry = CounterRegistry::new();
        assert_eq!(registry.enumerate(), vec![GpuCounter::EventGpuDuration]);
        registry.add_source(Box::new(FixedSource));
        assert_eq!(
            registry.enumerate(),
            vec![GpuCounter::EventGpuDuration, GpuCounter::Vendor(7)]
        );
    }

    #[test]
    fn test_every_enumerated_counter_is_described() {
        let mut registry = CounterRegistry::new();
        registry.add_source(Box::new(FixedSource));
        for counter in registry.enumerate() {
            let desc = registry.describe(counter).unwrap();
            assert_eq!(desc.counter, counter);
        }
        assert_eq!(
            registry.describe(GpuCounter::EventGpuDuration).unwrap().unit,
            CounterUnit::Seconds
        );
    }

    #[test]
    fn test_unknown_counter() {
        let registry = CounterRegistry::new();
        assert!(matches!(
            registry.describe(GpuCounter::Vendor(1)),
            Err(ReplayError::UnknownCounter(GpuCounter::Vendor(1)))
        ));
        assert!(!registry.is_known(GpuCounter::Vendor(1)));
    }
}
