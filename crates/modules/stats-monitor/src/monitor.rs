use std::{marker::PhantomData, sync::Arc, time::Duration};

use bpf_common::{
    MapError, PerCpuTable, Program, ProgramError, SharedCell,
    aya::maps::{Array, MapData, PerCpuArray},
    maps::MemoryPerCpuTable,
};
use probe_core::{
    event::{EVENT_TYPE_MAX, event_type_name},
    metrics::MetricsClient,
};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::CounterFamily;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("initializing buffer selector")]
    Selector(#[source] MapError),
}

pub fn buffer_map_name(family: &str, index: u32) -> String {
    format!("{family}_stats_{index}")
}

pub fn selector_map_name(family: &str) -> String {
    format!("{family}_buffer_selector")
}

/// Exports the counters of one family.
///
/// The probes increment the buffer designated by the selector cell, while
/// userspace reads and zeroes the other one, then flips the selector. Kernel
/// writers and the userspace reader never work on the same buffer, except for
/// increments racing with a flip, which land in the buffer read next.
pub struct StatsMonitor<F, T, S> {
    buffers: [T; 2],
    selector: S,
    active: u32,
    metrics: Arc<dyn MetricsClient>,
    metric_name: String,
    _family: PhantomData<fn() -> F>,
}

pub type BpfStatsMonitor<F> = StatsMonitor<
    F,
    PerCpuArray<MapData, <F as CounterFamily>::Counters>,
    Array<MapData, u32>,
>;

impl<F: CounterFamily> BpfStatsMonitor<F> {
    /// Take the two buffers and the selector of the family out of `program`.
    pub fn load(program: &mut Program, metrics: Arc<dyn MetricsClient>) -> Result<Self, StatsError> {
        let mut buffer = |index| -> Result<PerCpuArray<MapData, F::Counters>, ProgramError> {
            let map = program.take_map(&buffer_map_name(F::NAME, index))?;
            Ok(PerCpuArray::try_from(map)?)
        };
        let buffers = [buffer(0)?, buffer(1)?];
        let selector = Array::try_from(program.take_map(&selector_map_name(F::NAME))?)
            .map_err(ProgramError::from)?;
        Self::new(buffers, selector, metrics)
    }
}

impl<F, T, S> StatsMonitor<F, T, S>
where
    F: CounterFamily,
    T: PerCpuTable<F::Counters> + Send + 'static,
    S: SharedCell<u32> + Send + 'static,
{
    /// Buffer 0 starts as the active one.
    pub fn new(
        buffers: [T; 2],
        mut selector: S,
        metrics: Arc<dyn MetricsClient>,
    ) -> Result<Self, StatsError> {
        selector.store(0).map_err(StatsError::Selector)?;
        Ok(Self {
            buffers,
            selector,
            active: 0,
            metrics,
            metric_name: format!("runtime_probe.{}", F::NAME),
            _family: PhantomData,
        })
    }

    /// Index of the buffer the probes are writing to.
    pub fn active_buffer(&self) -> u32 {
        self.active
    }

    /// Export and zero the inactive buffer, then make it the active one.
    ///
    /// Failures are logged: the flip always happens.
    pub fn flush(&mut self) {
        let inactive = 1 - self.active;
        let table = &mut self.buffers[inactive as usize];
        for event_type in 0..EVENT_TYPE_MAX {
            match table.per_cpu(event_type) {
                Ok(values) => {
                    let mut total = F::Counters::default();
                    for value in &values {
                        F::merge(&mut total, value);
                    }
                    for (tag, value) in F::breakdown(&total) {
                        if value == 0 {
                            continue;
                        }
                        let mut tags = vec![format!("event_type:{}", event_type_name(event_type))];
                        tags.extend(tag);
                        if let Err(err) = self.metrics.count(&self.metric_name, value as i64, &tags) {
                            log::warn!("{}: sending {tags:?}: {err}", self.metric_name);
                        }
                    }
                }
                Err(err) => {
                    log::warn!("{}: reading event type {event_type}: {err}", self.metric_name);
                }
            }
            if let Err(err) = table.reset(event_type) {
                log::warn!("{}: zeroing event type {event_type}: {err}", self.metric_name);
            }
        }

        self.active = inactive;
        if let Err(err) = self.selector.store(self.active) {
            log::warn!("{}: switching buffer: {err}", self.metric_name);
        }
    }

    /// Flush both buffers, so nothing counted before the call is lost.
    pub fn close(mut self) {
        self.flush();
        self.flush();
    }

    /// Flush every `interval` on a background task.
    pub fn start(mut self, interval: Duration) -> StatsMonitorHandle {
        let (tx_stop, mut rx_stop) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.flush(),
                    _ = &mut rx_stop => break,
                }
            }
            self.close();
        });
        StatsMonitorHandle {
            family: F::NAME,
            tx_stop,
            task,
        }
    }
}

/// Handle to a started [`StatsMonitor`]. Dropping it stops the monitor too,
/// without waiting for the final flushes.
pub struct StatsMonitorHandle {
    family: &'static str,
    tx_stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StatsMonitorHandle {
    pub fn family(&self) -> &'static str {
        self.family
    }

    /// Stop the periodic flush and wait for both buffers to be drained.
    pub async fn close(self) {
        let _ = self.tx_stop.send(());
        if let Err(err) = self.task.await {
            log::error!("{} stats monitor: {err}", self.family);
        }
    }
}

/// Count an event the way a probe running on `cpu` does: in the buffer
/// currently designated by the selector.
pub fn record_event<V, S>(
    buffers: &[MemoryPerCpuTable<V>; 2],
    selector: &S,
    cpu: usize,
    event_type: u32,
    update: impl FnOnce(&mut V),
) -> Result<(), MapError>
where
    V: Clone + Default,
    S: SharedCell<u32>,
{
    let active = selector.load()? as usize & 1;
    buffers[active].increment(cpu, event_type, update)
}
