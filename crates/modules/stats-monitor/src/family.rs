//! Counter families. Each family is one set of counters, incremented by the
//! probes per event type and exported as one metric.

use bpf_common::aya::Pod;

pub trait CounterFamily: Send + 'static {
    /// Value of one per-CPU slot.
    type Counters: Pod + Default + Send + Sync + 'static;

    /// Prefix of the shared tables and suffix of the metric name.
    const NAME: &'static str;

    /// Accumulate the slot of one CPU into `total`.
    fn merge(total: &mut Self::Counters, cpu: &Self::Counters);

    /// Values to export, each with its secondary tag if the family has one.
    fn breakdown(total: &Self::Counters) -> Vec<(Option<String>, u64)>;
}

/// Events approved by in-kernel approvers.
pub struct Approvers;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApproverCounters {
    pub by_basename: u64,
    pub by_flags: u64,
}

unsafe impl Pod for ApproverCounters {}

impl CounterFamily for Approvers {
    type Counters = ApproverCounters;
    const NAME: &'static str = "approvers";

    fn merge(total: &mut ApproverCounters, cpu: &ApproverCounters) {
        total.by_basename += cpu.by_basename;
        total.by_flags += cpu.by_flags;
    }

    fn breakdown(total: &ApproverCounters) -> Vec<(Option<String>, u64)> {
        vec![
            (Some("approver_type:basename".to_string()), total.by_basename),
            (Some("approver_type:flag".to_string()), total.by_flags),
        ]
    }
}

/// Discarders pushed to the kernel and events they discarded.
pub struct Discarders;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscarderCounters {
    pub discarders_added: u64,
    pub event_discarded: u64,
}

unsafe impl Pod for DiscarderCounters {}

impl CounterFamily for Discarders {
    type Counters = DiscarderCounters;
    const NAME: &'static str = "discarders";

    fn merge(total: &mut DiscarderCounters, cpu: &DiscarderCounters) {
        total.discarders_added += cpu.discarders_added;
        total.event_discarded += cpu.event_discarded;
    }

    fn breakdown(total: &DiscarderCounters) -> Vec<(Option<String>, u64)> {
        vec![
            (
                Some("discarder_type:discarders_added".to_string()),
                total.discarders_added,
            ),
            (
                Some("discarder_type:event_discarded".to_string()),
                total.event_discarded,
            ),
        ]
    }
}

/// Instrumented syscalls seen by the probes.
pub struct Syscalls;

impl CounterFamily for Syscalls {
    type Counters = u64;
    const NAME: &'static str = "syscalls";

    fn merge(total: &mut u64, cpu: &u64) {
        *total += cpu;
    }

    fn breakdown(total: &u64) -> Vec<(Option<String>, u64)> {
        vec![(None, *total)]
    }
}

/// Events sampled into, or dropped from, activity dumps.
pub struct ActivityDump;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityDumpCounters {
    pub sampled: u64,
    pub dropped: u64,
}

unsafe impl Pod for ActivityDumpCounters {}

impl CounterFamily for ActivityDump {
    type Counters = ActivityDumpCounters;
    const NAME: &'static str = "activity_dump";

    fn merge(total: &mut ActivityDumpCounters, cpu: &ActivityDumpCounters) {
        total.sampled += cpu.sampled;
        total.dropped += cpu.dropped;
    }

    fn breakdown(total: &ActivityDumpCounters) -> Vec<(Option<String>, u64)> {
        vec![
            (Some("outcome:sampled".to_string()), total.sampled),
            (Some("outcome:dropped".to_string()), total.dropped),
        ]
    }
}
