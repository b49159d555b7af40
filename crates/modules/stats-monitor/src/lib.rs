//! # Statistics monitor
//!
//! The probes count what they do (approved events, discarded events, sampled
//! events...) in per-CPU arrays indexed by event type. Every counter family
//! owns a pair of such arrays and a one-slot selector telling the probes which
//! one is active:
//!
//! - `<family>_stats_0`, `<family>_stats_1`: `PerCpuArray<Counters>`
//! - `<family>_buffer_selector`: `Array<u32>`
//!
//! A [`StatsMonitor`] periodically exports the inactive array as
//! `runtime_probe.<family>` counts, zeroes it and flips the selector.

use std::{sync::Arc, time::Duration};

use bpf_common::Program;
use probe_core::metrics::MetricsClient;
use strum::{EnumString, IntoStaticStr};

mod family;
mod monitor;

pub use family::{
    ActivityDump, ActivityDumpCounters, ApproverCounters, Approvers, CounterFamily,
    DiscarderCounters, Discarders, Syscalls,
};
pub use monitor::{
    BpfStatsMonitor, StatsError, StatsMonitor, StatsMonitorHandle, buffer_map_name, record_event,
    selector_map_name,
};

pub const MODULE_NAME: &str = "stats-monitor";

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Counter families which can be enabled from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FamilyKind {
    Approvers,
    Discarders,
    Syscalls,
    ActivityDump,
}

impl FamilyKind {
    pub const ALL: [FamilyKind; 4] = [
        FamilyKind::Approvers,
        FamilyKind::Discarders,
        FamilyKind::Syscalls,
        FamilyKind::ActivityDump,
    ];

    /// Load the tables of this family out of `program` and start flushing them.
    pub fn start(
        self,
        program: &mut Program,
        metrics: Arc<dyn MetricsClient>,
        interval: Duration,
    ) -> Result<StatsMonitorHandle, StatsError> {
        Ok(match self {
            FamilyKind::Approvers => BpfStatsMonitor::<Approvers>::load(program, metrics)?.start(interval),
            FamilyKind::Discarders => BpfStatsMonitor::<Discarders>::load(program, metrics)?.start(interval),
            FamilyKind::Syscalls => BpfStatsMonitor::<Syscalls>::load(program, metrics)?.start(interval),
            FamilyKind::ActivityDump => {
                BpfStatsMonitor::<ActivityDump>::load(program, metrics)?.start(interval)
            }
        })
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_names_match_table_prefixes() {
        for (kind, name) in [
            (FamilyKind::Approvers, Approvers::NAME),
            (FamilyKind::Discarders, Discarders::NAME),
            (FamilyKind::Syscalls, Syscalls::NAME),
            (FamilyKind::ActivityDump, ActivityDump::NAME),
        ] {
            assert_eq!(kind.name(), name);
            assert_eq!(name.parse::<FamilyKind>().unwrap(), kind);
        }
        assert_eq!(buffer_map_name("syscalls", 1), "syscalls_stats_1");
        assert_eq!(selector_map_name("approvers"), "approvers_buffer_selector");
    }
}
