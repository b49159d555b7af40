//! Kernel timestamps are nanoseconds from boot (`bpf_ktime_get_ns`, CLOCK_MONOTONIC).
//! [`BootTime`] turns them into wall-clock time.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nix::time::{ClockId, clock_gettime};

/// Monotonic offset from boot, in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Read the current value of the clock used by eBPF probes.
    pub fn now() -> Result<Self, nix::Error> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
        Ok(Self(Duration::from(ts).as_nanos() as u64))
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(ns: u64) -> Self {
        Self(ns)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock instant at which the monotonic clock read zero.
///
/// It must be captured once at startup and shared by every consumer, so that
/// all events are converted with the same reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootTime(SystemTime);

impl BootTime {
    pub fn capture() -> Result<Self, nix::Error> {
        let now = SystemTime::now();
        let uptime = Duration::from_nanos(Timestamp::now()?.as_nanos());
        Ok(Self(now.checked_sub(uptime).unwrap_or(UNIX_EPOCH)))
    }

    pub fn from_system_time(boot: SystemTime) -> Self {
        Self(boot)
    }

    pub fn to_system_time(&self, timestamp: Timestamp) -> SystemTime {
        self.0 + Duration::from_nanos(timestamp.as_nanos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_offset_from_boot() {
        let boot = BootTime::from_system_time(UNIX_EPOCH + Duration::from_secs(1_000));
        let ts = Timestamp::from(2_500_000_000);
        assert_eq!(
            boot.to_system_time(ts),
            UNIX_EPOCH + Duration::from_millis(1_002_500)
        );
    }

    #[test]
    fn captured_boot_time_is_in_the_past() {
        let boot = BootTime::capture().unwrap();
        let now = Timestamp::now().unwrap();
        let converted = boot.to_system_time(now);
        let drift = SystemTime::now()
            .duration_since(converted)
            .unwrap_or_else(|err| err.duration());
        assert!(drift < Duration::from_secs(1));
    }
}
