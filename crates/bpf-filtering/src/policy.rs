//! The entry-time predicate, as executed by the probes before caching a call.

use std::fmt;

use bpf_common::{SharedCell, SharedMap};

use crate::FilterTables;

/// Bitmask of enabled filter rules, stored in the `filter_policy` map.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterPolicy(u32);

impl FilterPolicy {
    pub const PID_ALLOW: FilterPolicy = FilterPolicy(1 << 0);
    pub const PID_DENY: FilterPolicy = FilterPolicy(1 << 1);
    pub const NS_ALLOW: FilterPolicy = FilterPolicy(1 << 2);
    pub const NS_DENY: FilterPolicy = FilterPolicy(1 << 3);
    pub const TTY_ONLY: FilterPolicy = FilterPolicy(1 << 4);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn contains(self, rule: FilterPolicy) -> bool {
        self.0 & rule.0 == rule.0
    }

    pub fn insert(&mut self, rule: FilterPolicy) {
        self.0 |= rule.0;
    }
}

impl fmt::Debug for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::PID_ALLOW, "PID_ALLOW"),
            (Self::PID_DENY, "PID_DENY"),
            (Self::NS_ALLOW, "NS_ALLOW"),
            (Self::NS_DENY, "NS_DENY"),
            (Self::TTY_ONLY, "TTY_ONLY"),
        ];
        let enabled: Vec<&str> = names
            .iter()
            .filter(|(rule, _)| self.contains(*rule))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "FilterPolicy({})", enabled.join(" | "))
    }
}

/// What the probe knows about the calling task at syscall entry.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    /// Thread group id
    pub pid: u32,
    pub pid_ns: u64,
    pub has_tty: bool,
}

/// The predicate evaluated by every entry probe.
pub trait CallFilter {
    fn should_capture(&self, call: &CallContext) -> bool;
}

impl<C, P, N> CallFilter for FilterTables<C, P, N>
where
    C: SharedCell<u32>,
    P: SharedMap<u32, u8>,
    N: SharedMap<u64, u8>,
{
    /// Every enabled rule must pass. An unreadable policy disables filtering,
    /// like an unset array slot would.
    fn should_capture(&self, call: &CallContext) -> bool {
        let policy = FilterPolicy::from_raw(self.policy.load().unwrap_or_default());
        if policy == FilterPolicy::empty() {
            return true;
        }
        if policy.contains(FilterPolicy::PID_ALLOW) && self.pid_allow.get(&call.pid).is_err() {
            return false;
        }
        if policy.contains(FilterPolicy::PID_DENY) && self.pid_deny.get(&call.pid).is_ok() {
            return false;
        }
        if policy.contains(FilterPolicy::NS_ALLOW) && self.ns_allow.get(&call.pid_ns).is_err() {
            return false;
        }
        if policy.contains(FilterPolicy::NS_DENY) && self.ns_deny.get(&call.pid_ns).is_ok() {
            return false;
        }
        !(policy.contains(FilterPolicy::TTY_ONLY) && !call.has_tty)
    }
}
