//! # Events filtering
//!
//! This crate decides whether a syscall is interesting for the rest of the
//! system or if it should be discarded before anything is cached.
//!
//! # Policy system requirements
//!
//! - Filtering always happens on kernel side, at syscall entry: a rejected call
//!   never reaches the correlation cache and never produces an event.
//! - By default everything is interesting.
//! - Each rule kind can be enabled independently, and every enabled rule must
//!   pass.
//!
//! # Rules
//!
//! - pid allow-list: only calls from these processes are kept
//! - pid deny-list: calls from these processes are dropped
//! - namespace allow-list: only calls from these pid namespaces are kept
//! - namespace deny-list: calls from these pid namespaces are dropped
//! - tty only: only calls from processes with a controlling terminal are kept
//!
//! We filter on process id (thread group id), ignoring the thread id.
//!
//! # Implementation
//!
//! The probes consult these maps before caching a call:
//!
//! **`filter_policy: Array<u32>`** (one slot)
//! - The bitmask of enabled rules, see [`FilterPolicy`].
//!
//! **`filter_pid_allow`, `filter_pid_deny`: `HashMap<u32, u8>`**
//! **`filter_ns_allow`, `filter_ns_deny`: `HashMap<u64, u8>`**
//! - Membership sets. A lookup miss keeps the call for deny-lists and drops
//!   it for allow-lists.
//!
//! Userspace writes the lists first and the policy last, so a probe never sees
//! a rule enabled with its list still empty. There is no atomicity across
//! multiple list updates: the probes see the last write.

mod config;
mod installer;
mod policy;

pub use config::FilterConfig;
pub use installer::{BpfFilterTables, FilterTables, MemoryFilterTables, install_filters};
pub use policy::{CallContext, CallFilter, FilterPolicy};

pub const POLICY_MAP: &str = "filter_policy";
pub const PID_ALLOW_MAP: &str = "filter_pid_allow";
pub const PID_DENY_MAP: &str = "filter_pid_deny";
pub const NS_ALLOW_MAP: &str = "filter_ns_allow";
pub const NS_DENY_MAP: &str = "filter_ns_deny";
