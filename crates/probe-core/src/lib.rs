//! Types shared by every monitor of the capture layer:
//!
//! - [`event`]: the typed events handed to downstream consumers
//! - [`bus`]: the [`bus::EventHandler`] seam and a broadcast implementation
//! - [`metrics`]: the [`metrics::MetricsClient`] seam used for telemetry
//! - [`pdk`]: module configuration and shutdown plumbing

pub mod bus;
pub mod event;
pub mod metrics;
pub mod pdk;

pub use bpf_common::time::{BootTime, Timestamp};
