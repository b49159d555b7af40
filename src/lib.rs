//! Runtime probe is the kernel capture layer of a runtime security agent.
//!
//! The daemon (`runtime-probed`) loads a compiled eBPF object, attaches a
//! kprobe/kretprobe pair to every instrumented VFS function and turns what the
//! probes report into typed [events](probe_core::event). It is made of:
//!
//! - the [file system monitor](file_system_monitor): correlation of syscall
//!   entry and exit, path resolution and event dispatch
//! - the [statistics monitor](stats_monitor): periodic export of the
//!   double-buffered per-CPU counters kept by the probes
//! - the [filters](bpf_filtering) which decide, at syscall entry, which calls
//!   are worth capturing
//!
//! Every module is configured from its own section of an `INI` file, see
//! [`daemon::DaemonConfig`].

pub mod cli;
pub mod daemon;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
