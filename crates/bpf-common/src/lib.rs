mod bpf_sender;
pub mod maps;
pub mod program;
pub mod time;

pub use bpf_sender::BpfSender;
pub use maps::{MapError, PerCpuTable, SharedCell, SharedMap};
pub use program::{Program, ProgramBuilder, ProgramError};

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

/// Lift the locked memory limit, which accounts eBPF maps on kernels older
/// than 5.11.
pub fn bump_memlock_rlimit() -> anyhow::Result<()> {
    use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};

    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .map_err(|err| anyhow::anyhow!("failed to increase rlimit: {err}"))
}
