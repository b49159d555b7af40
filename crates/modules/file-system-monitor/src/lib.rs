//! # File system monitor
//!
//! Attaches a kprobe/kretprobe pair to each instrumented VFS function (see
//! [`probes`]), correlates entry and exit of every interesting call (see
//! [`correlation`]) and turns the records emitted by the probes into typed
//! events (see [`dispatcher`]).

use bpf_common::{BpfSender, Program, ProgramBuilder, ProgramError, program::BpfContext};
use bytes::Bytes;

pub mod correlation;
pub mod dispatcher;
pub mod probes;
pub mod record;

pub use dispatcher::EventDispatcher;
pub use probes::ProbeKind;
pub use record::{DecodeError, Record};

pub const MODULE_NAME: &str = "file-system-monitor";

/// Perf event array the exit probes output records to.
pub const EVENTS_MAP: &str = "fs_events";

/// Load the probe object, attach every probe pair and start forwarding raw
/// records to `sender`.
pub async fn program(
    ctx: BpfContext,
    probe: Vec<u8>,
    sender: impl BpfSender<Bytes>,
) -> Result<Program, ProgramError> {
    let builder = ProbeKind::all().fold(
        ProgramBuilder::new(ctx, MODULE_NAME, probe),
        |builder, kind| builder.kprobe_pair(kind.function()),
    );
    let mut program = builder.start().await?;
    program.read_events(EVENTS_MAP, sender).await?;
    Ok(program)
}

pub mod module {
    use bpf_common::{
        SharedMap,
        aya::maps::{HashMap, MapData},
        time::BootTime,
    };
    use dentry_resolver::{DentryResolver, FRAGMENT_STORE_MAP, PathFragment};
    use probe_core::{
        bus::EventHandler,
        pdk::{CleanExit, ModuleError, ShutdownSignal},
    };
    use tokio::sync::mpsc;

    use super::*;

    /// Capacity of the channel between the perf readers and the dispatcher.
    pub const CHANNEL_CAPACITY: usize = 4096;

    pub type RecordReceiver = mpsc::Receiver<Result<Bytes, ProgramError>>;

    pub type FragmentStore = HashMap<MapData, u32, PathFragment>;

    /// Load the program with a channel sized for the dispatcher.
    pub async fn start_program(
        ctx: BpfContext,
        probe: Vec<u8>,
    ) -> Result<(Program, RecordReceiver), ProgramError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let program = program(ctx, probe, tx).await?;
        Ok((program, rx))
    }

    /// Take the fragment store out of `program` and build the dispatcher
    /// delivering to `handler`. The program itself stays with the caller.
    pub fn bpf_dispatcher<H: EventHandler>(
        program: &mut Program,
        handler: H,
    ) -> Result<EventDispatcher<FragmentStore, H>, ModuleError> {
        let fragments: FragmentStore = HashMap::try_from(program.take_map(FRAGMENT_STORE_MAP)?)?;
        Ok(EventDispatcher::new(
            MODULE_NAME,
            DentryResolver::new(fragments),
            BootTime::capture()?,
            handler,
        ))
    }

    /// Dispatch every record received on `rx` until `shutdown` fires.
    pub async fn fs_monitor_task<M, H>(
        mut rx: RecordReceiver,
        mut dispatcher: EventDispatcher<M, H>,
        mut shutdown: ShutdownSignal,
    ) -> Result<CleanExit, ModuleError>
    where
        M: SharedMap<u32, PathFragment>,
        H: EventHandler,
    {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => match msg {
                    Ok(data) => {
                        if let Err(err) = dispatcher.dispatch(&data) {
                            log::warn!("{MODULE_NAME}: dropping record: {err}");
                        }
                    }
                    Err(err) => bpf_common::log_error("reading perf buffer", err),
                },
                r = shutdown.recv() => return r,
            }
        }
    }

}
