//! [`Program`] is a wrapper around [`aya::Ebpf`] which:
//! - loads an eBPF object and attaches its kprobe/kretprobe pairs one by one,
//!   recording which ones failed instead of giving up on the first error
//! - hands out the maps other components need
//! - allows to read raw records from a perf event array.
//!
use std::{collections::HashSet, convert::TryFrom, sync::Arc};

use aya::{
    Btf, BtfError, Ebpf, EbpfLoader,
    maps::{
        Map, MapData,
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer, PerfBufferError},
    },
    programs::KProbe,
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{sync::watch, task::JoinError};

use crate::BpfSender;

const PINNED_MAPS_PATH: &str = "/sys/fs/bpf/runtime-probe";

pub const PERF_PAGES_DEFAULT: usize = 4096;

/// Max record size in bytes
const RECORD_MAX: usize = 512;

/// Records read from a perf buffer at once
const READ_BATCH: usize = 10;

/// BpfContext contains extra settings which could be provided on program load
#[derive(Clone)]
pub struct BpfContext {
    /// Enable pinning to file-system for shared maps.
    /// This should be set only for the final executable, not for tests.
    pinning: Pinning,
    pinning_path: String,
    /// Btf allows to load it only once on startup
    btf: Arc<Btf>,
    /// How many pages of memory (4Kb) to use for perf arrays.
    /// NOTE: this will result in a memory usage of:
    /// (number of cores) * (perf_pages) * 4Kb
    perf_pages: usize,
    /// Log level for eBPF print statements
    log_level: BpfLogLevel,
}

#[derive(Clone)]
pub enum Pinning {
    Enabled,
    Disabled,
}

#[derive(Clone, Copy)]
pub enum BpfLogLevel {
    Disabled = 0,
    Error = 1,
    Debug = 2,
}

impl BpfContext {
    pub fn new(
        pinning: Pinning,
        mut perf_pages: usize,
        log_level: BpfLogLevel,
    ) -> Result<Self, ProgramError> {
        let btf = Btf::from_sys_fs()?;
        if perf_pages == 0 || (perf_pages & (perf_pages - 1) != 0) {
            log::warn!("Invalid value ({perf_pages}) for perf_pages, which must be a power of 2.");
            log::warn!("The default value {PERF_PAGES_DEFAULT} will be used.");
            perf_pages = PERF_PAGES_DEFAULT;
        }
        // aya doesn't support specifying from userspace wether or not to pin maps.
        // As a hack we always pin and delete the folder on shutdown.
        let pinning_path = match pinning {
            Pinning::Enabled => PINNED_MAPS_PATH.to_string(),
            Pinning::Disabled => format!("{PINNED_MAPS_PATH}_tmp"),
        };

        Ok(Self {
            pinning,
            btf: Arc::new(btf),
            perf_pages,
            pinning_path,
            log_level,
        })
    }
}

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("loading probe")]
    LoadingProbe(#[from] aya::EbpfError),
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program attach {program}")]
    ProgramAttachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error(transparent)]
    MapError(#[from] aya::maps::MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map already used {0}")]
    MapAlreadyUsed(String),
    #[error("perf buffer error {0}")]
    PerfBuffer(#[from] PerfBufferError),
    #[error("listing online cpus")]
    OnlineCpus(#[source] std::io::Error),
    #[error("loading BTF {0}")]
    BtfError(#[from] BtfError),
    #[error("running background aya task {0}")]
    JoinError(#[from] JoinError),
}

pub struct ProgramBuilder {
    /// probe name, used for logging purposes
    name: &'static str,
    /// Probe configuration
    ctx: BpfContext,
    probe: Vec<u8>,
    pairs: Vec<ProbePair>,
}

impl ProgramBuilder {
    pub fn new(ctx: BpfContext, name: &'static str, probe: Vec<u8>) -> Self {
        Self {
            ctx,
            name,
            probe,
            pairs: Vec::new(),
        }
    }

    /// Attach `kprobe_<function>` on entry and `kretprobe_<function>` on return
    /// of the given kernel function.
    pub fn kprobe_pair(mut self, function: &str) -> Self {
        self.pairs.push(ProbePair {
            function: function.to_string(),
        });
        self
    }

    /// Load the object and attach every probe pair.
    ///
    /// Only failing to load the object is fatal: probe pairs which can't be
    /// attached are reported in [`Program::probe_status`] and the others keep
    /// working.
    pub async fn start(self) -> Result<Program, ProgramError> {
        // Background tasks reading from maps need to know when we're shutting
        // down. Dropping aya::Ebpf doesn't cause an error on them: the map file
        // descriptor is dropped only when all Map usage is dropped.
        let (tx_exit, _) = watch::channel(());
        let btf = self.ctx.btf.clone();
        let ctx = self.ctx.clone();
        let name = self.name;

        let (bpf, probe_status) = tokio::task::spawn_blocking(move || {
            let _ = std::fs::create_dir(&self.ctx.pinning_path);
            let mut bpf = EbpfLoader::new()
                .map_pin_path(&self.ctx.pinning_path)
                .btf(Some(btf.as_ref()))
                .set_global("log_level", &(self.ctx.log_level as i32), false)
                .load(&self.probe)?;
            let probe_status = self
                .pairs
                .into_iter()
                .map(|pair| {
                    let result = pair.attach(&mut bpf);
                    ProbeStatus {
                        function: pair.function,
                        result,
                    }
                })
                .collect::<Vec<_>>();
            Result::<_, ProgramError>::Ok((bpf, probe_status))
        })
        .await??;

        for status in &probe_status {
            match &status.result {
                Ok(()) => log::debug!("{name}: attached {}", status.function),
                Err(err) => log::error!(
                    "{name}: probe pair {} unavailable: {err}: {:?}",
                    status.function,
                    std::error::Error::source(err)
                ),
            }
        }
        let attached = probe_status.iter().filter(|s| s.is_attached()).count();
        if attached == 0 && !probe_status.is_empty() {
            log::warn!("{name}: no probe pair could be attached");
        }

        Ok(Program {
            tx_exit,
            name: name.to_string(),
            ctx,
            bpf,
            used_maps: Default::default(),
            probe_status,
        })
    }
}

struct ProbePair {
    function: String,
}

impl ProbePair {
    fn entry(&self) -> String {
        format!("kprobe_{}", self.function)
    }

    fn exit(&self) -> String {
        format!("kretprobe_{}", self.function)
    }

    /// Attach both halves. If the exit half fails, the entry half is unloaded:
    /// entries which are never consumed would just fill the correlation cache.
    fn attach(&self, bpf: &mut Ebpf) -> Result<(), ProgramError> {
        attach_kprobe(bpf, &self.entry(), &self.function)?;
        if let Err(err) = attach_kprobe(bpf, &self.exit(), &self.function) {
            let entry: Result<&mut KProbe, _> = extract_program(bpf, &self.entry());
            if let Ok(entry) = entry {
                let _ = entry.unload();
            }
            return Err(err);
        }
        Ok(())
    }
}

fn attach_kprobe(bpf: &mut Ebpf, program: &str, function: &str) -> Result<(), ProgramError> {
    let kprobe: &mut KProbe = extract_program(bpf, program)?;
    kprobe
        .load()
        .map_err(|program_error| ProgramError::ProgramLoadError {
            program: program.to_string(),
            program_error: Box::new(program_error),
        })?;
    kprobe
        .attach(function, 0)
        .map_err(|program_error| ProgramError::ProgramAttachError {
            program: program.to_string(),
            program_error: Box::new(program_error),
        })?;
    Ok(())
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, ProgramError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

/// Outcome of attaching one kprobe/kretprobe pair.
#[derive(Debug)]
pub struct ProbeStatus {
    pub function: String,
    pub result: Result<(), ProgramError>,
}

impl ProbeStatus {
    pub fn is_attached(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Program {
    /// Signal to the background async tasks that we're exiting.
    tx_exit: watch::Sender<()>,
    ctx: BpfContext,
    name: String,
    bpf: Ebpf,
    used_maps: HashSet<String>,
    probe_status: Vec<ProbeStatus>,
}

impl Drop for Program {
    fn drop(&mut self) {
        if matches!(self.ctx.pinning, Pinning::Disabled) {
            let _ = std::fs::remove_dir_all(&self.ctx.pinning_path);
        }
    }
}

impl Program {
    pub fn bpf(&mut self) -> &mut Ebpf {
        &mut self.bpf
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn probe_status(&self) -> &[ProbeStatus] {
        &self.probe_status
    }

    /// Watch a BPF_MAP_TYPE_PERF_EVENT_ARRAY and forward every raw record to `sender`.
    /// A different task is run for each CPU.
    pub async fn read_events(
        &mut self,
        map_name: &str,
        sender: impl BpfSender<Bytes>,
    ) -> Result<(), ProgramError> {
        let mut perf_array = AsyncPerfEventArray::try_from(self.take_map(map_name)?)?;
        let cpus = online_cpus().map_err(|(_, err)| ProgramError::OnlineCpus(err))?;
        for cpu in cpus {
            let reader = CpuReader {
                program: format!("{}/{map_name}", self.name),
                cpu,
                buf: perf_array.open(cpu, Some(self.ctx.perf_pages))?,
                lost: 0,
            };
            tokio::spawn(reader.run(sender.clone(), self.tx_exit.subscribe()));
        }
        Ok(())
    }

    /// Take ownership of a map. Every map can be taken only once.
    pub fn take_map(&mut self, map_name: &str) -> Result<Map, ProgramError> {
        if self.used_maps.contains(map_name) {
            return Err(ProgramError::MapAlreadyUsed(map_name.to_string()));
        };

        let map_resource = self
            .bpf
            .take_map(map_name)
            .ok_or_else(|| ProgramError::MapNotFound(map_name.to_string()))?;

        self.used_maps.insert(map_name.to_string());
        Ok(map_resource)
    }
}

/// Drains the perf buffer of one CPU.
struct CpuReader {
    program: String,
    cpu: u32,
    buf: AsyncPerfEventArrayBuffer<MapData>,
    /// Records overwritten before we could read them, since start
    lost: usize,
}

impl CpuReader {
    async fn run(mut self, mut sender: impl BpfSender<Bytes>, mut rx_exit: watch::Receiver<()>) {
        let mut buffers = (0..READ_BATCH)
            .map(|_| BytesMut::with_capacity(RECORD_MAX))
            .collect::<Vec<_>>();
        loop {
            let events = tokio::select! {
                Err(_) = rx_exit.changed() => return,
                events = self.buf.read_events(&mut buffers) => events,
            };
            let events = match events {
                Ok(events) => events,
                Err(err) => return sender.send(Err(err.into())),
            };
            if events.lost > 0 {
                self.lost += events.lost;
                log::warn!(
                    "{} cpu {}: lost {} records, {} since start",
                    self.program,
                    self.cpu,
                    events.lost,
                    self.lost
                );
            }
            for buffer in buffers.iter_mut().take(events.read) {
                let record = std::mem::replace(buffer, BytesMut::with_capacity(RECORD_MAX));
                sender.send(Ok(record.freeze()));
            }
        }
    }
}
