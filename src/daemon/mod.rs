use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use bpf_common::{
    Program, SharedCell, SharedMap,
    program::{BpfContext, BpfLogLevel, Pinning},
};
use bpf_filtering::{BpfFilterTables, FilterTables, install_filters};
use file_system_monitor::module::{RecordReceiver, bpf_dispatcher, fs_monitor_task, start_program};
use nix::unistd::geteuid;
use probe_core::{
    bus::Bus,
    metrics::{LogMetricsClient, MetricsClient},
    pdk::{CleanExit, ModuleError, ShutdownSignal},
};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};

use crate::cli::DaemonOpts;

mod config;
mod logger;

pub use config::{
    DaemonConfig, FILTERING_CONFIG, GENERAL_CONFIG, GeneralConfig, ModulesConfig, StatsConfig,
};

pub async fn run(options: &DaemonOpts) -> Result<()> {
    log::trace!("Daemon options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    bpf_common::bump_memlock_rlimit()?;

    let config = if let Some(custom_file) = &options.config_file {
        DaemonConfig::with_custom_file(custom_file)?
    } else {
        DaemonConfig::new()?
    };
    let modules = ModulesConfig::try_from(&config)?;

    if !modules.any_enabled() {
        log::warn!("Every module is disabled, nothing to do");
        return Ok(());
    }

    let probe = tokio::fs::read(&modules.general.probe_object)
        .await
        .with_context(|| format!("reading probe object {:?}", modules.general.probe_object))?;

    let bpf_log_level = if cfg!(debug_assertions) {
        if log::max_level() >= log::Level::Debug {
            BpfLogLevel::Debug
        } else {
            BpfLogLevel::Error
        }
    } else {
        BpfLogLevel::Disabled
    };
    let pinning = if modules.general.pinning {
        Pinning::Enabled
    } else {
        Pinning::Disabled
    };
    let ctx = BpfContext::new(pinning, modules.general.perf_pages, bpf_log_level)?;

    // The program stays here until every module has stopped: dropping it
    // detaches the probes feeding all of them.
    let (mut program, rx) = start_program(ctx, probe).await?;
    report_probe_status(&program);

    let mut filters = BpfFilterTables::load(&mut program).context("loading filter tables")?;
    apply_filters(&mut filters, &modules)?;

    let mut stats_monitors = Vec::new();
    if modules.stats.enabled {
        let metrics: Arc<dyn MetricsClient> = Arc::new(LogMetricsClient);
        for family in &modules.stats.families {
            match family.start(&mut program, metrics.clone(), modules.stats.flush_interval) {
                Ok(handle) => stats_monitors.push(handle),
                Err(err) => {
                    bpf_common::log_error(&format!("starting {} stats", family.name()), err)
                }
            }
        }
    }

    let bus = Bus::new();
    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let mut tasks = vec![spawn_module(
        "event-logger",
        logger::event_logger(bus.get_receiver(), shutdown.clone()),
    )];

    let dispatcher = if modules.fs_enabled {
        match bpf_dispatcher(&mut program, bus.clone()) {
            Ok(dispatcher) => Some(dispatcher),
            Err(err) => {
                log::error!(
                    "Module {} failed to start, discarding its records: {err:?}",
                    file_system_monitor::MODULE_NAME
                );
                None
            }
        }
    } else {
        None
    };
    match dispatcher {
        Some(dispatcher) => tasks.push(spawn_module(
            file_system_monitor::MODULE_NAME,
            fs_monitor_task(rx, dispatcher, shutdown),
        )),
        None => tasks.push(spawn_module("record-drain", discard_records(rx, shutdown))),
    }

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }

    log::info!("Terminating modules...");
    tx_shutdown.send_signal();
    for task in tasks {
        if let Err(err) = task.await {
            log::warn!("Module task didn't terminate cleanly: {err}");
        }
    }
    for monitor in stats_monitors {
        log::debug!("Draining {} stats", monitor.family());
        monitor.close().await;
    }
    drop(filters);
    drop(program);

    Ok(())
}

/// Install the `[filtering]` rules. The probes run the filter at entry for
/// every module, so this doesn't depend on which modules are enabled.
fn apply_filters<C, P, N>(tables: &mut FilterTables<C, P, N>, modules: &ModulesConfig) -> Result<()>
where
    C: SharedCell<u32>,
    P: SharedMap<u32, u8>,
    N: SharedMap<u64, u8>,
{
    install_filters(tables, &modules.filter).context("installing filters")
}

fn spawn_module<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<CleanExit, ModuleError>> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(_) => log::info!("Module {name} exited"),
            Err(err) => log::error!("Module {name} exited with error: {err:?}"),
        }
    })
}

/// The probes keep emitting records when only the counters are wanted.
async fn discard_records(
    mut rx: RecordReceiver,
    mut shutdown: ShutdownSignal,
) -> Result<CleanExit, ModuleError> {
    loop {
        tokio::select! {
            Some(_) = rx.recv() => {}
            r = shutdown.recv() => return r,
        }
    }
}

fn report_probe_status(program: &Program) {
    let status = program.probe_status();
    let attached: Vec<&str> = status
        .iter()
        .filter(|s| s.is_attached())
        .map(|s| s.function.as_str())
        .collect();
    log::info!(
        "{}: {}/{} probe pairs attached [{}]",
        program.name(),
        attached.len(),
        status.len(),
        attached.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bpf_filtering::{CallContext, CallFilter, MemoryFilterTables};

    use super::*;

    fn modules(content: &str) -> ModulesConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let config = DaemonConfig::with_custom_file(file.path()).unwrap();
        ModulesConfig::try_from(&config).unwrap()
    }

    #[test]
    fn filters_apply_with_file_system_monitor_disabled() {
        let modules = modules(
            "[general]\nprobe_object = /opt/probe/fs.bpf.o\n\n\
             [file-system-monitor]\nenabled = false\n\n\
             [filtering]\npid_denylist = 10\n",
        );
        let mut tables = MemoryFilterTables::in_memory();
        apply_filters(&mut tables, &modules).unwrap();

        assert!(tables.pid_deny.contains_key(&10));
        let call = |pid| CallContext {
            pid,
            pid_ns: 1,
            has_tty: true,
        };
        assert!(!tables.should_capture(&call(10)));
        assert!(tables.should_capture(&call(11)));
    }

    #[test]
    fn stale_rules_are_replaced() {
        let mut tables = MemoryFilterTables::in_memory();
        apply_filters(
            &mut tables,
            &modules("[general]\nprobe_object = /p.o\n[filtering]\npid_denylist = 10\n"),
        )
        .unwrap();
        apply_filters(&mut tables, &modules("[general]\nprobe_object = /p.o\n")).unwrap();

        assert!(tables.should_capture(&CallContext {
            pid: 10,
            pid_ns: 1,
            has_tty: false,
        }));
    }
}
