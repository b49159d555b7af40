use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use bpf_common::program::PERF_PAGES_DEFAULT;
use bpf_filtering::FilterConfig;
use probe_core::pdk::{ConfigError, ModuleConfig};
use stats_monitor::{DEFAULT_FLUSH_INTERVAL, FamilyKind};

const DEFAULT_CONFIG_FILE: &str = "/etc/runtime-probe/runtime-probe.ini";

/// Section for settings shared by all modules.
pub const GENERAL_CONFIG: &str = "general";

/// Section of the filter rules.
pub const FILTERING_CONFIG: &str = "filtering";

/// Daemon configuration. Contains configuration for all the modules, one
/// section of the `INI` file per module.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl DaemonConfig {
    /// Construct a new [`DaemonConfig`] using the default file. A missing
    /// default file means every module runs with its defaults.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::warn!(
                "Configuration file {} not found, using defaults",
                config_file.display()
            );
            return Ok(Self::default());
        }
        Self::from_config_file(&config_file)
    }

    /// Construct a new [`DaemonConfig`] using a custom file.
    pub fn with_custom_file(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: &Path) -> Result<Self> {
        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in &conf {
            if let Some(section) = section {
                let mod_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    mod_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self { configs })
    }

    /// Get module configuration, if the file has a section for it.
    pub fn get_module_config(&self, module: &str) -> Option<ModuleConfig> {
        self.configs.get(module).cloned()
    }

    /// Get module configuration, empty if the file has no section for it.
    pub fn module_config(&self, module: &str) -> ModuleConfig {
        self.get_module_config(module).unwrap_or_default()
    }
}

/// Every section the daemon reads, validated before anything is loaded.
#[derive(Debug, Clone)]
pub struct ModulesConfig {
    pub general: GeneralConfig,
    /// Applied whichever modules are enabled: the probes filter at entry.
    pub filter: FilterConfig,
    pub stats: StatsConfig,
    pub fs_enabled: bool,
}

impl ModulesConfig {
    pub fn any_enabled(&self) -> bool {
        self.fs_enabled || self.stats.enabled
    }
}

impl TryFrom<&DaemonConfig> for ModulesConfig {
    type Error = anyhow::Error;

    fn try_from(config: &DaemonConfig) -> Result<Self> {
        Ok(ModulesConfig {
            general: GeneralConfig::try_from(&config.module_config(GENERAL_CONFIG))
                .context("invalid [general] configuration")?,
            filter: FilterConfig::try_from(&config.module_config(FILTERING_CONFIG))
                .context("invalid [filtering] configuration")?,
            stats: StatsConfig::try_from(&config.module_config(stats_monitor::MODULE_NAME))
                .context("invalid [stats-monitor] configuration")?,
            fs_enabled: config
                .module_config(file_system_monitor::MODULE_NAME)
                .with_default("enabled", true)
                .context("invalid [file-system-monitor] configuration")?,
        })
    }
}

/// Content of the `[general]` section.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Compiled eBPF object with the probes and the shared tables
    pub probe_object: PathBuf,
    pub perf_pages: usize,
    /// Keep the shared tables pinned after exit
    pub pinning: bool,
}

impl TryFrom<&ModuleConfig> for GeneralConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(GeneralConfig {
            probe_object: config.required("probe_object")?,
            perf_pages: config.with_default("perf_pages", PERF_PAGES_DEFAULT)?,
            pinning: config.with_default("pinning", true)?,
        })
    }
}

/// Content of the `[stats-monitor]` section.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub enabled: bool,
    pub flush_interval: Duration,
    pub families: Vec<FamilyKind>,
}

impl TryFrom<&ModuleConfig> for StatsConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let flush_interval_ms: u64 = config.with_default(
            "flush_interval_ms",
            DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
        )?;
        if flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flush_interval_ms".to_string(),
                value: "0".to_string(),
                err: "must be greater than zero".to_string(),
            });
        }
        Ok(StatsConfig {
            enabled: config.with_default("enabled", true)?,
            flush_interval: Duration::from_millis(flush_interval_ms),
            families: config.get_list_with_default("families", FamilyKind::ALL.to_vec())?,
        })
    }
}
