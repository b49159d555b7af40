use std::{env, path::PathBuf};

use clap::Parser;

pub const NAME: &str = "runtime-probed";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(version = crate::metadata::VERSION)]
#[clap(about = "Runtime probe daemon")]
pub struct DaemonOpts {
    /// Path of the INI configuration file
    #[clap(long = "config")]
    pub config_file: Option<PathBuf>,
    /// Log level, overridden by RUST_LOG
    #[clap(long)]
    pub log_level: Option<log::LevelFilter>,
}

pub fn parse_from_args() -> DaemonOpts {
    DaemonOpts::parse()
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One log entry for the whole error chain, with the backtrace if debugging.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
