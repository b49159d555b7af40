use anyhow::Result;
use runtime_probe::{cli, daemon};

#[tokio::main]
async fn main() -> Result<()> {
    let options = cli::parse_from_args();

    runtime_probe::init_logger(options.log_level);

    match daemon::run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
