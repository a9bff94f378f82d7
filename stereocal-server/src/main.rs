use clap::Parser;
use eyre::{Result, WrapErr};
use tracing::debug;

use stereocal_config_data::IntakeConfig;
use stereocal_server::IntakeServer;

#[derive(Debug, Parser)]
#[command(about = "frame intake and calibration orchestration for a stereo camera rig")]
struct Cli {
    /// Configuration file (TOML). Built-in defaults apply when omitted.
    config_file: Option<std::path::PathBuf>,
}

fn initiate_logging() {
    let with_ansi = !cfg!(windows);
    tracing_subscriber::fmt()
        .with_ansi(with_ansi)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    initiate_logging();

    let cli = Cli::parse();
    let cfg = match &cli.config_file {
        Some(fname) => stereocal_config_data::parse_config_file(fname).wrap_err_with(|| {
            format!("reading configuration in file \"{}\"", fname.display())
        })?,
        None => IntakeConfig::default(),
    };
    debug!("{cfg:?}");

    let server = IntakeServer::bind(cfg).await?;
    server.run().await
}
