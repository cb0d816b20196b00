// smp-server: start the SMP broker from a config file

use anyhow::Result;
use clap::Parser;
use smq::server::{ServerConfig, ServerInstance};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "smp-server")]
#[command(about = "SMP message broker")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let result = std::panic::catch_unwind(|| run(config));
    match result {
        Ok(Ok(())) => ExitCode::from(0),
        Ok(Err(e)) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::from(1)
        }
        Err(_) => ExitCode::from(2),
    }
}

fn run(config: ServerConfig) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let server = ServerInstance::start(config).await?;
        tracing::info!(
            addr = %server.tcp_addr(),
            key_hash = %server.key_hash(),
            "server running, press ctrl-c to stop"
        );
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        server.shutdown();
        Ok(())
    })
}
