// smp-agent: start the SMP agent from a config file

use anyhow::Result;
use clap::Parser;
use smq::agent::{Agent, AgentConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "smp-agent")]
#[command(about = "SMP client agent for duplex connections")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AgentConfig::load(&cli.config) {
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

fn run(config: AgentConfig) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let _agent = Agent::start(config).await?;
        tracing::info!("agent running, press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        Ok(())
    })
}
