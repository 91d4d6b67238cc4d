//! Orchestra CLI: run servers and listeners, send and watch messages.

mod cli;
mod cmd;

use clap::Parser;
use cli::{Cli, Commands};

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = orchestra_wire::config::load_config(cli.config.as_deref());
    if let Some(port) = cli.port {
        config.port = port;
    }
    init_tracing_stderr(&config.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Commands::Serve => cmd::serve::run(config).await,
            Commands::Watch { role } => cmd::client::watch(config, role).await,
            Commands::Send { role, message } => cmd::client::send(config, role, message).await,
            Commands::Directory { follow } => cmd::client::directory(config, follow).await,
            Commands::Listen => cmd::listen::run(config).await,
        }
    })
}
