mod cli;
mod config;
mod model;
mod storage;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point: one command per process, on a single-threaded runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Model(cmd) => {
            let ctx = model::AppContext::from_config(&config)?;
            let mut stdout = std::io::stdout().lock();
            model::handle(cmd, &ctx, &mut stdout).await?
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters; stay quiet by default so stdout is just command output.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
