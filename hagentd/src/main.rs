//! hagentd: cluster agent daemon.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "hagentd", version)]
#[command(about = "Cluster agent daemon")]
struct Cli {
    /// Configuration file (or use HAGENT_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on: `*`, a host name or IP, or `unix:<path>`.
    /// Repeat for several; replaces `listen_addresses` from the file.
    #[arg(long = "listen", value_name = "ADDR")]
    listen: Vec<String>,

    /// TCP port, overriding the configuration file
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    tracing::info!(
        git = hagent_build_info::git_label(),
        built = hagent_build_info::build_timestamp(),
        "{}",
        hagent_build_info::formatted_banner("hagentd", DAEMON_VERSION)
    );

    run(cli)
}

#[cfg(unix)]
fn run(cli: Cli) -> Result<()> {
    use std::sync::Arc;

    use anyhow::Context;
    use hagent_net::Latch;
    use hagentd::{AgentConfig, CatalogConfiguration, Dispatcher, ScriptLifecycle, Services};
    use tracing::{debug, info};

    let mut config = AgentConfig::load(cli.config.as_deref())?;
    config.override_with(&cli.listen, cli.port);
    debug!(?config, "effective configuration");

    let addresses = config.parsed_listen_addresses()?;
    let listeners = hagent_net::listen(&addresses, &config.listen_options())
        .context("Could not open any listening socket")?;

    let latch = Arc::new(Latch::new().context("Failed to create dispatcher latch")?);
    hagentd::signals::install(latch.clone())?;

    let services = Services::new(
        ScriptLifecycle::new(config.scripts_dir.clone()),
        CatalogConfiguration::from_config(&config),
    );
    let dispatcher = Dispatcher::new(listeners, latch, services, config.max_parameter_length)?;
    dispatcher.run()?;

    info!("hagentd exiting");
    Ok(())
}

#[cfg(not(unix))]
fn run(_cli: Cli) -> Result<()> {
    anyhow::bail!("hagentd forks a process per connection and only runs on Unix")
}
