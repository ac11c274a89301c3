//! hagentctl: send one command to the cluster agent and print its reply.

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hagent_wire::protocol::{Component, LifecycleAction};
use hagentd_client::AgentClient;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hagentctl", version)]
#[command(about = "Control the cluster agent daemon")]
struct Cli {
    /// Agent address: `host:port` or `unix:<path>`
    #[arg(long, env = "HAGENT_ADDRESS", default_value = "localhost:8670")]
    address: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Start(LifecycleArgs),
    Stop(LifecycleArgs),
    Restart(LifecycleArgs),
    Install(LifecycleArgs),
    Uninstall(LifecycleArgs),
    Configure(LifecycleArgs),
    /// Set one configuration parameter of a component
    Set {
        component: Component,
        name: String,
        value: String,
    },
}

#[derive(clap::Args, Debug)]
struct LifecycleArgs {
    component: Component,
    /// Extra arguments handed to the component's script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("hagentctl: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<String> {
    let mut client = AgentClient::connect(&cli.address)?;

    let text = match cli.command {
        Command::Set {
            component,
            name,
            value,
        } => client
            .set_parameter(component, &name, &value)
            .with_context(|| format!("Failed to set {name} for {component}"))?,
        Command::Start(args) => lifecycle(&mut client, LifecycleAction::Start, args)?,
        Command::Stop(args) => lifecycle(&mut client, LifecycleAction::Stop, args)?,
        Command::Restart(args) => lifecycle(&mut client, LifecycleAction::Restart, args)?,
        Command::Install(args) => lifecycle(&mut client, LifecycleAction::Install, args)?,
        Command::Uninstall(args) => lifecycle(&mut client, LifecycleAction::Uninstall, args)?,
        Command::Configure(args) => lifecycle(&mut client, LifecycleAction::Configure, args)?,
    };

    if let Err(err) = client.finish() {
        debug!("could not end session cleanly: {}", err);
    }
    Ok(text)
}

fn lifecycle(client: &mut AgentClient, action: LifecycleAction, args: LifecycleArgs) -> Result<String> {
    let extra: Vec<&str> = args.args.iter().map(String::as_str).collect();
    client
        .lifecycle(action, args.component, &extra)
        .with_context(|| format!("Failed to {action} {}", args.component))
}
