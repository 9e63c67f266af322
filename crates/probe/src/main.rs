//! wlprobe
//!
//! Connects to a Wayland compositor with the wlwire engine and reports what
//! it finds: advertised globals, round-trip latency, the socket in use.

mod cli;
mod config;
mod probe;

use clap::Parser;
use cli::{Cli, Command};
use color_eyre::eyre::{Result, WrapErr, bail};
use config::Config;
use probe::Session;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use wlwire_protocol::socket;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref())?
        .with_display(cli.display.clone())
        .with_log_level(cli.log_level.clone());

    init_logging(&config.log_level)?;

    match cli.command {
        Command::Globals { interface } => cmd_globals(&config, interface.as_deref()).await,
        Command::Ping { count } => cmd_ping(&config, count).await,
        Command::Socket => cmd_socket(&config),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    // stdout carries the report
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

fn open_session(config: &Config) -> Result<Session> {
    Session::connect(config.display.as_deref(), config.timeout())
        .wrap_err("failed to connect to the compositor")
}

async fn cmd_globals(config: &Config, interface: Option<&str>) -> Result<()> {
    let mut session = open_session(config)?;
    let globals = session
        .list_globals()
        .await
        .wrap_err("failed to enumerate globals")?;

    let shown: Vec<_> = globals
        .iter()
        .filter(|g| interface.is_none_or(|wanted| g.interface == wanted))
        .collect();
    if let Some(wanted) = interface {
        if shown.is_empty() {
            bail!("No global implements {}", wanted);
        }
    }

    println!("{:<6} {:<40} VERSION", "NAME", "INTERFACE");
    for global in shown {
        println!("{:<6} {:<40} {}", global.name, global.interface, global.version);
    }
    Ok(())
}

async fn cmd_ping(config: &Config, count: u32) -> Result<()> {
    if count == 0 {
        bail!("Count must be at least 1");
    }
    let mut session = open_session(config)?;
    let samples = session.ping(count).await.wrap_err("round trip failed")?;

    for (seq, sample) in samples.iter().enumerate() {
        println!("roundtrip {}: {:.3} ms", seq + 1, millis(*sample));
    }

    let min = samples.iter().min().copied().unwrap_or_default();
    let max = samples.iter().max().copied().unwrap_or_default();
    let total: Duration = samples.iter().sum();
    let avg = total / count;
    println!(
        "min/avg/max = {:.3}/{:.3}/{:.3} ms",
        millis(min),
        millis(avg),
        millis(max)
    );
    info!(count, "ping finished");
    Ok(())
}

fn cmd_socket(config: &Config) -> Result<()> {
    if let Ok(fd) = std::env::var(socket::SOCKET_ENV_VAR) {
        if config.display.is_none() {
            println!("inherited descriptor {} (${})", fd, socket::SOCKET_ENV_VAR);
            return Ok(());
        }
    }

    let path = socket::socket_path(config.display.as_deref())
        .wrap_err("cannot determine the socket path")?;
    let state = if path.exists() { "present" } else { "missing" };
    println!("{} ({})", path.display(), state);
    Ok(())
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
