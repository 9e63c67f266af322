//! Command-line interface for wlprobe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// wlprobe - inspect a Wayland compositor over the raw wire protocol
#[derive(Debug, Parser)]
#[command(name = "wlprobe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "WLPROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "WLPROBE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Display name or absolute socket path (default: $WAYLAND_DISPLAY)
    #[arg(short, long, global = true)]
    pub display: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the globals the compositor advertises
    Globals {
        /// Only show globals of this interface
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Measure round-trip latency to the compositor
    Ping {
        /// Number of round trips
        #[arg(short = 'n', long, default_value = "3")]
        count: u32,
    },

    /// Print the socket that would be used
    Socket,
}
