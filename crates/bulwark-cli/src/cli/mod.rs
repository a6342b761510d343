//! CLI command definitions for the `bwk` binary.

pub mod generate;
pub mod metrics;
pub mod models;
pub mod probe;
pub mod status;
pub mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilient access to your LLM providers.
#[derive(Parser)]
#[command(name = "bwk", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.bulwark/bulwark.toml).
    #[arg(long, global = true, env = "BULWARK_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Also export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show lifecycle, circuit and health state of every provider.
    Status,

    /// Run a health probe now.
    Probe {
        /// Provider to probe (all when omitted).
        name: Option<String>,
    },

    /// List the models each provider serves.
    Models {
        /// Provider to query (all when omitted).
        name: Option<String>,
    },

    /// Send a prompt to a provider.
    #[command(alias = "gen")]
    Generate {
        /// Prompt text.
        prompt: String,

        /// Provider to use (first configured provider when omitted).
        #[arg(short, long)]
        provider: Option<String>,

        /// Optional system message.
        #[arg(long)]
        system: Option<String>,

        /// Fall back to other providers when the first one fails.
        #[arg(long)]
        fallback: bool,
    },

    /// Show retry, circuit breaker and health counters.
    Metrics,

    /// Run the background health monitor and print status changes.
    Watch {
        /// Seconds between probe rounds (overrides the config file).
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,

        /// Stop after this many seconds (runs until Ctrl+C when omitted).
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },
}

/// Green/yellow/red cell color for a health status string.
pub(crate) fn status_color(status: &str) -> comfy_table::Color {
    match status {
        "healthy" | "active" | "closed" => comfy_table::Color::Green,
        "degraded" | "half_open" => comfy_table::Color::Yellow,
        "unhealthy" | "open" | "shutdown" => comfy_table::Color::Red,
        _ => comfy_table::Color::DarkGrey,
    }
}

/// Shorten `text` to `max` characters with a trailing ellipsis.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
