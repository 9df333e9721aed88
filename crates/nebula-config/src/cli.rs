//! Command-line overrides for the session configuration.

use std::path::PathBuf;

use clap::Args;

use crate::Config;

/// Options shared by every subcommand.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Args, Debug, Default, Clone)]
pub struct CliArgs {
    /// Host to connect to or bind on.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Stream (TCP) port, -1 to disable.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub stream_port: Option<i32>,

    /// Datagram (UDP) port, -1 to disable.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub datagram_port: Option<i32>,

    /// Label for log lines.
    #[arg(long, global = true)]
    pub label: Option<String>,

    /// Loop delay in milliseconds.
    #[arg(long, global = true)]
    pub loop_delay_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.network.host = host.clone();
        }
        if let Some(port) = args.stream_port {
            self.network.stream_port = port;
        }
        if let Some(port) = args.datagram_port {
            self.network.datagram_port = port;
        }
        if let Some(ref label) = args.label {
            self.network.label = label.clone();
        }
        if let Some(delay) = args.loop_delay_ms {
            self.network.loop_delay_ms = delay;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
