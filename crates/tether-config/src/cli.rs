//! Command-line arguments shared by tether binaries.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_sync::LockPolicy;

use crate::Config;

/// tether command-line arguments.
///
/// Values given here override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Length-prefixed TCP client and echo server")]
pub struct CliArgs {
    /// Host name to connect to.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to connect to (or to listen on for `serve`).
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Locking strategy: exclusive, timed or none.
    #[arg(long, global = true)]
    pub lock_policy: Option<LockPolicy>,

    /// Log filter (error, warn, info, debug, trace, or a RUST_LOG directive).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to the config directory (overrides the default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// What the binary should do.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a framed echo server.
    Serve,
    /// Connect, send each message as one frame and print the replies.
    Send {
        /// Messages to send, one frame each.
        #[arg(required = true)]
        messages: Vec<String>,
        /// Seconds to wait for all replies.
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.client.host_name = host.clone();
        }
        if let Some(ref port) = args.port {
            self.client.port = port.clone();
            if let Some((ip, _)) = self.server.bind_address.rsplit_once(':') {
                self.server.bind_address = format!("{ip}:{port}");
            }
        }
        if let Some(policy) = args.lock_policy {
            self.client.lock_policy = policy;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
