//! Configuration system for tether.
//!
//! Settings persist to disk as `config.ron`, can be overridden from the
//! command line via clap, and tolerate missing or unknown fields.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, Command};
pub use config::{
    ClientConfig, Config, DEFAULT_HOST_NAME, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT, LogConfig,
    ServerConfig, SocketConfig,
};
pub use error::ConfigError;
