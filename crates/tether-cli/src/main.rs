//! The `tether` binary: a framed echo server and a one-shot sender.

use std::net::AddrParseError;
use std::ops::ControlFlow;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tether_config::{CliArgs, Command, Config};
use tether_net::{Client, ClientError, EchoServer, Packet, ServerConfig};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid bind address: {0}")]
    BindAddress(#[from] AddrParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("received {received} of {expected} replies before the deadline")]
    MissingReplies { expected: usize, received: usize },
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map(Ok).unwrap_or_else(Config::default_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let result = match &args.command {
        Command::Serve => serve(&config),
        Command::Send {
            messages,
            wait_secs,
        } => send(&config, messages, Duration::from_secs(*wait_secs)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tether failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the echo server until Ctrl-C.
fn serve(config: &Config) -> Result<(), CliError> {
    let server_config = ServerConfig::try_from(config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = EchoServer::new(server_config);
        tokio::select! {
            result = server.run() => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                server.shutdown();
            }
        }
        Ok::<(), CliError>(())
    })
}

/// Send each message as one frame and print the echoed replies in arrival order.
fn send(config: &Config, messages: &[String], wait: Duration) -> Result<(), CliError> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let client = Client::from_config(config, move |packet: Packet| {
        let _ = tx.send(packet);
        ControlFlow::Continue(())
    });

    client.connect()?;
    for message in messages {
        client.send(message)?;
    }

    let deadline = Instant::now() + wait;
    let mut received = 0;
    while received < messages.len() {
        let Ok(packet) = rx.recv_deadline(deadline) else {
            break;
        };
        println!("{}", String::from_utf8_lossy(packet.as_bytes()));
        received += 1;
    }
    client.disconnect();

    if received < messages.len() {
        return Err(CliError::MissingReplies {
            expected: messages.len(),
            received,
        });
    }
    Ok(())
}
