//! Async framed echo server.
//!
//! Every accepted connection echoes each complete frame back to its sender.
//! Used as the `tether serve` endpoint and as a peer in integration tests.

use std::collections::HashMap;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_config::{Config, DEFAULT_MAX_PAYLOAD_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::framing::{self, FrameConfig, FrameError};
use crate::platform;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Identifier of one accepted connection, unique within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Returned when the connection map is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit of {0} reached")]
pub struct ConnectionLimitReached(pub usize);

#[derive(Default)]
struct Registry {
    next_id: u64,
    peers: HashMap<ConnectionId, SocketAddr>,
}

/// Live connections and their peers, bounded by a capacity.
///
/// [`register`](Self::register) hands out a [`ConnectionSlot`] that frees
/// its entry when dropped, so a connection task cannot leak its place.
pub struct ConnectionMap {
    registry: Mutex<Registry>,
    capacity: usize,
}

impl ConnectionMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity,
        }
    }

    /// Claim a slot for `peer`. IDs start at 1 and are never reused.
    pub fn register(
        self: &Arc<Self>,
        peer: SocketAddr,
    ) -> Result<ConnectionSlot, ConnectionLimitReached> {
        let mut registry = self.registry.lock();
        if registry.peers.len() >= self.capacity {
            return Err(ConnectionLimitReached(self.capacity));
        }
        registry.next_id += 1;
        let id = ConnectionId(registry.next_id);
        registry.peers.insert(id, peer);
        Ok(ConnectionSlot {
            id,
            map: Arc::clone(self),
        })
    }

    pub fn len(&self) -> usize {
        self.registry.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.registry.lock().peers.get(&id).copied()
    }
}

/// A registered connection; deregisters on drop.
pub struct ConnectionSlot {
    id: ConnectionId,
    map: Arc<ConnectionMap>,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.map.registry.lock().peers.remove(&self.id);
    }
}

/// Configuration for [`EchoServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address. Default: `127.0.0.1:7777`.
    pub bind_addr: SocketAddr,
    /// Connections beyond this are closed on accept.
    pub max_connections: usize,
    /// Largest frame payload accepted from a peer.
    pub max_payload_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = tether_config::ServerConfig::default();
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            max_connections: defaults.max_connections,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl TryFrom<&Config> for ServerConfig {
    type Error = AddrParseError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        Ok(Self {
            bind_addr: config.server.bind_address.parse()?,
            max_connections: config.server.max_connections,
            max_payload_size: config.client.max_payload_size,
        })
    }
}

/// Accepts connections and echoes every frame back to its sender.
pub struct EchoServer {
    config: ServerConfig,
    connections: Arc<ConnectionMap>,
    stop: watch::Sender<bool>,
}

impl EchoServer {
    pub fn new(config: ServerConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            config,
            stop,
        }
    }

    /// Connections currently being served.
    pub fn connections(&self) -> &ConnectionMap {
        &self.connections
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> io::Result<()> {
        let listener = platform::create_listener(self.config.bind_addr)?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "echo server listening");
        let frame_config = FrameConfig {
            max_payload_size: self.config.max_payload_size,
        };
        let mut stop = self.stop.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.wait_for(|&stopped| stopped) => break,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // A failed accept (fd exhaustion, aborted handshake) is not fatal.
                    tracing::warn!(error = %e, "accept failed");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                        _ = stop.wait_for(|&stopped| stopped) => break,
                    }
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(%peer, error = %e, "dropping connection");
                continue;
            }

            let slot = match self.connections.register(peer) {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "rejecting connection");
                    continue;
                }
            };
            tracing::info!(id = ?slot.id(), %peer, "accepted connection");

            let frame_config = frame_config.clone();
            let stop = self.stop.subscribe();
            tokio::spawn(async move {
                let result = echo_frames(stream, &frame_config, stop).await;
                match result {
                    Ok(frames) => tracing::info!(id = ?slot.id(), frames, "connection closed"),
                    Err(e) => tracing::warn!(id = ?slot.id(), error = %e, "connection dropped"),
                }
            });
        }

        tracing::info!("echo server stopped");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

/// Echo frames until the peer closes or `stop` fires. Returns frames echoed.
async fn echo_frames(
    mut stream: TcpStream,
    config: &FrameConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<u64, FrameError> {
    let (mut reader, mut writer) = stream.split();
    let mut frames = 0;
    loop {
        let packet = tokio::select! {
            read = framing::read_frame_async(&mut reader, config) => match read {
                Ok(packet) => packet,
                Err(FrameError::ConnectionClosed) => return Ok(frames),
                Err(e) => return Err(e),
            },
            _ = stop.wait_for(|&stopped| stopped) => return Ok(frames),
        };
        tracing::trace!(len = packet.len(), "echoing frame");
        framing::write_frame_async(&mut writer, packet.as_bytes(), config).await?;
        frames += 1;
    }
}
