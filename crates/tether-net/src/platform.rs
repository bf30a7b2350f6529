//! Socket options and the OS-facing half of dialing and listening.
//!
//! [`SocketOptions`] carries the transport-level knobs (`TCP_NODELAY`,
//! keepalive, dial and write timeouts). Bounded latency for a blocking
//! client comes from these options rather than from the connection engine.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tether_config::SocketConfig;
use tokio::net::TcpListener;

/// Transport options applied to every connected client socket.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Unanswered probes before the connection is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Per-candidate dial timeout. `None` uses the OS default.
    pub connect_timeout: Option<Duration>,
    /// Blocking write timeout. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::from(&SocketConfig::default())
    }
}

impl From<&SocketConfig> for SocketOptions {
    fn from(config: &SocketConfig) -> Self {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            tcp_nodelay: config.tcp_nodelay,
            keepalive_enabled: config.keepalive_enabled,
            keepalive_idle: Duration::from_secs(config.keepalive_idle_secs),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            keepalive_retries: config.keepalive_retries,
            connect_timeout: millis(config.connect_timeout_ms),
            write_timeout: millis(config.write_timeout_ms),
        }
    }
}

/// Open a TCP connection to one candidate address.
pub fn dial(addr: &SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    match options.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(addr, timeout),
        None => TcpStream::connect(addr),
    }
}

/// Apply socket options to a connected stream.
pub fn configure_stream(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.tcp_nodelay)?;
    stream.set_write_timeout(options.write_timeout)?;

    if options.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(options.keepalive_idle)
            .with_interval(options.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(options.keepalive_retries);

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind a tokio listener with `SO_REUSEADDR` (except on Windows).
///
/// Must be called from within a tokio runtime.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if !cfg!(target_os = "windows") {
        socket.set_reuse_address(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
