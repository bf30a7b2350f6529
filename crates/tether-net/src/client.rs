//! Blocking TCP client with a dedicated receive thread.
//!
//! A [`Client`] resolves its configured host and port, dials candidates in
//! order, and once connected runs a named `tether-recv` thread that reads
//! frames and hands each one to the application's [`PacketHandler`].
//! Any thread may call [`Client::send`] concurrently; frames never
//! interleave because senders serialize on the send lock. Lifecycle and
//! endpoint changes serialize on a separate general lock so a blocked
//! sender cannot stall [`Client::disconnect`].
//!
//! State changes are broadcast via a [`watch`] channel so any number of
//! observers can react without polling.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tether_config::{Config, DEFAULT_HOST_NAME, DEFAULT_PORT};
use tether_sync::{Lock, LockPolicy, ScopedLock};
use tokio::sync::watch;

use crate::error::ClientError;
use crate::framing::{self, FrameConfig, FrameError};
use crate::packet::Packet;
use crate::platform::{self, SocketOptions};

/// Name given to every receive thread.
pub const RECEIVE_THREAD_NAME: &str = "tether-recv";

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or cleanly disconnected.
    Idle,
    /// Resolving the endpoint and dialing candidates.
    Connecting,
    /// Socket live, receive thread running.
    Connected,
    /// Teardown in progress.
    Disconnecting,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Idle`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Idle);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveExit {
    /// The peer (or a local disconnect) closed the stream between frames.
    Closed,
    /// The handler asked the loop to stop.
    Stopped,
    /// Transport error or truncated frame; the connection was torn down.
    Failed,
}

/// Application callback invoked on the receive thread.
///
/// Closures `Fn(Packet) -> ControlFlow<()>` implement this trait.
pub trait PacketHandler: Send + Sync + 'static {
    /// Handle one complete frame. [`ControlFlow::Break`] ends the receive loop.
    fn on_packet(&self, packet: Packet) -> ControlFlow<()>;

    /// Called once when the receive loop ends, after any teardown it caused.
    fn on_receive_end(&self, exit: ReceiveExit) {
        let _ = exit;
    }
}

impl<F> PacketHandler for F
where
    F: Fn(Packet) -> ControlFlow<()> + Send + Sync + 'static,
{
    fn on_packet(&self, packet: Packet) -> ControlFlow<()> {
        self(packet)
    }
}

/// Framing and transport options for a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub frame: FrameConfig,
    pub socket: SocketOptions,
}

#[derive(Debug, Clone)]
struct Endpoint {
    host_name: String,
    port: String,
}

#[derive(Default)]
struct Session {
    /// Bumped on every successful connect; a receive thread only tears down its own session.
    epoch: u64,
    stream: Option<Arc<TcpStream>>,
    resolved: Vec<SocketAddr>,
    peer: Option<SocketAddr>,
    receiver: Option<JoinHandle<()>>,
    last_exit: Option<ReceiveExit>,
}

struct Shared {
    endpoint: Mutex<Endpoint>,
    session: Mutex<Session>,
    state: ConnectionStateWatch,
    general_lock: Box<dyn Lock>,
    send_lock: Box<dyn Lock>,
    handler: Box<dyn PacketHandler>,
    options: ClientOptions,
}

/// One outbound framed TCP session.
///
/// `Client` is deliberately neither `Clone` nor `Copy`: two handles sharing
/// one socket under independent locks would break frame atomicity. Share it
/// by reference or through an `Arc` instead.
pub struct Client {
    shared: Arc<Shared>,
}

static_assertions::assert_impl_all!(Client: Send, Sync);
static_assertions::assert_not_impl_any!(Client: Clone, Copy);

impl Client {
    /// Create an idle client. Empty `host_name`/`port` fall back to the defaults.
    pub fn new(
        host_name: &str,
        port: &str,
        lock_policy: LockPolicy,
        handler: impl PacketHandler,
    ) -> Self {
        Self::with_options(
            host_name,
            port,
            lock_policy,
            ClientOptions::default(),
            handler,
        )
    }

    /// Create an idle client with explicit framing and socket options.
    pub fn with_options(
        host_name: &str,
        port: &str,
        lock_policy: LockPolicy,
        options: ClientOptions,
        handler: impl PacketHandler,
    ) -> Self {
        let endpoint = Endpoint {
            host_name: or_default(host_name, DEFAULT_HOST_NAME),
            port: or_default(port, DEFAULT_PORT),
        };
        Self {
            shared: Arc::new(Shared {
                endpoint: Mutex::new(endpoint),
                session: Mutex::new(Session::default()),
                state: ConnectionStateWatch::new(),
                general_lock: lock_policy.create(),
                send_lock: lock_policy.create(),
                handler: Box::new(handler),
                options,
            }),
        }
    }

    /// Create an idle client from the `client` and `socket` config sections.
    pub fn from_config(config: &Config, handler: impl PacketHandler) -> Self {
        let options = ClientOptions {
            frame: FrameConfig {
                max_payload_size: config.client.max_payload_size,
            },
            socket: SocketOptions::from(&config.socket),
        };
        Self::with_options(
            &config.client.host_name,
            &config.client.port,
            config.client.lock_policy,
            options,
            handler,
        )
    }

    /// Resolve, dial and start the receive thread.
    ///
    /// Returns `Ok` immediately if already connected. On failure the client
    /// is back to [`ConnectionState::Idle`]; nothing is retried.
    pub fn connect(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        let _guard = ScopedLock::new(shared.general_lock.as_ref());
        if shared.session.lock().stream.is_some() {
            return Ok(());
        }

        let endpoint = shared.endpoint.lock().clone();
        shared.state.set(ConnectionState::Connecting);

        let (stream, reader) = match shared.establish(&endpoint) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(
                    host = %endpoint.host_name,
                    port = %endpoint.port,
                    error = %e,
                    "connect failed"
                );
                shared.session.lock().resolved.clear();
                shared.state.set(ConnectionState::Idle);
                return Err(e);
            }
        };

        let stream = Arc::new(stream);
        let epoch = {
            let mut session = shared.session.lock();
            session.epoch += 1;
            session.peer = stream.peer_addr().ok();
            session.stream = Some(Arc::clone(&stream));
            session.last_exit = None;
            session.epoch
        };
        shared.state.set(ConnectionState::Connected);

        let thread_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(RECEIVE_THREAD_NAME.into())
            .spawn(move || receive_loop(thread_shared, reader, epoch));

        match spawned {
            Ok(handle) => {
                shared.session.lock().receiver = Some(handle);
                tracing::info!(
                    host = %endpoint.host_name,
                    port = %endpoint.port,
                    peer = ?stream.peer_addr().ok(),
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                {
                    let mut session = shared.session.lock();
                    session.stream = None;
                    session.peer = None;
                    session.resolved.clear();
                }
                let _ = stream.shutdown(Shutdown::Both);
                shared.state.set(ConnectionState::Idle);
                Err(ClientError::Spawn(e))
            }
        }
    }

    /// Tear the connection down. Idempotent; safe from any thread.
    ///
    /// Waits for the receive thread to finish unless called from it.
    pub fn disconnect(&self) {
        if let Some(receiver) = self.shared.teardown(None) {
            join_receiver(receiver);
        }
    }

    /// Send `payload` as one frame.
    ///
    /// Returns the number of payload bytes written. A transport failure
    /// tears down the session the frame was written to (never a session
    /// opened since) before returning [`ClientError::Send`], which carries
    /// the bytes that made it out. An oversized payload is rejected without
    /// touching the connection.
    pub fn send(&self, payload: impl AsRef<[u8]>) -> Result<usize, ClientError> {
        let payload = payload.as_ref();
        let send_guard = ScopedLock::new(self.shared.send_lock.as_ref());
        let (epoch, stream) = {
            let session = self.shared.session.lock();
            let stream = session.stream.clone().ok_or(ClientError::NotConnected)?;
            (session.epoch, stream)
        };

        let mut writer: &TcpStream = &stream;
        let written = framing::write_frame(&mut writer, payload, &self.shared.options.frame);
        // Only the frame write is serialized; teardown may join a receive
        // thread whose handler is itself waiting to send.
        drop(send_guard);

        let (sent, source) = match written {
            Ok(sent) => {
                tracing::trace!(len = sent, "frame sent");
                return Ok(sent);
            }
            Err(FrameError::PayloadTooLarge { size, max }) => {
                return Err(ClientError::PayloadTooLarge { size, max });
            }
            Err(FrameError::PartialWrite { written, source }) => (written, source),
            Err(other) => (0, io::Error::other(other)),
        };

        tracing::warn!(
            sent,
            len = payload.len(),
            error = %source,
            "send failed, disconnecting"
        );
        drop(stream);
        // A newer session may already be live; leave it alone.
        if let Some(receiver) = self.shared.teardown(Some(epoch)) {
            join_receiver(receiver);
        }
        Err(ClientError::Send { sent, source })
    }

    /// Whether a connection is live.
    ///
    /// Stays `true` after an orderly close by the peer until
    /// [`disconnect`](Self::disconnect) is called.
    pub fn is_connected(&self) -> bool {
        self.shared.state.current() == ConnectionState::Connected
    }

    /// Change the host name. Refused while connected; empty selects the default.
    pub fn set_host_name(&self, host_name: &str) -> Result<(), ClientError> {
        let _guard = ScopedLock::new(self.shared.general_lock.as_ref());
        if self.shared.session.lock().stream.is_some() {
            return Err(ClientError::Connected);
        }
        self.shared.endpoint.lock().host_name = or_default(host_name, DEFAULT_HOST_NAME);
        Ok(())
    }

    /// Change the port. Refused while connected; empty selects the default.
    pub fn set_port(&self, port: &str) -> Result<(), ClientError> {
        let _guard = ScopedLock::new(self.shared.general_lock.as_ref());
        if self.shared.session.lock().stream.is_some() {
            return Err(ClientError::Connected);
        }
        self.shared.endpoint.lock().port = or_default(port, DEFAULT_PORT);
        Ok(())
    }

    pub fn host_name(&self) -> String {
        self.shared.endpoint.lock().host_name.clone()
    }

    pub fn port(&self) -> String {
        self.shared.endpoint.lock().port.clone()
    }

    pub fn lock_policy(&self) -> LockPolicy {
        self.shared.general_lock.policy()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The address actually dialled, while connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.session.lock().peer
    }

    /// Candidate addresses from the last resolution, held while connected.
    pub fn resolved_addrs(&self) -> Vec<SocketAddr> {
        self.shared.session.lock().resolved.clone()
    }

    /// How the most recent receive loop ended, if it has.
    pub fn last_receive_exit(&self) -> Option<ReceiveExit> {
        self.shared.session.lock().last_exit
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = self.shared.endpoint.lock();
        f.debug_struct("Client")
            .field("host_name", &endpoint.host_name)
            .field("port", &endpoint.port)
            .field("lock_policy", &self.shared.general_lock.policy())
            .field("state", &self.shared.state.current())
            .finish()
    }
}

impl Shared {
    /// Resolve and dial; returns the stream plus a second handle for the receive thread.
    fn establish(&self, endpoint: &Endpoint) -> Result<(TcpStream, TcpStream), ClientError> {
        let candidates = resolve(endpoint)?;
        self.session.lock().resolved = candidates.clone();

        let mut last_error = None;
        let mut connected = None;
        for addr in &candidates {
            match platform::dial(addr, &self.options.socket) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "candidate refused");
                    last_error = Some(e);
                }
            }
        }

        let Some(stream) = connected else {
            return Err(ClientError::Unreachable {
                host: endpoint.host_name.clone(),
                port: endpoint.port.clone(),
                attempts: candidates.len(),
                source: last_error
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no candidates")),
            });
        };

        platform::configure_stream(&stream, &self.options.socket).map_err(ClientError::Socket)?;
        let reader = stream.try_clone().map_err(ClientError::Socket)?;
        Ok((stream, reader))
    }

    /// Close the socket and return the receive thread handle for joining.
    ///
    /// With `epoch` set (receive thread), only that session is torn down.
    fn teardown(&self, epoch: Option<u64>) -> Option<JoinHandle<()>> {
        let _guard = ScopedLock::new(self.general_lock.as_ref());
        let mut session = self.session.lock();
        if epoch.is_some_and(|e| e != session.epoch) {
            return None;
        }

        session.resolved.clear();
        let Some(stream) = session.stream.take() else {
            return session.receiver.take();
        };

        self.state.set(ConnectionState::Disconnecting);
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            tracing::warn!(error = %e, "shutdown of the send side failed");
        }
        // The receive thread blocks on its own handle; this wakes it.
        let _ = stream.shutdown(Shutdown::Read);
        drop(stream);
        session.peer = None;
        self.state.set(ConnectionState::Idle);
        tracing::info!("disconnected");

        session.receiver.take()
    }
}

fn receive_loop(shared: Arc<Shared>, mut reader: TcpStream, epoch: u64) {
    let config = &shared.options.frame;
    let exit = loop {
        match framing::read_frame(&mut reader, config) {
            Ok(packet) => {
                tracing::trace!(len = packet.len(), "dispatching frame");
                if shared.handler.on_packet(packet).is_break() {
                    tracing::debug!("handler stopped the receive loop");
                    break ReceiveExit::Stopped;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                tracing::debug!("connection closing");
                break ReceiveExit::Closed;
            }
            Err(e) => {
                tracing::warn!(error = %e, "receive failed");
                break ReceiveExit::Failed;
            }
        }
    };

    {
        let mut session = shared.session.lock();
        if session.epoch == epoch {
            session.last_exit = Some(exit);
        }
    }
    if exit == ReceiveExit::Failed
        && let Some(receiver) = shared.teardown(Some(epoch))
    {
        join_receiver(receiver);
    }
    shared.handler.on_receive_end(exit);
}

fn join_receiver(receiver: JoinHandle<()>) {
    // The receive thread tearing down its own session just lets itself finish.
    if receiver.thread().id() == thread::current().id() {
        return;
    }
    if receiver.join().is_err() {
        tracing::warn!("receive thread panicked");
    }
}

fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, ClientError> {
    let port: u16 = endpoint
        .port
        .parse()
        .map_err(|_| ClientError::InvalidPort(endpoint.port.clone()))?;
    let resolve_error = |source| ClientError::Resolve {
        host: endpoint.host_name.clone(),
        port: endpoint.port.clone(),
        source,
    };

    let candidates: Vec<SocketAddr> = (endpoint.host_name.as_str(), port)
        .to_socket_addrs()
        .map_err(resolve_error)?
        .collect();
    if candidates.is_empty() {
        return Err(resolve_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses",
        )));
    }
    Ok(candidates)
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{read_frame, write_frame};
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::Weak;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, PartialEq)]
    enum Event {
        Packet(Vec<u8>),
        End(ReceiveExit),
    }

    struct Collector {
        tx: Sender<Event>,
        stop_after: Option<usize>,
        seen: Mutex<usize>,
    }

    impl PacketHandler for Collector {
        fn on_packet(&self, packet: Packet) -> ControlFlow<()> {
            let _ = self.tx.send(Event::Packet(packet.into_bytes()));
            let mut seen = self.seen.lock();
            *seen += 1;
            match self.stop_after {
                Some(limit) if *seen >= limit => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }

        fn on_receive_end(&self, exit: ReceiveExit) {
            let _ = self.tx.send(Event::End(exit));
        }
    }

    fn collector(stop_after: Option<usize>) -> (Collector, Receiver<Event>) {
        let (tx, rx) = unbounded();
        let handler = Collector {
            tx,
            stop_after,
            seen: Mutex::new(0),
        };
        (handler, rx)
    }

    fn client_for(addr: SocketAddr, policy: LockPolicy) -> (Client, Receiver<Event>) {
        let (handler, rx) = collector(None);
        let client = Client::new("127.0.0.1", &addr.port().to_string(), policy, handler);
        (client, rx)
    }

    /// Helper: a peer that echoes every frame back on every accepted connection.
    fn echo_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                thread::spawn(move || {
                    let config = FrameConfig::default();
                    while let Ok(packet) = read_frame(&mut stream, &config) {
                        if write_frame(&mut stream, packet.as_bytes(), &config).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Helper: a peer that runs `script` on the first accepted connection.
    fn scripted_peer(script: impl FnOnce(TcpStream) + Send + 'static) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                script(stream);
            }
        });
        addr
    }

    /// Helper: a peer that accepts every connection and never reads from it.
    fn silent_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                held.push(stream);
            }
        });
        addr
    }

    fn bulk_options() -> ClientOptions {
        ClientOptions {
            frame: FrameConfig {
                max_payload_size: 128 << 20,
            },
            ..Default::default()
        }
    }

    fn closed_port() -> SocketAddr {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    fn next_end(rx: &Receiver<Event>) -> ReceiveExit {
        loop {
            match rx.recv_timeout(WAIT).expect("receive loop did not end") {
                Event::End(exit) => return exit,
                Event::Packet(_) => continue,
            }
        }
    }

    #[test]
    fn test_ping_is_echoed_to_handler() {
        let (client, rx) = client_for(echo_peer(), LockPolicy::Exclusive);
        client.connect().unwrap();
        assert!(client.is_connected());

        assert_eq!(client.send("ping").unwrap(), 4);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(b"ping".to_vec()));
    }

    #[test]
    fn test_zero_length_frame_is_delivered() {
        let (client, rx) = client_for(echo_peer(), LockPolicy::Timed);
        client.connect().unwrap();

        assert_eq!(client.send([0u8; 0]).unwrap(), 0);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(Vec::new()));
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let (client, rx) = client_for(echo_peer(), LockPolicy::Exclusive);
        client.connect().unwrap();

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 253) as u8).collect();
        assert_eq!(client.send(&payload).unwrap(), payload.len());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(payload));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (client, _rx) = client_for(closed_port(), LockPolicy::Exclusive);
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());

        let (client, _rx) = client_for(echo_peer(), LockPolicy::Exclusive);
        client.connect().unwrap();
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(client.peer_addr().is_none());
        assert!(client.resolved_addrs().is_empty());
    }

    #[test]
    fn test_disconnect_joins_receive_thread() {
        let (client, rx) = client_for(echo_peer(), LockPolicy::Exclusive);
        client.connect().unwrap();
        client.disconnect();

        // The receive loop reported its end before disconnect returned.
        let events: Vec<Event> = rx.try_iter().collect();
        assert!(
            events.iter().any(|e| matches!(e, Event::End(_))),
            "receive loop still running after disconnect: {events:?}"
        );
    }

    #[test]
    fn test_connect_when_connected_is_noop() {
        let (client, _rx) = client_for(echo_peer(), LockPolicy::Exclusive);
        client.connect().unwrap();
        let peer = client.peer_addr();
        assert!(peer.is_some());

        client.connect().unwrap();
        assert_eq!(client.peer_addr(), peer);
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let (client, rx) = client_for(echo_peer(), LockPolicy::Timed);
        client.connect().unwrap();
        client.disconnect();
        let _ = next_end(&rx);

        client.connect().unwrap();
        client.send("again").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(b"again".to_vec()));
    }

    #[test]
    fn test_endpoint_guarded_while_connected() {
        let addr = echo_peer();
        let (client, _rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();

        assert!(matches!(client.set_host_name("example.com"), Err(ClientError::Connected)));
        assert!(matches!(client.set_port("1"), Err(ClientError::Connected)));
        assert_eq!(client.host_name(), "127.0.0.1");
        assert_eq!(client.port(), addr.port().to_string());

        client.disconnect();
        client.set_host_name("localhost").unwrap();
        client.set_port("9000").unwrap();
        assert_eq!(client.host_name(), "localhost");
        assert_eq!(client.port(), "9000");
    }

    #[test]
    fn test_empty_endpoint_falls_back_to_defaults() {
        let client = Client::new("", "", LockPolicy::None, |_: Packet| ControlFlow::Continue(()));
        assert_eq!(client.host_name(), DEFAULT_HOST_NAME);
        assert_eq!(client.port(), DEFAULT_PORT);

        client.set_host_name("10.0.0.1").unwrap();
        client.set_host_name("").unwrap();
        assert_eq!(client.host_name(), DEFAULT_HOST_NAME);
    }

    #[test]
    fn test_concurrent_sends_never_interleave() {
        const SENDERS: usize = 8;
        const FRAMES: usize = 50;

        for policy in [LockPolicy::Exclusive, LockPolicy::Timed] {
            let (frames_tx, frames_rx) = unbounded();
            let addr = scripted_peer(move |mut stream| {
                let config = FrameConfig::default();
                while let Ok(packet) = read_frame(&mut stream, &config) {
                    let _ = frames_tx.send(packet.into_bytes());
                }
            });

            let (client, _rx) = client_for(addr, policy);
            let client = Arc::new(client);
            client.connect().unwrap();

            let senders: Vec<_> = (0..SENDERS)
                .map(|id| {
                    let client = Arc::clone(&client);
                    thread::spawn(move || {
                        for n in 0..FRAMES {
                            let frame = vec![id as u8; 1 + (n * 97) % 4000];
                            assert_eq!(client.send(&frame).unwrap(), frame.len());
                        }
                    })
                })
                .collect();
            for sender in senders {
                sender.join().unwrap();
            }

            for _ in 0..SENDERS * FRAMES {
                let frame = frames_rx.recv_timeout(WAIT).unwrap();
                assert!(!frame.is_empty());
                assert!(
                    frame.iter().all(|&b| b == frame[0]),
                    "frame from sender {} was corrupted under {policy}",
                    frame[0]
                );
            }
        }
    }

    #[test]
    fn test_orderly_close_ends_loop_without_teardown() {
        let addr = scripted_peer(|stream| {
            stream.shutdown(Shutdown::Write).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        let (client, rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();

        assert_eq!(next_end(&rx), ReceiveExit::Closed);
        assert_eq!(client.last_receive_exit(), Some(ReceiveExit::Closed));
        assert!(client.is_connected(), "orderly close leaves cleanup to the caller");

        client.disconnect();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_truncated_frame_is_discarded_and_tears_down() {
        let addr = scripted_peer(|mut stream| {
            stream.write_all(&100u32.to_le_bytes()).unwrap();
            stream.write_all(&[7u8; 10]).unwrap();
        });
        let (client, rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::End(ReceiveExit::Failed));
        assert!(!client.is_connected());
        assert_eq!(client.last_receive_exit(), Some(ReceiveExit::Failed));
    }

    #[test]
    fn test_reset_mid_frame_is_failure() {
        let addr = scripted_peer(|mut stream| {
            stream.write_all(&100u32.to_le_bytes()).unwrap();
            stream.write_all(&[7u8; 10]).unwrap();
            thread::sleep(Duration::from_millis(50));
            socket2::SockRef::from(&stream)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(stream);
        });
        let (client, rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();

        assert_eq!(next_end(&rx), ReceiveExit::Failed);
        assert!(!client.is_connected());
        assert_eq!(client.last_receive_exit(), Some(ReceiveExit::Failed));
    }

    #[test]
    fn test_oversized_inbound_frame_is_transport_error() {
        let addr = scripted_peer(|mut stream| {
            stream.write_all(&u32::MAX.to_le_bytes()).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        let (client, rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();

        assert_eq!(next_end(&rx), ReceiveExit::Failed);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_handler_can_stop_the_loop() {
        let addr = scripted_peer(|mut stream| {
            let config = FrameConfig::default();
            write_frame(&mut stream, b"first", &config).unwrap();
            write_frame(&mut stream, b"second", &config).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        let (handler, rx) = collector(Some(1));
        let port = addr.port().to_string();
        let client = Client::new("127.0.0.1", &port, LockPolicy::Exclusive, handler);
        client.connect().unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(b"first".to_vec()));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::End(ReceiveExit::Stopped));
        assert!(client.is_connected());
    }

    #[test]
    fn test_connect_refused_returns_to_idle() {
        let (client, _rx) = client_for(closed_port(), LockPolicy::Exclusive);
        let err = client.connect().unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { attempts: 1, .. }));
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(client.resolved_addrs().is_empty());
    }

    #[test]
    fn test_invalid_port_rejected() {
        let client = Client::new("127.0.0.1", "http", LockPolicy::Exclusive, |_: Packet| {
            ControlFlow::Continue(())
        });
        assert!(matches!(client.connect(), Err(ClientError::InvalidPort(p)) if p == "http"));
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_send_requires_connection() {
        let (client, _rx) = client_for(closed_port(), LockPolicy::Exclusive);
        assert!(matches!(client.send("x"), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_send_failure_disconnects() {
        let addr = scripted_peer(|stream| {
            socket2::SockRef::from(&stream)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(stream);
        });
        let (client, _rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();

        let payload = vec![1u8; 64 * 1024];
        let mut failure = None;
        for _ in 0..200 {
            match client.send(&payload) {
                Ok(_) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let failure = failure.expect("send to a reset peer never failed");
        assert!(
            matches!(failure, ClientError::Send { .. } | ClientError::NotConnected),
            "unexpected error: {failure}"
        );
        assert!(failure.bytes_sent() <= payload.len());
        assert!(!client.is_connected());
    }

    #[test]
    fn test_stale_send_failure_spares_new_session() {
        for _ in 0..5 {
            let (handler, _rx) = collector(None);
            let port = silent_peer().port().to_string();
            let client = Arc::new(Client::with_options(
                "127.0.0.1",
                &port,
                LockPolicy::Exclusive,
                bulk_options(),
                handler,
            ));
            client.connect().unwrap();

            let sender = {
                let client = Arc::clone(&client);
                thread::spawn(move || client.send(vec![0u8; 64 << 20]))
            };
            // Give the sender time to fill the socket buffers and block.
            thread::sleep(Duration::from_millis(200));
            client.disconnect();
            client.connect().unwrap();

            let stale = sender.join().unwrap();
            assert!(matches!(stale, Err(ClientError::Send { .. })), "{stale:?}");
            assert!(
                client.is_connected(),
                "send failure on the old session closed the new one"
            );
            client.disconnect();
        }
    }

    #[test]
    fn test_failed_send_with_replying_handler_returns() {
        let addr = scripted_peer(|mut stream| {
            // Never reads; pushes one request once the client is stuck sending.
            thread::sleep(Duration::from_millis(200));
            write_frame(&mut stream, b"request", &FrameConfig::default()).unwrap();
            thread::sleep(Duration::from_secs(10));
        });
        let options = ClientOptions {
            socket: SocketOptions {
                write_timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
            ..bulk_options()
        };

        let (replied_tx, replied_rx) = unbounded();
        let port = addr.port().to_string();
        let client = Arc::new_cyclic(|weak: &Weak<Client>| {
            let weak = weak.clone();
            let handler = move |packet: Packet| {
                if let Some(client) = weak.upgrade() {
                    let _ = replied_tx.send(client.send(packet.as_bytes()).is_ok());
                }
                ControlFlow::Continue(())
            };
            Client::with_options("127.0.0.1", &port, LockPolicy::Exclusive, options, handler)
        });
        client.connect().unwrap();

        let (done_tx, done_rx) = unbounded();
        let sender = Arc::clone(&client);
        thread::spawn(move || {
            let _ = done_tx.send(sender.send(vec![0u8; 64 << 20]));
        });

        let result = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("failed send never returned");
        assert!(matches!(result, Err(ClientError::Send { .. })), "{result:?}");
        assert!(!client.is_connected());
        assert!(replied_rx.recv_timeout(WAIT).is_ok(), "handler never ran");
    }

    #[test]
    fn test_oversized_send_keeps_connection() {
        let options = ClientOptions {
            frame: FrameConfig {
                max_payload_size: 8,
            },
            ..Default::default()
        };
        let (handler, rx) = collector(None);
        let addr = echo_peer();
        let client = Client::with_options(
            "127.0.0.1",
            &addr.port().to_string(),
            LockPolicy::Exclusive,
            options,
            handler,
        );
        client.connect().unwrap();

        assert!(matches!(
            client.send([0u8; 9]),
            Err(ClientError::PayloadTooLarge { size: 9, max: 8 })
        ));
        assert!(client.is_connected());
        client.send("fits").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(b"fits".to_vec()));
    }

    #[test]
    fn test_no_lock_policy_single_threaded() {
        let (client, rx) = client_for(echo_peer(), LockPolicy::None);
        assert_eq!(client.lock_policy(), LockPolicy::None);
        client.connect().unwrap();
        client.send("solo").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Packet(b"solo".to_vec()));
        client.disconnect();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_state_watch_sees_transitions() {
        let (client, _rx) = client_for(echo_peer(), LockPolicy::Exclusive);
        let mut states = client.subscribe();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Idle);

        client.connect().unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

        client.disconnect();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Idle);
    }

    #[test]
    fn test_drop_closes_connection() {
        let (closed_tx, closed_rx) = unbounded();
        let addr = scripted_peer(move |mut stream| {
            let result = read_frame(&mut stream, &FrameConfig::default());
            let _ = closed_tx.send(matches!(result, Err(FrameError::ConnectionClosed)));
        });
        let (client, _rx) = client_for(addr, LockPolicy::Exclusive);
        client.connect().unwrap();
        drop(client);

        assert!(closed_rx.recv_timeout(WAIT).unwrap());
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.client.host_name = "127.0.0.1".to_string();
        config.client.port = echo_peer().port().to_string();
        config.client.lock_policy = LockPolicy::Timed;
        config.socket.connect_timeout_ms = 2_000;

        let (handler, rx) = collector(None);
        let client = Client::from_config(&config, handler);
        assert_eq!(client.lock_policy(), LockPolicy::Timed);
        client.connect().unwrap();
        client.send(Packet::from("configured")).unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Event::Packet(b"configured".to_vec())
        );
    }
}
