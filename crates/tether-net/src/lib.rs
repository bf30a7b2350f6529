//! Framed TCP transport: a blocking client with a receive thread, the
//! length-prefixed wire codec, and an async echo server.

pub mod client;
pub mod error;
pub mod framing;
pub mod packet;
pub mod platform;
pub mod server;

pub use client::{
    Client, ClientOptions, ConnectionState, ConnectionStateWatch, PacketHandler,
    RECEIVE_THREAD_NAME, ReceiveExit,
};
pub use error::ClientError;
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use packet::Packet;
pub use platform::SocketOptions;
pub use server::{
    ConnectionId, ConnectionLimitReached, ConnectionMap, ConnectionSlot, EchoServer, ServerConfig,
};
