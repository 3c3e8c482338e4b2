//! Typed, ordered messaging between local processes over named pipes.
//!
//! A [`Server`] listens on a well-known rendezvous name and hands every client
//! its own data pipe. A [`Client`] performs that handshake and reconnects on
//! its own when the pipe drops. Both sides talk through a [`Connection`],
//! which queues outbound messages and delivers inbound ones as events.

pub mod client;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod server;
pub mod worker;

pub use client::{Client, ClientConfig, ClientEvent};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionId, ConnectionState, EventSink,
    Message,
};
pub use error::{PeerError, Result};
pub use handshake::{data_pipe_name, recv_pipe_name, send_pipe_name, HandshakeConfig};
pub use server::{Server, ServerConfig, ServerEvent};
pub use worker::{Worker, WorkerHandle, WorkerOutcome};
