//! Typed, ordered messaging between local processes over named pipes.
//!
//! A privileged service runs a [`peer::Server`] on a well-known name; any
//! number of front-end processes connect with a [`peer::Client`], which hands
//! them a private data pipe and reconnects when it drops.
//!
//! # Crate Structure
//!
//! - [`transport`]: named pipe endpoints (Unix domain sockets)
//! - [`frame`]: length-prefixed frames and pluggable payload codecs
//! - [`peer`]: connections, multi-client server and reconnecting client (behind `peer` feature)
//!
//! The `pipelink` command-line tool sits behind the `cli` feature, and so do
//! its end-to-end tests: run them with `cargo test --features cli`.

/// Re-export transport types.
pub mod transport {
    pub use pipelink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pipelink_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use pipelink_peer::*;
}
