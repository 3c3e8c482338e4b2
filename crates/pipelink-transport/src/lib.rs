//! Named local pipe endpoints.
//!
//! This is the lowest layer of pipelink. A pipe is addressed by a short name
//! inside a [`PipeNamespace`]; on Unix every name maps to a Unix domain socket
//! file. Listening, accepting (blocking or poll-bounded) and connecting (single
//! attempt or waiting for the endpoint to appear) all produce an [`IpcStream`].

pub mod error;
pub mod name;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use name::{validate_pipe_name, PipeNamespace, MAX_PIPE_NAME_LEN, NAMESPACE_DIR_ENV};
pub use stream::IpcStream;

#[cfg(unix)]
pub use uds::{RetryPolicy, UnixDomainSocket};
