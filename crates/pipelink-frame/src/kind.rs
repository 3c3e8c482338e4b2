//! Frame kinds.
//!
//! Kinds 0-255 are reserved for pipelink itself.

/// Rendezvous record naming the private data pipe.
pub const HANDSHAKE: u16 = 0;

/// Application message.
pub const MESSAGE: u16 = 1;

/// First kind available to applications that frame their own traffic.
pub const USER_KIND_START: u16 = 256;

/// Returns a human-readable name for a frame kind.
pub fn kind_name(kind: u16) -> &'static str {
    match kind {
        HANDSHAKE => "HANDSHAKE",
        MESSAGE => "MESSAGE",
        2..=255 => "RESERVED",
        _ => "USER",
    }
}
