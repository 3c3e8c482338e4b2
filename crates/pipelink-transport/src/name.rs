//! Pipe naming: map a logical pipe name to an OS endpoint.
//!
//! Both the rendezvous endpoint and every per-client data pipe are addressed
//! by name. A [`PipeNamespace`] turns such a name into a socket path inside a
//! single directory, so a server and its clients agree on endpoints as long as
//! they agree on the namespace and the name.

use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// Maximum length of a pipe name in bytes.
pub const MAX_PIPE_NAME_LEN: usize = 64;

/// Environment variable that overrides the default namespace directory.
pub const NAMESPACE_DIR_ENV: &str = "PIPELINK_DIR";

const SOCKET_SUFFIX: &str = ".sock";

/// Directory in which pipe names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeNamespace {
    dir: PathBuf,
}

impl Default for PipeNamespace {
    fn default() -> Self {
        Self::new(default_dir())
    }
}

impl PipeNamespace {
    /// Use `dir` as the namespace directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The namespace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve `name` to its socket path.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_pipe_name(name)?;
        Ok(self.dir.join(format!("{name}{SOCKET_SUFFIX}")))
    }

    /// Create the namespace directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| TransportError::Bind {
            path: self.dir.clone(),
            source,
        })
    }
}

/// Check that `name` can be used as a pipe name.
pub fn validate_pipe_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if name.len() > MAX_PIPE_NAME_LEN {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "name is longer than 64 bytes",
        });
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "only ASCII letters, digits, '-', '_' and '.' are allowed",
        });
    }
    if name.starts_with('.') {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "name must not start with '.'",
        });
    }
    Ok(())
}

fn default_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(NAMESPACE_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir).join("pipelink"),
        None => std::env::temp_dir().join("pipelink"),
    }
}
