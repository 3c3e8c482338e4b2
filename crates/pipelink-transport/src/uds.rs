use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{is_unavailable_kind, Result, TransportError};
use crate::stream::IpcStream;

/// How long and how often to keep retrying a connect to a missing endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Give up after this long. `None` waits for the endpoint indefinitely.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            deadline: None,
        }
    }
}

/// Unix domain socket listener bound to one pipe endpoint.
///
/// The socket file is removed on drop, unless something else has replaced it
/// in the meantime.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    pub const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    pub const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit permission mode.
    ///
    /// The mode is the access control applied to the endpoint: only users the
    /// mode admits can connect.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove stale socket if it exists, but never remove non-socket files.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            TransportError::Bind {
                path: path.clone(),
                source: e,
            }
        })?;
        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;

        debug!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: Some((created_metadata.dev(), created_metadata.ino())),
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(IpcStream::from_unix(stream))
    }

    /// Accept an incoming connection, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nobody connected in time. Callers loop on this
    /// to get an accept that can be abandoned between polls.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<IpcStream>> {
        let mut pfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a valid pollfd for the duration of the call and
        // nfds is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(TransportError::Accept(err));
        }
        if rc == 0 {
            return Ok(None);
        }

        self.accept().map(Some)
    }

    /// Connect to a listening Unix domain socket (single attempt).
    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(|e| TransportError::Connect {
                path: path.to_path_buf(),
                source: e,
            })?;
        debug!(?path, "connected to unix domain socket");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect, retrying while the endpoint does not exist or refuses.
    ///
    /// `cancelled` is checked before every attempt; once it returns true the
    /// call gives up with [`TransportError::Shutdown`]. Errors other than a
    /// missing endpoint are returned immediately.
    pub fn connect_retry(
        path: impl AsRef<Path>,
        policy: RetryPolicy,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<IpcStream> {
        let path = path.as_ref();
        let start = Instant::now();
        let mut logged = false;

        loop {
            if cancelled() {
                return Err(TransportError::Shutdown);
            }

            match Self::connect(path) {
                Ok(stream) => return Ok(stream),
                Err(TransportError::Connect { source, .. }) if is_unavailable_kind(source.kind()) => {
                    if !logged {
                        info!(?path, "endpoint not available yet, waiting");
                        logged = true;
                    }
                }
                Err(err) => return Err(err),
            }

            if let Some(deadline) = policy.deadline {
                if start.elapsed() >= deadline {
                    return Err(TransportError::Timeout(deadline));
                }
            }
            std::thread::sleep(policy.interval);
        }
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "unix-domain-socket"
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        if let Some((expected_dev, expected_ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(path = ?self.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        path = ?self.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn unique_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pipelink-uds-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect() {
        let dir = unique_dir("basic");
        let sock_path = dir.join("test.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = UnixDomainSocket::connect(&path_clone).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn bind_default_permissions_hardened() {
        let dir = unique_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_rejects_existing_non_socket_file() {
        let dir = unique_dir("file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = unique_dir("stale");
        let sock_path = dir.join("stale.sock");

        let first = UnixDomainSocket::bind(&sock_path).unwrap();
        // Simulate a crashed owner: the file stays behind.
        std::mem::forget(first);

        let second = UnixDomainSocket::bind(&sock_path);
        assert!(second.is_ok());

        drop(second);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_does_not_remove_replaced_path() {
        let dir = unique_dir("drop-race");
        let sock_path = dir.join("drop.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn accept_timeout_returns_none_without_client() {
        let dir = unique_dir("accept-timeout");
        let listener = UnixDomainSocket::bind(dir.join("idle.sock")).unwrap();

        let start = Instant::now();
        let accepted = listener.accept_timeout(Duration::from_millis(30)).unwrap();
        assert!(accepted.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn accept_timeout_returns_pending_client() {
        let dir = unique_dir("accept-ready");
        let sock_path = dir.join("ready.sock");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let _client = UnixDomainSocket::connect(&sock_path).unwrap();
        let accepted = listener.accept_timeout(Duration::from_secs(1)).unwrap();
        assert!(accepted.is_some());

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_missing_endpoint_is_unavailable() {
        let dir = unique_dir("missing");
        let err = UnixDomainSocket::connect(dir.join("nobody.sock")).unwrap_err();
        assert!(err.is_endpoint_unavailable());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_retry_waits_for_late_listener() {
        let dir = unique_dir("late");
        let sock_path = dir.join("late.sock");

        let path_clone = sock_path.clone();
        let server = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let listener = UnixDomainSocket::bind(&path_clone).unwrap();
            let _stream = listener.accept().unwrap();
        });

        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            deadline: Some(Duration::from_secs(5)),
        };
        let stream = UnixDomainSocket::connect_retry(&sock_path, policy, &|| false);
        assert!(stream.is_ok());

        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_retry_honours_deadline() {
        let dir = unique_dir("deadline");
        let policy = RetryPolicy {
            interval: Duration::from_millis(5),
            deadline: Some(Duration::from_millis(40)),
        };
        let result = UnixDomainSocket::connect_retry(dir.join("never.sock"), policy, &|| false);
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_retry_stops_when_cancelled() {
        let dir = unique_dir("cancel");
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancelled);
        let path = dir.join("never.sock");
        let handle = std::thread::spawn(move || {
            UnixDomainSocket::connect_retry(path, RetryPolicy::default(), &|| {
                flag.load(Ordering::SeqCst)
            })
        });

        std::thread::sleep(Duration::from_millis(60));
        cancelled.store(true, Ordering::SeqCst);
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(TransportError::Shutdown)));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
