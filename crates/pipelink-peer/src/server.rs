//! Multi-client server on a well-known rendezvous name.
//!
//! A single accept worker runs the handshake cycle: accept on the rendezvous
//! pipe, bind a fresh data pipe `{name}_{n}`, send its name, accept the client
//! on it, and register the resulting [`Connection`] in the live set. Owners
//! observe everything through the [`ServerEvent`] receiver returned by
//! [`Server::new`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use pipelink_frame::{BincodeCodec, PayloadCodec};
use pipelink_transport::{IpcStream, PipeNamespace, TransportError, UnixDomainSocket};
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionId, EventSink, Message,
};
use crate::error::{PeerError, Result};
use crate::handshake::{data_pipe_name, send_pipe_name, HandshakeConfig};
use crate::worker::Worker;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where the rendezvous and data pipes live.
    pub namespace: PipeNamespace,
    pub handshake: HandshakeConfig,
    /// Applied to every accepted connection.
    pub connection: ConnectionConfig,
    /// Upper bound on one blocking accept, and so on how long `stop()` takes
    /// to reach the accept worker.
    pub accept_poll_interval: Duration,
    /// Pause after a failed bind or accept before the next cycle.
    pub retry_interval: Duration,
    /// Permission mode of every pipe the server creates.
    pub socket_mode: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace: PipeNamespace::default(),
            handshake: HandshakeConfig::default(),
            connection: ConnectionConfig::default(),
            accept_poll_interval: Duration::from_millis(100),
            retry_interval: Duration::from_millis(250),
            socket_mode: UnixDomainSocket::DEFAULT_SOCKET_MODE,
        }
    }
}

/// Notification raised by a [`Server`].
#[derive(Debug)]
pub enum ServerEvent<I> {
    /// A client completed the handshake and is live.
    ClientConnected { id: ConnectionId, name: String },
    /// A live client sent a message.
    ClientMessage {
        id: ConnectionId,
        name: String,
        message: I,
    },
    /// A client went away. `None` reports a handshake that failed before any
    /// connection existed.
    ClientDisconnected {
        client: Option<(ConnectionId, String)>,
    },
    /// Something failed. `id` is set when a live connection raised it.
    Error {
        id: Option<ConnectionId>,
        error: PeerError,
    },
}

/// Accepts any number of clients on one rendezvous name.
///
/// `I` is what clients send, `O` what the server sends back.
pub struct Server<I, O, C = BincodeCodec> {
    shared: Arc<ServerShared<I, O, C>>,
}

struct ServerShared<I, O, C> {
    name: String,
    config: ServerConfig,
    codec: C,
    running: AtomicBool,
    /// Whether an accept worker exists; guarded so `start` can wait it out.
    accept_alive: Mutex<bool>,
    accept_exited: Condvar,
    connections: Mutex<Vec<Connection<I, O, C>>>,
    next_connection_id: AtomicU64,
    next_pipe_seq: AtomicU64,
    events: Sender<ServerEvent<I>>,
}

impl<I: Message, O: Message> Server<I, O, BincodeCodec> {
    /// Create a stopped server using the default bincode payload codec.
    pub fn new(
        name: impl Into<String>,
        config: ServerConfig,
    ) -> Result<(Self, Receiver<ServerEvent<I>>)> {
        Self::with_codec(name, config, BincodeCodec)
    }
}

impl<I, O, C> Server<I, O, C>
where
    I: Message,
    O: Message,
    C: PayloadCodec,
{
    /// Create a stopped server with an explicit payload codec.
    pub fn with_codec(
        name: impl Into<String>,
        config: ServerConfig,
        codec: C,
    ) -> Result<(Self, Receiver<ServerEvent<I>>)> {
        let name = name.into();
        // Fails early on names that can never be bound.
        config.namespace.resolve(&name)?;
        config.namespace.resolve(&data_pipe_name(&name, u64::MAX))?;

        let (events, receiver) = mpsc::channel();
        let shared = Arc::new(ServerShared {
            name,
            config,
            codec,
            running: AtomicBool::new(false),
            accept_alive: Mutex::new(false),
            accept_exited: Condvar::new(),
            connections: Mutex::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
            next_pipe_seq: AtomicU64::new(1),
            events,
        });
        Ok((Self { shared }, receiver))
    }

    /// Start accepting clients on a background worker.
    ///
    /// Fails with [`PeerError::AlreadyRunning`] if the server is running.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let alive = lock(&shared.accept_alive);
        if shared.running.load(Ordering::SeqCst) {
            return Err(PeerError::AlreadyRunning);
        }
        // A previous accept worker may still be on its way out.
        let mut alive = shared
            .accept_exited
            .wait_while(alive, |alive| *alive)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shared.running.store(true, Ordering::SeqCst);
        *alive = true;
        drop(alive);

        let accept = Arc::clone(shared);
        let done = Arc::clone(shared);
        let worker_name = format!("pipelink-accept-{}", shared.name);
        let spawned = Worker::new(worker_name.clone()).run(
            move || accept.accept_loop(),
            move |outcome| {
                if let Some(error) = outcome.into_error(&worker_name) {
                    done.emit(ServerEvent::Error { id: None, error });
                }
                done.accept_loop_exited();
            },
        );
        if let Err(err) = spawned {
            shared.accept_loop_exited();
            return Err(err);
        }

        info!(server = %shared.name, dir = ?shared.config.namespace.dir(), "server started");
        Ok(())
    }

    /// Queue `message` on every live connection. Returns how many got it.
    pub fn push_message(&self, message: O) -> usize
    where
        O: Clone,
    {
        let connections = lock(&self.shared.connections);
        connections
            .iter()
            .filter(|conn| conn.push_message(message.clone()))
            .count()
    }

    /// Block until every live connection has written what was queued on it.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let live: Vec<Connection<I, O, C>> = lock(&self.shared.connections).clone();
        live.iter()
            .all(|conn| conn.flush(deadline.saturating_duration_since(Instant::now())))
    }

    /// Queue `message` on the live connection called `name`.
    pub fn push_message_to(&self, message: O, name: &str) -> bool {
        let connections = lock(&self.shared.connections);
        match connections.iter().find(|conn| conn.name() == name) {
            Some(conn) => conn.push_message(message),
            None => {
                debug!(server = %self.shared.name, target = name, "no such connection");
                false
            }
        }
    }
}

impl<I, O, C> Server<I, O, C> {
    /// Rendezvous name clients connect to.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Names of the live connections, in connect order.
    pub fn connection_names(&self) -> Vec<String> {
        lock(&self.shared.connections)
            .iter()
            .map(|conn| conn.name().to_string())
            .collect()
    }

    /// Stop accepting and close every live connection. Idempotent.
    ///
    /// Returns without waiting for the accept worker; see
    /// [`Server::wait_for_stopped`].
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(server = %self.shared.name, "stopping server");

        let live: Vec<Connection<I, O, C>> = lock(&self.shared.connections).clone();
        for conn in live {
            conn.close();
        }
    }

    /// Block until the accept worker has exited. `None` waits indefinitely.
    pub fn wait_for_stopped(&self, timeout: Option<Duration>) -> bool {
        let alive = lock(&self.shared.accept_alive);
        let alive = match timeout {
            Some(timeout) => {
                self.shared
                    .accept_exited
                    .wait_timeout_while(alive, timeout, |alive| *alive)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
            None => self
                .shared
                .accept_exited
                .wait_while(alive, |alive| *alive)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
        !*alive
    }
}

impl<I, O, C> Drop for Server<I, O, C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<I, O, C> ServerShared<I, O, C> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ServerEvent<I>) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }

    fn accept_loop_exited(&self) {
        let mut alive = lock(&self.accept_alive);
        self.running.store(false, Ordering::SeqCst);
        *alive = false;
        drop(alive);
        self.accept_exited.notify_all();
        debug!(server = %self.name, "accept worker exited");
    }

    /// Sleep for `total`, waking early once the server stops.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(self.config.accept_poll_interval));
        }
    }

    fn accept_failed(&self, error: PeerError) {
        warn!(server = %self.name, error = %error, "client handshake failed");
        self.emit(ServerEvent::Error { id: None, error });
        self.emit(ServerEvent::ClientDisconnected { client: None });
    }
}

impl<I, O, C> ServerShared<I, O, C>
where
    I: Message,
    O: Message,
    C: PayloadCodec,
{
    fn bind(&self, name: &str) -> Result<UnixDomainSocket> {
        let path = self.config.namespace.resolve(name)?;
        Ok(UnixDomainSocket::bind_with_mode(
            path,
            self.config.socket_mode,
        )?)
    }

    fn accept_loop(self: &Arc<Self>) -> Result<()> {
        let mut rendezvous: Option<UnixDomainSocket> = None;

        while self.is_running() {
            if rendezvous.is_none() {
                let bound = self
                    .config
                    .namespace
                    .ensure_dir()
                    .map_err(PeerError::from)
                    .and_then(|()| self.bind(&self.name));
                match bound {
                    Ok(listener) => {
                        debug!(server = %self.name, path = ?listener.path(), "rendezvous pipe bound");
                        rendezvous = Some(listener);
                    }
                    Err(err) => {
                        self.accept_failed(err);
                        self.pause(self.config.retry_interval);
                        continue;
                    }
                }
            }
            let Some(listener) = rendezvous.as_ref() else {
                continue;
            };

            match listener.accept_timeout(self.config.accept_poll_interval) {
                Ok(None) => {}
                Ok(Some(_)) if !self.is_running() => break,
                Ok(Some(stream)) => {
                    if let Err(err) = self.complete_handshake(stream) {
                        if self.is_running() {
                            self.accept_failed(err);
                        }
                    }
                }
                Err(err) => {
                    if self.is_running() {
                        self.accept_failed(err.into());
                    }
                    rendezvous = None;
                    self.pause(self.config.retry_interval);
                }
            }
        }

        debug!(server = %self.name, "accept loop finished");
        Ok(())
    }

    fn complete_handshake(self: &Arc<Self>, rendezvous: IpcStream) -> Result<()> {
        let sequence = self.next_pipe_seq.fetch_add(1, Ordering::Relaxed);
        let pipe_name = data_pipe_name(&self.name, sequence);

        // Bound before the name goes out so the client never races a missing endpoint.
        let data_listener = self.bind(&pipe_name)?;
        send_pipe_name(&rendezvous, &pipe_name, &self.codec, &self.config.handshake)?;
        drop(rendezvous);

        let stream = self.accept_data_pipe(&data_listener)?;
        drop(data_listener);

        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let conn = Connection::new(
            id,
            pipe_name.clone(),
            stream,
            self.codec.clone(),
            self.config.connection.clone(),
            self.connection_sink(pipe_name.clone()),
        );

        {
            let mut connections = lock(&self.connections);
            if !self.is_running() {
                drop(connections);
                conn.close();
                return Err(TransportError::Shutdown.into());
            }
            connections.push(conn.clone());
        }

        info!(server = %self.name, connection_id = %id, pipe = %pipe_name, "client connected");
        self.emit(ServerEvent::ClientConnected {
            id,
            name: pipe_name,
        });

        if let Err(error) = conn.open() {
            self.emit(ServerEvent::Error {
                id: Some(id),
                error,
            });
        }
        Ok(())
    }

    fn accept_data_pipe(&self, listener: &UnixDomainSocket) -> Result<IpcStream> {
        let timeout = self.config.handshake.timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return Err(TransportError::Shutdown.into());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PeerError::Timeout(timeout));
            }
            let wait = remaining.min(self.config.accept_poll_interval);
            if let Some(stream) = listener.accept_timeout(wait)? {
                return Ok(stream);
            }
        }
    }

    fn connection_sink(self: &Arc<Self>, name: String) -> EventSink<I> {
        let server: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(server) = server.upgrade() else {
                return;
            };
            match event {
                ConnectionEvent::Message { id, message } => {
                    server.emit(ServerEvent::ClientMessage {
                        id,
                        name: name.clone(),
                        message,
                    });
                }
                ConnectionEvent::Error { id, error } => {
                    server.emit(ServerEvent::Error {
                        id: Some(id),
                        error,
                    });
                }
                ConnectionEvent::Disconnected { id } => {
                    let removed = {
                        let mut connections = lock(&server.connections);
                        let before = connections.len();
                        connections.retain(|conn| conn.id() != id);
                        connections.len() != before
                    };
                    if removed {
                        info!(server = %server.name, connection_id = %id, "client disconnected");
                        server.emit(ServerEvent::ClientDisconnected {
                            client: Some((id, name.clone())),
                        });
                    }
                }
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
