//! Client side: rendezvous handshake plus automatic reconnection.
//!
//! [`Client::start`] runs the handshake on a background worker: wait for the
//! rendezvous pipe to exist, read the data pipe name, connect to it and wrap
//! it in a [`Connection`]. With auto-reconnect on, losing the connection or
//! failing a handshake schedules a fresh attempt after
//! [`ClientConfig::reconnect_delay`]. At most one attempt runs at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use pipelink_frame::{BincodeCodec, PayloadCodec};
use pipelink_transport::{PipeNamespace, RetryPolicy, TransportError, UnixDomainSocket};
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionId, EventSink, Message,
};
use crate::error::{PeerError, Result};
use crate::handshake::{recv_pipe_name, HandshakeConfig};
use crate::worker::{Worker, WorkerOutcome};

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Must match the server's namespace.
    pub namespace: PipeNamespace,
    /// Reconnect after an unexpected disconnect or a failed handshake.
    pub auto_reconnect: bool,
    pub handshake: HandshakeConfig,
    pub connection: ConnectionConfig,
    /// Pause before each reconnect attempt.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: PipeNamespace::default(),
            auto_reconnect: true,
            handshake: HandshakeConfig::default(),
            connection: ConnectionConfig::default(),
            reconnect_delay: Duration::from_millis(100),
        }
    }
}

/// Notification raised by a [`Client`].
#[derive(Debug)]
pub enum ClientEvent<I> {
    /// A handshake completed; messages can flow.
    Connected { id: ConnectionId },
    /// The server sent a message.
    Message { id: ConnectionId, message: I },
    /// The connection is gone.
    Disconnected { id: ConnectionId },
    /// Something failed. `id` is `None` for handshake failures.
    Error {
        id: Option<ConnectionId>,
        error: PeerError,
    },
}

/// Connects to a [`Server`](crate::Server) by rendezvous name.
///
/// `I` is what the server sends, `O` what the client sends.
pub struct Client<I, O, C = BincodeCodec> {
    shared: Arc<ClientShared<I, O, C>>,
}

struct ClientShared<I, O, C> {
    name: String,
    config: ClientConfig,
    codec: C,
    auto_reconnect: AtomicBool,
    state: Mutex<ClientState<I, O, C>>,
    changed: Condvar,
    next_connection_id: AtomicU64,
    events: Sender<ClientEvent<I>>,
}

struct ClientState<I, O, C> {
    connection: Option<Connection<I, O, C>>,
    /// The current connection is live and not being torn down.
    connected: bool,
    /// A connect worker exists.
    connecting: bool,
    stopped: bool,
    /// `start` arrived while an old connection or attempt was still winding
    /// down; honoured once it has, whatever `auto_reconnect` says.
    start_requested: bool,
}

impl<I: Message, O: Message> Client<I, O, BincodeCodec> {
    /// Create an idle client using the default bincode payload codec.
    pub fn new(
        name: impl Into<String>,
        config: ClientConfig,
    ) -> Result<(Self, Receiver<ClientEvent<I>>)> {
        Self::with_codec(name, config, BincodeCodec)
    }
}

impl<I, O, C> Client<I, O, C>
where
    I: Message,
    O: Message,
    C: PayloadCodec,
{
    /// Create an idle client with an explicit payload codec.
    pub fn with_codec(
        name: impl Into<String>,
        config: ClientConfig,
        codec: C,
    ) -> Result<(Self, Receiver<ClientEvent<I>>)> {
        let name = name.into();
        config.namespace.resolve(&name)?;

        let (events, receiver) = mpsc::channel();
        let shared = Arc::new(ClientShared {
            name,
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            config,
            codec,
            state: Mutex::new(ClientState {
                connection: None,
                connected: false,
                connecting: false,
                stopped: true,
                start_requested: false,
            }),
            changed: Condvar::new(),
            next_connection_id: AtomicU64::new(1),
            events,
        });
        Ok((Self { shared }, receiver))
    }

    /// Begin connecting in the background.
    ///
    /// Waits indefinitely for the server to appear. Does nothing while a
    /// connection is live or an attempt is already under way. After `stop`,
    /// a connection still closing is replaced as soon as it has gone.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let restarting = std::mem::replace(&mut state.stopped, false);
            if state.connecting || state.connection.is_some() {
                if restarting {
                    state.start_requested = true;
                }
                return Ok(());
            }
            state.connecting = true;
        }
        info!(server = %self.shared.name, "client starting");

        if let Err(err) = self.shared.spawn_connect(Duration::ZERO) {
            self.shared.lock().connecting = false;
            return Err(err);
        }
        Ok(())
    }
}

impl<I, O, C> Client<I, O, C> {
    /// Rendezvous name of the server.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Turn automatic reconnection on or off. Affects the next disconnect.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.shared.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Queue `message` for the server.
    ///
    /// Accepted from the moment `Connected` is raised. Returns false,
    /// dropping the message, while disconnected.
    pub fn push_message(&self, message: O) -> bool {
        let connection = {
            let state = self.shared.lock();
            if state.connected {
                state.connection.clone()
            } else {
                None
            }
        };
        match connection {
            Some(conn) => conn.push_message(message),
            None => {
                debug!(server = %self.shared.name, "not connected, dropping message");
                false
            }
        }
    }

    /// Block until everything pushed so far has been written to the pipe.
    pub fn flush(&self, timeout: Duration) -> bool {
        let connection = self.shared.lock().connection.clone();
        match connection {
            Some(conn) => conn.flush(timeout),
            None => false,
        }
    }

    /// Block until connected. `None` waits indefinitely.
    ///
    /// Returns whether the client is connected. Returns false right away once
    /// the client is stopped.
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> bool {
        let state = self
            .shared
            .wait(timeout, |state| !state.connected && !state.stopped);
        state.connected
    }

    /// Block until not connected. `None` waits indefinitely.
    ///
    /// Returns whether the client is disconnected.
    pub fn wait_for_disconnection(&self, timeout: Option<Duration>) -> bool {
        let state = self.shared.wait(timeout, |state| state.connected);
        !state.connected
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn stop(&self) {
        let connection = {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.connected = false;
            state.start_requested = false;
            state.connection.clone()
        };
        self.shared.changed.notify_all();
        info!(server = %self.shared.name, "client stopping");

        if let Some(conn) = connection {
            conn.close();
        }
    }
}

impl<I, O, C> Drop for Client<I, O, C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<I, O, C> ClientShared<I, O, C> {
    fn lock(&self) -> MutexGuard<'_, ClientState<I, O, C>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(
        &self,
        timeout: Option<Duration>,
        mut condition: impl FnMut(&mut ClientState<I, O, C>) -> bool,
    ) -> MutexGuard<'_, ClientState<I, O, C>> {
        let state = self.lock();
        match timeout {
            Some(timeout) => {
                self.changed
                    .wait_timeout_while(state, timeout, &mut condition)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
            None => self
                .changed
                .wait_while(state, &mut condition)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn emit(&self, event: ClientEvent<I>) {
        let _ = self.events.send(event);
    }

    /// Whether a reconnect should follow, claiming the connect slot if so.
    fn claim_reconnect(&self, state: &mut ClientState<I, O, C>) -> bool {
        let wanted = state.start_requested || self.auto_reconnect.load(Ordering::SeqCst);
        let retry = wanted && !state.stopped && !state.connecting && state.connection.is_none();
        if retry {
            state.connecting = true;
            state.start_requested = false;
        }
        retry
    }
}

impl<I, O, C> ClientShared<I, O, C>
where
    I: Message,
    O: Message,
    C: PayloadCodec,
{
    fn spawn_connect(self: &Arc<Self>, delay: Duration) -> Result<()> {
        let worker = Arc::clone(self);
        let done = Arc::clone(self);
        let worker_name = format!("pipelink-connect-{}", self.name);
        Worker::new(worker_name.clone()).run(
            move || worker.connect(delay),
            move |outcome| done.connect_finished(&worker_name, outcome),
        )?;
        Ok(())
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = self.config.reconnect_delay;
        debug!(server = %self.name, ?delay, "scheduling reconnect");
        if let Err(error) = self.spawn_connect(delay) {
            self.lock().connecting = false;
            self.emit(ClientEvent::Error { id: None, error });
        }
    }

    fn connect(self: &Arc<Self>, delay: Duration) -> Result<()> {
        let resume_at = Instant::now() + delay;
        while Instant::now() < resume_at {
            if self.is_stopped() {
                return Err(TransportError::Shutdown.into());
            }
            std::thread::sleep(
                resume_at
                    .saturating_duration_since(Instant::now())
                    .min(STOP_CHECK_INTERVAL),
            );
        }

        let namespace = &self.config.namespace;
        let handshake = &self.config.handshake;
        let cancelled = || self.is_stopped();

        let rendezvous = namespace.resolve(&self.name)?;
        let stream = UnixDomainSocket::connect_retry(
            &rendezvous,
            RetryPolicy {
                interval: handshake.retry_interval,
                deadline: None,
            },
            &cancelled,
        )?;
        let pipe_name = recv_pipe_name(&stream, &self.name, &self.codec, handshake)?;
        drop(stream);

        let data = UnixDomainSocket::connect_retry(
            namespace.resolve(&pipe_name)?,
            RetryPolicy {
                interval: handshake.retry_interval,
                deadline: Some(handshake.timeout),
            },
            &cancelled,
        )?;

        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let conn = Connection::new(
            id,
            pipe_name.clone(),
            data,
            self.codec.clone(),
            self.config.connection.clone(),
            self.connection_sink(),
        );

        {
            let mut state = self.lock();
            if state.stopped {
                drop(state);
                conn.close();
                return Err(TransportError::Shutdown.into());
            }
            state.connection = Some(conn.clone());
            state.connected = true;
            state.start_requested = false;
        }
        self.changed.notify_all();

        // Raised before the loops start so no message can overtake it. Pushes
        // made in reaction are queued and written once the loops run.
        info!(server = %self.name, connection_id = %id, pipe = %pipe_name, "connected");
        self.emit(ClientEvent::Connected { id });
        conn.open()?;
        Ok(())
    }

    fn connect_finished(self: &Arc<Self>, worker: &str, outcome: WorkerOutcome<PeerError>) {
        let error = outcome.into_error(worker);
        let (stopped, retry) = {
            let mut state = self.lock();
            state.connecting = false;
            // Also covers a connection that dropped before this worker finished.
            let retry = self.claim_reconnect(&mut state);
            (state.stopped, retry)
        };
        self.changed.notify_all();

        if let Some(error) = error {
            let abandoned = matches!(error, PeerError::Transport(TransportError::Shutdown));
            if stopped || abandoned {
                debug!(server = %self.name, error = %error, "connect abandoned after stop");
            } else {
                warn!(server = %self.name, error = %error, "connect attempt failed");
                self.emit(ClientEvent::Error { id: None, error });
            }
        }
        if retry {
            self.schedule_reconnect();
        }
    }

    fn connection_sink(self: &Arc<Self>) -> EventSink<I> {
        let client: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(client) = client.upgrade() else {
                return;
            };
            match event {
                ConnectionEvent::Message { id, message } => {
                    client.emit(ClientEvent::Message { id, message });
                }
                ConnectionEvent::Error { id, error } => {
                    client.emit(ClientEvent::Error {
                        id: Some(id),
                        error,
                    });
                }
                ConnectionEvent::Disconnected { id } => {
                    let retry = {
                        let mut state = client.lock();
                        let current = state
                            .connection
                            .as_ref()
                            .is_some_and(|current| current.id() == id);
                        if current {
                            state.connection = None;
                            state.connected = false;
                        }
                        current && client.claim_reconnect(&mut state)
                    };
                    client.changed.notify_all();

                    info!(server = %client.name, connection_id = %id, "disconnected");
                    client.emit(ClientEvent::Disconnected { id });
                    if retry {
                        client.schedule_reconnect();
                    }
                }
            }
        })
    }
}
