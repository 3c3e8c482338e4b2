//! One established pipe endpoint with its own read and write loops.
//!
//! A [`Connection`] owns two worker threads. The read loop turns incoming
//! frames into [`ConnectionEvent::Message`]s, in arrival order. The write loop
//! drains an outbound FIFO queue and writes each message in enqueue order,
//! blocking on the pipe when the peer reads slowly.
//!
//! Lifecycle: `Open → Connected → Disconnecting → Closed`. Whichever side
//! ends the connection (peer hang-up, I/O failure, explicit [`Connection::close`]),
//! exactly one [`ConnectionEvent::Disconnected`] is delivered, after both
//! loops have exited, and nothing is delivered after it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use pipelink_frame::{
    BincodeCodec, FrameConfig, FrameError, FrameReader, FrameWriter, ObjectReader, ObjectWriter,
    PayloadCodec,
};
use pipelink_transport::IpcStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::worker::{Worker, WorkerOutcome};

/// A value that can travel over a connection.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Identity of a connection, unique within the server or client that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed around a connected stream; loops not started yet.
    Open,
    /// Both loops are running.
    Connected,
    /// Close requested; waiting for the loops to exit.
    Disconnecting,
    /// Both loops have exited. Terminal.
    Closed,
}

/// Notification raised by a connection to its owner.
#[derive(Debug)]
pub enum ConnectionEvent<I> {
    /// A message arrived from the peer.
    Message { id: ConnectionId, message: I },
    /// A loop hit an error. Does not by itself mean the connection is gone.
    Error { id: ConnectionId, error: PeerError },
    /// The connection is closed. Raised exactly once, always last.
    Disconnected { id: ConnectionId },
}

/// Receives the events of a connection. Called from the loop threads.
pub type EventSink<I> = Arc<dyn Fn(ConnectionEvent<I>) + Send + Sync>;

/// Per-connection settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Frame limits and optional stream timeouts for the data pipe.
    pub frame: FrameConfig,
}

/// Handle to one connection. Clones refer to the same connection.
pub struct Connection<I, O, C = BincodeCodec> {
    shared: Arc<Shared<I, O, C>>,
}

impl<I, O, C> Clone for Connection<I, O, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<I, O, C> fmt::Debug for Connection<I, O, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.shared.lock().state)
            .finish()
    }
}

struct Shared<I, O, C> {
    id: ConnectionId,
    name: String,
    stream: IpcStream,
    codec: C,
    config: ConnectionConfig,
    inner: Mutex<Inner<O>>,
    /// Wakes the write loop: new message queued or state changed.
    queue_ready: Condvar,
    /// Wakes `wait_for_disconnection` callers.
    closed: Condvar,
    /// Wakes `flush` callers.
    flushed: Condvar,
    /// One-shot latch for the `Disconnected` event.
    disconnect_sent: AtomicBool,
    sink: EventSink<I>,
}

struct Inner<O> {
    state: ConnectionState,
    queue: VecDeque<O>,
    /// Pushed messages not yet written, including the batch being written.
    unsent: usize,
    loops_running: u8,
}

impl<I, O, C> Connection<I, O, C>
where
    I: Message,
    O: Message,
    C: PayloadCodec,
{
    /// Wrap an already connected stream. The connection starts in `Open`.
    pub fn new(
        id: ConnectionId,
        name: impl Into<String>,
        stream: IpcStream,
        codec: C,
        config: ConnectionConfig,
        sink: EventSink<I>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                name: name.into(),
                stream,
                codec,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Open,
                    queue: VecDeque::new(),
                    unsent: 0,
                    loops_running: 0,
                }),
                queue_ready: Condvar::new(),
                closed: Condvar::new(),
                flushed: Condvar::new(),
                disconnect_sent: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// Start the read and write loops and move to `Connected`.
    ///
    /// Calling this on a connection that is not `Open` does nothing. If the
    /// loops cannot be set up the connection is closed, so the owner still
    /// sees exactly one `Disconnected`.
    pub fn open(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.lock().state != ConnectionState::Open {
            return Ok(());
        }

        let (reader, writer) = match self.loop_ends() {
            Ok(ends) => ends,
            Err(err) => {
                warn!(connection_id = %shared.id, error = %err, "connection failed to open");
                shared.close();
                return Err(err);
            }
        };

        {
            let mut inner = shared.lock();
            if inner.state != ConnectionState::Open {
                return Ok(());
            }
            inner.state = ConnectionState::Connected;
            inner.loops_running = 2;
        }
        info!(connection_id = %shared.id, name = %shared.name, "connection opened");

        let read_shared = Arc::clone(shared);
        let read_done = Arc::clone(shared);
        let spawned = Worker::new(format!("pipelink-read-{}", shared.id.get())).run(
            move || read_shared.read_loop(reader),
            move |outcome| read_done.loop_exited("read", outcome),
        );
        if let Err(err) = spawned {
            shared.close();
            shared.loop_exited("read", WorkerOutcome::Succeeded);
            shared.loop_exited("write", WorkerOutcome::Succeeded);
            return Err(err);
        }

        let write_shared = Arc::clone(shared);
        let write_done = Arc::clone(shared);
        let spawned = Worker::new(format!("pipelink-write-{}", shared.id.get())).run(
            move || write_shared.write_loop(writer),
            move |outcome| write_done.loop_exited("write", outcome),
        );
        if let Err(err) = spawned {
            shared.close();
            shared.loop_exited("write", WorkerOutcome::Succeeded);
            return Err(err);
        }

        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn loop_ends(&self) -> Result<(ObjectReader<IpcStream, I, C>, ObjectWriter<IpcStream, C>)> {
        let shared = &self.shared;
        let frame_config = shared.config.frame.clone();
        let reader_stream = shared.stream.try_clone()?;
        let writer_stream = shared.stream.try_clone()?;
        let reader = ObjectReader::new(
            FrameReader::with_config_ipc(reader_stream, frame_config.clone())?,
            shared.codec.clone(),
        );
        let writer = ObjectWriter::new(
            FrameWriter::with_config_ipc(writer_stream, frame_config)?,
            shared.codec.clone(),
        );
        Ok((reader, writer))
    }
}

impl<I, O, C> Connection<I, O, C> {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Display name assigned by the owner.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of messages queued but not yet handed to the write loop.
    pub fn pending_messages(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Credentials of the process on the other end, where the OS exposes them.
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        self.shared.stream.peer_credentials()
    }

    /// Queue `message` for the write loop. Never blocks on the pipe.
    ///
    /// Returns false, dropping the message, once the connection is closing.
    pub fn push_message(&self, message: O) -> bool {
        let mut inner = self.shared.lock();
        match inner.state {
            ConnectionState::Open | ConnectionState::Connected => {
                inner.queue.push_back(message);
                inner.unsent += 1;
                drop(inner);
                self.shared.queue_ready.notify_all();
                true
            }
            ConnectionState::Disconnecting | ConnectionState::Closed => {
                debug!(connection_id = %self.shared.id, "dropping message for closed connection");
                false
            }
        }
    }

    /// Close the stream and stop both loops. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Block until every pushed message has been written to the pipe.
    ///
    /// Returns false on timeout, or when the connection closed with messages
    /// still queued.
    pub fn flush(&self, timeout: Duration) -> bool {
        let inner = self.shared.lock();
        let (inner, _) = self
            .shared
            .flushed
            .wait_timeout_while(inner, timeout, |inner| {
                inner.unsent > 0
                    && matches!(
                        inner.state,
                        ConnectionState::Open | ConnectionState::Connected
                    )
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.unsent == 0
    }

    /// Block until the connection reaches `Closed`.
    ///
    /// `None` waits indefinitely. Returns whether the connection is closed.
    pub fn wait_for_disconnection(&self, timeout: Option<Duration>) -> bool {
        let inner = self.shared.lock();
        let not_closed = |inner: &mut Inner<O>| inner.state != ConnectionState::Closed;
        let inner = match timeout {
            Some(timeout) => {
                self.shared
                    .closed
                    .wait_timeout_while(inner, timeout, not_closed)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
            None => self
                .shared
                .closed
                .wait_while(inner, not_closed)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
        inner.state == ConnectionState::Closed
    }
}

impl<I, O, C> Shared<I, O, C> {
    fn lock(&self) -> MutexGuard<'_, Inner<O>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_connected(&self) -> bool {
        self.lock().state == ConnectionState::Connected
    }

    fn mark_sent(&self) {
        let mut inner = self.lock();
        inner.unsent = inner.unsent.saturating_sub(1);
        if inner.unsent == 0 {
            drop(inner);
            self.flushed.notify_all();
        }
    }

    fn emit(&self, event: ConnectionEvent<I>) {
        (self.sink)(event);
    }

    fn emit_error(&self, error: PeerError) {
        warn!(connection_id = %self.id, error = %error, "connection error");
        self.emit(ConnectionEvent::Error { id: self.id, error });
    }

    fn close(&self) {
        let never_opened = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Open => {
                    inner.state = ConnectionState::Closed;
                    inner.queue.clear();
                    true
                }
                ConnectionState::Connected => {
                    inner.state = ConnectionState::Disconnecting;
                    inner.queue.clear();
                    false
                }
                ConnectionState::Disconnecting | ConnectionState::Closed => return,
            }
        };

        debug!(connection_id = %self.id, "closing connection");
        if let Err(err) = self.stream.shutdown() {
            debug!(connection_id = %self.id, error = %err, "stream shutdown failed");
        }
        self.queue_ready.notify_all();
        self.flushed.notify_all();

        if never_opened {
            self.closed.notify_all();
            self.send_disconnected();
        }
    }

    fn loop_exited(&self, which: &str, outcome: WorkerOutcome<PeerError>) {
        let worker = format!("{which} loop {}", self.id);
        if let Some(error) = outcome.into_error(&worker) {
            self.emit_error(error);
        }

        // A loop that ends takes the connection down with it, so the other
        // loop does not keep serving a half-dead pipe.
        self.close();

        let finished = {
            let mut inner = self.lock();
            inner.loops_running = inner.loops_running.saturating_sub(1);
            if inner.loops_running == 0 {
                inner.state = ConnectionState::Closed;
                true
            } else {
                false
            }
        };

        if finished {
            self.closed.notify_all();
            self.send_disconnected();
        }
    }

    fn send_disconnected(&self) {
        if self.disconnect_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(connection_id = %self.id, name = %self.name, "connection closed");
        self.emit(ConnectionEvent::Disconnected { id: self.id });
    }
}

impl<I, O, C> Shared<I, O, C>
where
    I: Message,
    O: Message,
    C: PayloadCodec,
{
    fn read_loop(&self, mut reader: ObjectReader<IpcStream, I, C>) -> Result<()> {
        while self.is_connected() {
            match reader.read_object() {
                Ok(Some(message)) => {
                    if !self.is_connected() {
                        break;
                    }
                    self.emit(ConnectionEvent::Message {
                        id: self.id,
                        message,
                    });
                }
                Ok(None) => {
                    debug!(connection_id = %self.id, "peer closed the stream");
                    break;
                }
                Err(err) if err.is_recoverable() => {
                    self.emit_error(err.into());
                }
                Err(err) => {
                    if !self.is_connected() {
                        // Our own close() cut the stream.
                        break;
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn write_loop(&self, mut writer: ObjectWriter<IpcStream, C>) -> Result<()> {
        loop {
            let batch: Vec<O> = {
                let inner = self.lock();
                let mut inner = self
                    .queue_ready
                    .wait_while(inner, |inner| {
                        inner.queue.is_empty() && inner.state == ConnectionState::Connected
                    })
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if inner.state != ConnectionState::Connected {
                    return Ok(());
                }
                inner.queue.drain(..).collect()
            };

            for message in batch {
                match writer.write_object(&message) {
                    Ok(()) => self.mark_sent(),
                    Err(err @ (FrameError::Codec { .. } | FrameError::PayloadTooLarge { .. })) => {
                        // Nothing reached the stream; drop this one and go on.
                        self.mark_sent();
                        self.emit_error(err.into());
                    }
                    Err(err) if err.is_disconnect() || !self.is_connected() => {
                        debug!(connection_id = %self.id, error = %err, "write side closed");
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}
