//! One-shot background work with a guaranteed completion notification.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::{PeerError, Result};

/// How a unit of work ended.
#[derive(Debug)]
pub enum WorkerOutcome<E> {
    /// The work returned `Ok(())`.
    Succeeded,
    /// The work returned an error.
    Failed(E),
    /// The work panicked; the payload is rendered as text.
    Panicked(String),
}

impl<E> WorkerOutcome<E> {
    /// Collapse the outcome into a `PeerError`, if it is a failure.
    pub fn into_error(self, worker: &str) -> Option<PeerError>
    where
        E: Into<PeerError>,
    {
        match self {
            WorkerOutcome::Succeeded => None,
            WorkerOutcome::Failed(err) => Some(err.into()),
            WorkerOutcome::Panicked(message) => Some(PeerError::WorkerPanicked {
                name: worker.to_string(),
                message,
            }),
        }
    }
}

/// Runs a blocking function on its own named thread.
///
/// Exactly one notification is raised per run, whatever the work does,
/// including panicking. The notification runs on the worker thread; owners
/// forward it into a channel, so a notification arriving after the owner has
/// been dropped goes nowhere instead of failing.
#[derive(Debug, Clone)]
pub struct Worker {
    name: String,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start `work`, then hand its outcome to `notify`.
    pub fn run<F, N, E>(self, work: F, notify: N) -> Result<WorkerHandle>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        N: FnOnce(WorkerOutcome<E>) + Send + 'static,
        E: Send + 'static,
    {
        let name = self.name;
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(())) => WorkerOutcome::Succeeded,
                    Ok(Err(err)) => WorkerOutcome::Failed(err),
                    Err(payload) => WorkerOutcome::Panicked(panic_message(payload.as_ref())),
                };
                debug!(worker = %thread_name, "worker finished");

                if catch_unwind(AssertUnwindSafe(move || notify(outcome))).is_err() {
                    warn!(worker = %thread_name, "worker completion handler panicked");
                }
            })
            .map_err(|source| PeerError::Spawn {
                name: name.clone(),
                source,
            })?;

        Ok(WorkerHandle { name, handle })
    }
}

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread, including its notification, to finish.
    pub fn join(self) {
        // The thread body catches every panic, so join cannot fail.
        let _ = self.handle.join();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn success_notifies_once() {
        let (tx, rx) = mpsc::channel();
        let handle = Worker::new("ok-worker")
            .run(
                || Ok::<(), PeerError>(()),
                move |outcome| tx.send(matches!(outcome, WorkerOutcome::Succeeded)).unwrap(),
            )
            .unwrap();
        assert_eq!(handle.name(), "ok-worker");
        handle.join();

        assert!(rx.recv().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_is_forwarded() {
        let (tx, rx) = mpsc::channel();
        Worker::new("failing-worker")
            .run(
                || Err(PeerError::HandshakeFailed("no pipe".to_string())),
                move |outcome| tx.send(outcome.into_error("failing-worker")).unwrap(),
            )
            .unwrap()
            .join();

        let err = rx.recv().unwrap().unwrap();
        assert!(matches!(err, PeerError::HandshakeFailed(ref m) if m == "no pipe"));
    }

    #[test]
    fn panic_becomes_notification() {
        let (tx, rx) = mpsc::channel();
        Worker::new("panicking-worker")
            .run(
                || -> std::result::Result<(), PeerError> { panic!("codec misconfigured") },
                move |outcome| tx.send(outcome.into_error("panicking-worker")).unwrap(),
            )
            .unwrap()
            .join();

        let err = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert!(matches!(
            err,
            PeerError::WorkerPanicked { ref name, ref message }
                if name == "panicking-worker" && message == "codec misconfigured"
        ));
    }

    #[test]
    fn notification_after_owner_dropped_is_harmless() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(rx);

        let handle = Worker::new("orphan")
            .run(
                || Ok::<(), PeerError>(()),
                move |_| {
                    let _ = tx.send(());
                },
            )
            .unwrap();
        handle.join();
    }

    #[test]
    fn panicking_notification_does_not_escape() {
        let handle = Worker::new("bad-notify")
            .run(|| Ok::<(), PeerError>(()), |_| panic!("handler bug"))
            .unwrap();
        handle.join();
    }
}
