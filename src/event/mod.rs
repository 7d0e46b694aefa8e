//! Callback registry and dispatch worker for unsolicited messages.
//!
//! Handlers are registered per message type, at most one per type. The
//! reader task never calls a handler itself: it wraps the message and the
//! handler in a [`CallbackTask`] and pushes it onto a small bounded queue,
//! which a dispatcher task drains in order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::types::Message;

/// Default callback queue capacity.
pub const DEFAULT_CALLBACK_QUEUE: usize = 3;

/// Default time the dispatcher waits on an empty queue before re-checking for stop.
pub const DEFAULT_DISPATCH_POLL: Duration = Duration::from_secs(2);

/// Default time the reader waits for room in a full callback queue.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(50);

/// Handler for messages of one type.
///
/// Any `Fn(&Message)` closure is a handler; data the handler needs is
/// captured by the closure. Handlers run on a blocking thread, one at a time.
pub trait Handler: Send + Sync + 'static {
    /// Handles a message.
    fn handle(&self, message: &Message);
}

impl<F> Handler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) {
        self(message);
    }
}

/// Identifies a registration, needed to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    handler: Arc<dyn Handler>,
}

/// Message type to handler map.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<u16, Entry>>,
    next_id: AtomicU64,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<u16> = self.entries().keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("CallbackRegistry")
            .field("types", &types)
            .finish()
    }
}

impl CallbackRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u16, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handler` for `msg_type`.
    ///
    /// Fails with [`Error::HandlerExists`] if the type already has a handler.
    pub fn register(&self, msg_type: u16, handler: impl Handler) -> Result<HandlerId> {
        let mut entries = self.entries();
        if entries.contains_key(&msg_type) {
            return Err(Error::HandlerExists { msg_type });
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.insert(
            msg_type,
            Entry {
                id,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!("registered handler {id:?} for 0x{msg_type:04x}");
        Ok(id)
    }

    /// Removes the handler registered as `id` for `msg_type`.
    pub fn unregister(&self, msg_type: u16, id: HandlerId) -> Result<()> {
        let mut entries = self.entries();
        match entries.get(&msg_type) {
            Some(entry) if entry.id == id => {
                entries.remove(&msg_type);
                tracing::debug!("removed handler {id:?} for 0x{msg_type:04x}");
                Ok(())
            }
            _ => Err(Error::HandlerNotFound { msg_type }),
        }
    }

    /// Looks up the handler for `msg_type`.
    #[must_use]
    pub fn lookup(&self, msg_type: u16) -> Option<Arc<dyn Handler>> {
        self.entries()
            .get(&msg_type)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Returns true if `msg_type` has a handler.
    #[must_use]
    pub fn contains(&self, msg_type: u16) -> bool {
        self.entries().contains_key(&msg_type)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.entries().clear();
    }
}

/// A message waiting to be passed to its handler.
pub struct CallbackTask {
    /// The message, owned by the task.
    pub message: Message,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for CallbackTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTask")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl CallbackTask {
    /// Creates a task.
    #[must_use]
    pub fn new(message: Message, handler: Arc<dyn Handler>) -> Self {
        Self { message, handler }
    }

    /// Invokes the handler.
    pub fn run(self) {
        self.handler.handle(&self.message);
    }
}

/// Producer side of the callback queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<CallbackTask>,
    enqueue_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with a queue of `capacity` tasks.
    ///
    /// The receiver is meant for [`run_dispatcher`].
    #[must_use]
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> (Self, mpsc::Receiver<CallbackTask>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                enqueue_timeout,
            },
            receiver,
        )
    }

    /// Queues a task, waiting briefly if the queue is full.
    ///
    /// Returns false if the task was dropped.
    pub async fn enqueue(&self, task: CallbackTask) -> bool {
        let msg_type = task.message.msg_type;
        let task = match self.sender.try_send(task) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("callback queue closed, dropping 0x{msg_type:04x}");
                return false;
            }
            Err(TrySendError::Full(task)) => task,
        };

        tracing::trace!("callback queue full, waiting to queue 0x{msg_type:04x}");
        match self.sender.send_timeout(task, self.enqueue_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to queue callback for 0x{msg_type:04x}: {e}");
                false
            }
        }
    }
}

/// Resolves once `stop` reads true or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Drains the callback queue until `stop` is set or every sender is gone.
pub async fn run_dispatcher(
    mut receiver: mpsc::Receiver<CallbackTask>,
    mut stop: watch::Receiver<bool>,
    poll: Duration,
) {
    tracing::debug!("dispatcher started");

    loop {
        let next = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            next = tokio::time::timeout(poll, receiver.recv()) => next,
        };

        match next {
            Ok(Some(task)) => {
                let msg_type = task.message.msg_type;
                tracing::trace!("calling handler for 0x{msg_type:04x}");
                if let Err(e) = tokio::task::spawn_blocking(move || task.run()).await {
                    tracing::error!("handler for 0x{msg_type:04x} failed: {e}");
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }

    tracing::debug!("dispatcher stopped");
}
