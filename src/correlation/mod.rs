//! Request/response correlation.
//!
//! A caller that needs the next message of some type claims one of a small,
//! fixed number of wait slots, then waits on it with a timeout. The reader
//! task offers every decoded message to the registry, which hands a copy to
//! the first slot whose target matches.
//!
//! The slot count is a hard limit: when every slot is busy a claim fails
//! immediately with [`Error::Overloaded`] instead of queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::STATUS;
use crate::types::{Acknowledgment, Message};

/// Default number of wait slots.
pub const DEFAULT_WAIT_SLOTS: usize = 3;

/// What a wait slot is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTarget {
    /// Message type wanted.
    pub msg_type: u16,
    /// For acknowledgements: the command type the acknowledgement must echo.
    pub correlation: Option<u16>,
}

impl WaitTarget {
    /// Waits for the next message of `msg_type`.
    #[must_use]
    pub const fn message(msg_type: u16) -> Self {
        Self {
            msg_type,
            correlation: None,
        }
    }

    /// Waits for the acknowledgement of a command of `original_type`.
    #[must_use]
    pub const fn acknowledgement(original_type: u16) -> Self {
        Self {
            msg_type: STATUS,
            correlation: Some(original_type),
        }
    }

    /// Checks if a message satisfies this target.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        if message.msg_type != self.msg_type {
            return false;
        }
        match self.correlation {
            None => true,
            Some(original) => {
                Acknowledgment::peek_original_type(&message.payload) == Some(original)
            }
        }
    }
}

/// Result of offering a message to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the waiter in this slot.
    Delivered { slot: usize },
    /// Nobody is waiting for this message.
    NoWaiter,
    /// A matching waiter went away during the hand-off.
    Failed,
}

#[derive(Debug, Default)]
struct Slot {
    /// Set while claimed, cleared when the claim is dropped.
    target: Option<WaitTarget>,
    /// Present until a message is delivered or the registry closes.
    sender: Option<oneshot::Sender<Message>>,
}

#[derive(Debug)]
struct Inner {
    slots: Box<[Mutex<Slot>]>,
    closed: AtomicBool,
}

impl Inner {
    fn slot(&self, index: usize) -> MutexGuard<'_, Slot> {
        self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed pool of wait slots shared by callers and the reader task.
#[derive(Debug, Clone)]
pub struct WaitRegistry {
    inner: Arc<Inner>,
}

impl WaitRegistry {
    /// Creates a registry with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::default()).collect();
        Self {
            inner: Arc::new(Inner {
                slots,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of slots currently claimed.
    #[must_use]
    pub fn occupied(&self) -> usize {
        (0..self.capacity())
            .filter(|&index| self.inner.slot(index).target.is_some())
            .count()
    }

    /// Claims a free slot for `target`.
    ///
    /// Claim before sending the request that triggers the reply, so a fast
    /// reply cannot arrive while nobody is registered for it.
    pub fn claim(&self, target: WaitTarget) -> Result<PendingWait> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::LinkClosed);
        }

        for index in 0..self.capacity() {
            let mut slot = self.inner.slot(index);
            // Checked under the slot lock so close() cannot miss this sender
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::LinkClosed);
            }
            if slot.target.is_none() {
                let (sender, receiver) = oneshot::channel();
                slot.target = Some(target);
                slot.sender = Some(sender);
                tracing::trace!(
                    "slot {index} waiting for 0x{:04x} ({:?})",
                    target.msg_type,
                    target.correlation
                );
                return Ok(PendingWait {
                    registry: self.clone(),
                    index,
                    target,
                    receiver,
                });
            }
        }

        tracing::debug!("no free wait slot for 0x{:04x}", target.msg_type);
        Err(Error::Overloaded {
            capacity: self.capacity(),
        })
    }

    /// Waits for the next message matching `target`.
    pub async fn await_message(&self, target: WaitTarget, timeout: Duration) -> Result<Message> {
        self.claim(target)?.wait(timeout).await
    }

    /// Offers a message to the waiting slots.
    pub fn deliver(&self, message: &Message) -> Delivery {
        let mut outcome = Delivery::NoWaiter;

        for index in 0..self.capacity() {
            let mut slot = self.inner.slot(index);
            let wanted = slot.sender.is_some()
                && slot.target.is_some_and(|target| target.matches(message));
            if !wanted {
                continue;
            }

            let Some(sender) = slot.sender.take() else {
                continue;
            };
            drop(slot);

            if sender.send(message.clone()).is_ok() {
                tracing::trace!("delivered 0x{:04x} to slot {index}", message.msg_type);
                return Delivery::Delivered { slot: index };
            }
            outcome = Delivery::Failed;
        }

        outcome
    }

    /// Releases every waiter with [`Error::LinkClosed`] and refuses new claims.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for index in 0..self.capacity() {
            self.inner.slot(index).sender = None;
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A claimed wait slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct PendingWait {
    registry: WaitRegistry,
    index: usize,
    target: WaitTarget,
    receiver: oneshot::Receiver<Message>,
}

impl PendingWait {
    /// Slot index held by this wait.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.index
    }

    /// Target of this wait.
    #[must_use]
    pub const fn target(&self) -> WaitTarget {
        self.target
    }

    /// Drops the receiving end while leaving the slot claimed.
    #[cfg(test)]
    pub(crate) fn abandon(&mut self) {
        self.receiver.close();
    }

    /// Waits until a matching message is delivered or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Error::LinkClosed),
            Err(_) => match self.receiver.try_recv() {
                // Delivered in the same instant the deadline passed
                Ok(message) => Ok(message),
                Err(_) => {
                    tracing::debug!(
                        "slot {} timed out waiting for 0x{:04x}",
                        self.index,
                        self.target.msg_type
                    );
                    Err(Error::timeout(timeout))
                }
            },
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        let mut slot = self.registry.inner.slot(self.index);
        slot.target = None;
        slot.sender = None;
    }
}
