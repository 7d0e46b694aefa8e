//! Link statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the reader and dispatcher tasks.
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    delivered_to_waiters: AtomicU64,
    callbacks_queued: AtomicU64,
    callbacks_dropped: AtomicU64,
    unhandled: AtomicU64,
}

impl LinkStats {
    pub(crate) fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.delivered_to_waiters.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn callback_queued(&self) {
        self.callbacks_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn callback_dropped(&self) {
        self.callbacks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            delivered_to_waiters: self.delivered_to_waiters.load(Ordering::Relaxed),
            callbacks_queued: self.callbacks_queued.load(Ordering::Relaxed),
            callbacks_dropped: self.callbacks_dropped.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// Copy of the link counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatsSnapshot {
    /// Frames written to the transport.
    pub frames_sent: u64,
    /// Frames that decoded with a valid checksum.
    pub frames_received: u64,
    /// Frames dropped for a bad checksum, bad length or truncation.
    pub frames_rejected: u64,
    /// Messages handed to a waiting caller.
    pub delivered_to_waiters: u64,
    /// Messages queued for a callback.
    pub callbacks_queued: u64,
    /// Messages dropped because the callback queue stayed full.
    pub callbacks_dropped: u64,
    /// Messages nobody consumed.
    pub unhandled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = LinkStats::default();
        stats.frame_received();
        stats.frame_received();
        stats.frame_rejected();
        stats.unhandled();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.frames_rejected, 1);
        assert_eq!(snapshot.unhandled, 1);
        assert_eq!(snapshot.frames_sent, 0);
    }
}
