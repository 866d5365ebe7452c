//! The narrow boundary between the stream engine and a UI-style caller
//! (§1, §3a, §5, §9): a cancellation flag the engine only ever reads, and
//! a channel of coarse progress events the engine only ever writes.
//!
//! Breaking the cyclic connection-worker/UI back-reference from the
//! original design into one-directional message passing means neither
//! side needs to know about the other's internals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// A coarse progress update emitted at most once per completed work
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes moved so far.
    pub transferred: u64,
    /// Total bytes expected for this transfer.
    pub total: u64,
}

/// The engine-side half: a flag to poll and a sender to push updates
/// into. Cheap to clone; every clone shares the same flag and channel.
#[derive(Clone)]
pub struct ProgressHandle {
    cancelled: Arc<AtomicBool>,
    tx: Sender<Progress>,
}

impl ProgressHandle {
    /// True once the paired [`CancelToken`] has been cancelled. The
    /// send/receive loops check this before each iteration and between
    /// file-system reads (§5).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Reports a progress update. Errors are ignored: a caller that
    /// dropped the receiver no longer cares about progress, and that is
    /// never itself a transfer failure.
    pub fn report(&self, transferred: u64, total: u64) {
        let _ = self.tx.send(Progress { transferred, total });
    }
}

/// The caller-side half: a setter for cancellation and a receiver for
/// progress updates.
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    rx: Receiver<Progress>,
}

impl CancelToken {
    /// Requests cancellation of the in-flight transfer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Non-blocking poll for the most recent progress update, if any.
    pub fn try_recv(&self) -> Option<Progress> {
        self.rx.try_recv().ok()
    }
}

/// Builds a connected [`ProgressHandle`]/[`CancelToken`] pair for one
/// transfer.
#[must_use]
pub fn channel() -> (ProgressHandle, CancelToken) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    (
        ProgressHandle {
            cancelled: cancelled.clone(),
            tx,
        },
        CancelToken { cancelled, rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_by_the_handle() {
        let (handle, token) = channel();
        assert!(!handle.is_cancelled());
        token.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn progress_reports_are_received() {
        let (handle, token) = channel();
        handle.report(10, 100);
        assert_eq!(
            token.try_recv(),
            Some(Progress {
                transferred: 10,
                total: 100
            })
        );
    }
}
