//! Cooperative cancellation shared by every thread of one merge session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::StreamError;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    error: Mutex<Option<StreamError>>,
}

/// Cloneable handle to a single cancellation signal.
///
/// The first caller to cancel wins: its reason (and error, if any) is kept and
/// later calls only observe that the signal is already raised.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.inner.reason.lock();
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Raise the signal and record the error that triggered it.
    ///
    /// Cancellation errors are never stored as the originating cause. The
    /// error is stored before the flag is raised so observers of the flag
    /// always find it.
    pub fn cancel_with(&self, error: StreamError) {
        let reason = error.to_string();
        if !error.is_cancellation() {
            let mut guard = self.inner.error.lock();
            if guard.is_none() {
                *guard = Some(error);
            }
        }
        self.cancel(reason);
    }

    /// Whether the signal has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Reason given by the first canceller.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Whether an originating error is waiting to be taken.
    pub fn has_error(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    /// Copy of the originating error, left in place for a later [`take_error`](Self::take_error).
    pub fn error(&self) -> Option<StreamError> {
        self.inner.error.lock().clone()
    }

    /// Take the originating error, leaving `None` behind.
    pub fn take_error(&self) -> Option<StreamError> {
        self.inner.error.lock().take()
    }

    /// Return `Err(Cancelled)` once the signal is raised.
    pub fn check(&self) -> Result<(), StreamError> {
        if self.is_cancelled() {
            Err(StreamError::Cancelled {
                reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
            })
        } else {
            Ok(())
        }
    }
}
