//! Cancellation signal threaded from the request edge into every role call.
//!
//! [`CancelSignal`] replaces a bare `Arc<AtomicBool>` flag: it can still be
//! polled synchronously, but it can also be awaited, so a suspended LLM call
//! can be raced against it and dropped the moment the request is aborted.
//! Timeouts are just a cancellation with [`CancelReason::TimedOut`].

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller went away or asked to stop.
    Aborted,
    /// The request deadline elapsed.
    TimedOut,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Aborted => f.write_str("aborted"),
            CancelReason::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Cloneable cancellation token. All clones observe the same state.
///
/// The first call to [`cancel`](Self::cancel) wins; later calls keep the
/// original reason.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    /// Return [`PipelineError::Cancelled`](crate::PipelineError::Cancelled)
    /// if the signal has fired.
    pub fn check(&self) -> crate::error::Result<()> {
        match self.reason() {
            Some(reason) => Err(crate::PipelineError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Resolve once the signal fires.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        // Copy the reason out so no borrow of the channel survives the await.
        let fired = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .map(|reason| (*reason).unwrap_or(CancelReason::Aborted));
        match fired {
            Some(reason) => reason,
            // The sender lives as long as `self`; park rather than report a
            // spurious cancellation.
            None => std::future::pending().await,
        }
    }

    /// Fire with [`CancelReason::TimedOut`] after `after` elapses.
    ///
    /// The timer is disarmed when the returned guard is dropped.
    pub fn cancel_after(&self, after: Duration) -> DeadlineGuard {
        let signal = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    signal.cancel(CancelReason::TimedOut);
                }
                _ = signal.cancelled() => {}
            }
        });
        DeadlineGuard { handle }
    }

    /// Guard that fires the signal with [`CancelReason::Aborted`] on drop.
    ///
    /// Held by response streams so a dropped connection stops the pipeline.
    pub fn abort_on_drop(&self) -> AbortOnDrop {
        AbortOnDrop {
            signal: self.clone(),
            armed: true,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Disarms a [`CancelSignal::cancel_after`] timer when dropped.
#[derive(Debug)]
pub struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Fires a signal with [`CancelReason::Aborted`] when dropped, unless disarmed.
#[derive(Debug)]
pub struct AbortOnDrop {
    signal: CancelSignal,
    armed: bool,
}

impl AbortOnDrop {
    /// Keep the signal untouched on drop (the stream finished normally).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.signal.cancel(CancelReason::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.check().is_ok());

        assert!(signal.cancel(CancelReason::TimedOut));
        assert!(!signal.cancel(CancelReason::Aborted));
        assert_eq!(signal.reason(), Some(CancelReason::TimedOut));
        assert!(signal.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let a = CancelSignal::new();
        let b = a.clone();
        b.cancel(CancelReason::Aborted);
        assert!(a.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        signal.cancel(CancelReason::Aborted);
        assert_eq!(task.await.unwrap(), CancelReason::Aborted);
    }

    #[tokio::test]
    async fn test_cancelled_future_is_send() {
        fn assert_send<T: Send>(t: T) -> T {
            t
        }
        let signal = CancelSignal::new();
        let waiter = assert_send(signal.cancelled());
        signal.cancel(CancelReason::TimedOut);
        assert_eq!(waiter.await, CancelReason::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fires_timed_out() {
        let signal = CancelSignal::new();
        let _guard = signal.cancel_after(Duration::from_millis(100));
        let reason = signal.cancelled().await;
        assert_eq!(reason, CancelReason::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_guard_disarms_timer() {
        let signal = CancelSignal::new();
        drop(signal.cancel_after(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_abort_on_drop() {
        let signal = CancelSignal::new();
        drop(signal.abort_on_drop());
        assert_eq!(signal.reason(), Some(CancelReason::Aborted));

        let signal = CancelSignal::new();
        let mut guard = signal.abort_on_drop();
        guard.disarm();
        drop(guard);
        assert!(!signal.is_cancelled());
    }
}
