use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use atomic_waker::AtomicWaker;
use embassy_sync::channel::{Channel, TrySendError};
use portable_atomic::{AtomicBool, Ordering};

use crate::DefaultRawMutex;

/// The reason, the worker loop was woken up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WakeSource {
    /// The bus signalled, that a frame from the host is available.
    RxDone,
    /// Something was enqueued for transmission to the host.
    Enqueue,
    /// The buffer watchdog expired and buffers are available again.
    Watchdog,
    /// The bus was busy during the last drain, so we retry.
    TxRetry,
}

/// A bounded channel of wake tokens, which are consumed by the worker loop.
///
/// Waking never blocks. If the channel is full, a wake-up is already pending and the token is
/// discarded.
pub struct WakeChannel<const DEPTH: usize> {
    tokens: Channel<DefaultRawMutex, WakeSource, DEPTH>,
}
impl<const DEPTH: usize> WakeChannel<DEPTH> {
    pub const fn new() -> Self {
        Self {
            tokens: Channel::new(),
        }
    }
    /// Queue a wake token.
    ///
    /// This is safe to call from interrupt and timer contexts.
    pub fn wake(&self, source: WakeSource) {
        if let Err(TrySendError::Full(source)) = self.tokens.try_send(source) {
            trace!("Wake token {:?} coalesced with a pending one.", source);
        }
    }
    /// Asynchronously wait for the next wake token.
    pub async fn next(&self) -> WakeSource {
        self.tokens.receive().await
    }
    /// Discard all pending tokens.
    pub fn clear(&self) {
        self.tokens.clear();
    }
    /// The amount of tokens currently pending.
    pub fn pending(&self) -> usize {
        self.tokens.len()
    }
}
impl<const DEPTH: usize> Default for WakeChannel<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

/// A latching shutdown flag.
///
/// Once [ShutdownSignal::signal] was called, all current and future waiters complete, until the
/// signal is reset.
pub struct ShutdownSignal {
    requested: AtomicBool,
    waker: AtomicWaker,
}
impl ShutdownSignal {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }
    pub fn reset(&self) {
        self.requested.store(false, Ordering::Relaxed);
    }
    pub fn signal(&self) {
        self.requested.store(true, Ordering::Release);
        self.waker.wake();
    }
    pub fn is_signalled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
    /// Wait until shutdown was requested.
    ///
    /// NOTE: Only one task can wait at a time, since there is just one waker slot.
    pub fn wait(&self) -> impl Future<Output = ()> + use<'_> {
        poll_fn(|cx| {
            if self.is_signalled() {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            // The flag may have been set between the first check and registering.
            if self.is_signalled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
}
impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::{
        block_on,
        select::{select, Either},
    };

    use super::*;

    #[test]
    fn wake_tokens_are_coalesced_when_full() {
        let wake = WakeChannel::<2>::new();
        wake.wake(WakeSource::RxDone);
        wake.wake(WakeSource::Enqueue);
        wake.wake(WakeSource::Watchdog);
        assert_eq!(wake.pending(), 2);
        assert_eq!(block_on(wake.next()), WakeSource::RxDone);
        assert_eq!(block_on(wake.next()), WakeSource::Enqueue);
        assert_eq!(wake.pending(), 0);
    }

    #[test]
    fn shutdown_signal_latches() {
        let shutdown = ShutdownSignal::new();
        let wake = WakeChannel::<1>::new();
        shutdown.signal();
        assert!(matches!(
            block_on(select(shutdown.wait(), wake.next())),
            Either::First(())
        ));
        // Still set for the next waiter.
        block_on(shutdown.wait());
        shutdown.reset();
        assert!(!shutdown.is_signalled());
    }
}
