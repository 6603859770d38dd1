//! Single-assignment completion cell for in-flight requests.
//!
//! Exactly one of {response, timeout, cancellation, transport failure} wins;
//! the race is settled by one atomic compare-and-swap, and the loser's
//! completion is a no-op. Waking is done by dropping a held sender so every
//! waiter unblocks at once, whether it is already parked in `get` or arrives
//! later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use minstant::Instant;

use crate::error::RemotingError;

struct Inner<V> {
    opaque: i32,
    done: AtomicBool,
    slot: Mutex<Option<Result<V, RemotingError>>>,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

pub struct Future<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Future<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Future<V> {
    #[must_use]
    pub fn new(opaque: i32) -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                opaque,
                done: AtomicBool::new(false),
                slot: Mutex::new(None),
                wake_tx: Mutex::new(Some(tx)),
                wake_rx: rx,
            }),
        }
    }

    #[must_use]
    pub fn opaque(&self) -> i32 {
        self.inner.opaque
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Settle the future. The first caller wins and returns true; every
    /// later attempt is discarded.
    pub fn complete(&self, result: Result<V, RemotingError>) -> bool {
        if self
            .inner
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.inner.slot.lock().unwrap() = Some(result);
        // Dropping the sender disconnects wake_rx, waking all waiters.
        self.inner.wake_tx.lock().unwrap().take();
        true
    }

    /// Block until the future settles, the table's timeout notification
    /// fires, or the owner's cancel channel closes. The value can be taken
    /// by exactly one `get` caller.
    ///
    /// # Errors
    ///
    /// `Timeout` when the timeout notification wins, `Cancelled` when the
    /// cancel channel wins or closes.
    pub fn get(
        &self,
        timeout_rx: &Receiver<Instant>,
        cancel_rx: &Receiver<()>,
    ) -> Result<V, RemotingError> {
        let mut timeout_rx = timeout_rx.clone();
        loop {
            select! {
                recv(self.inner.wake_rx) -> _ => {
                    // A zero-capacity channel never yields a message; any
                    // event here means the sender was dropped and the slot
                    // is populated.
                    return self.take();
                }
                recv(timeout_rx) -> msg => {
                    match msg {
                        Ok(_) => {
                            self.complete(Err(RemotingError::Timeout));
                            return self.take();
                        }
                        // Timer cancelled after a response won; wait for
                        // the wake instead of spinning on a dead channel.
                        Err(_) => timeout_rx = never(),
                    }
                }
                recv(cancel_rx) -> _ => {
                    self.complete(Err(RemotingError::Cancelled));
                    return self.take();
                }
            }
        }
    }

    fn take(&self) -> Result<V, RemotingError> {
        self.inner
            .slot
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(RemotingError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn open_cancel() -> (Sender<()>, Receiver<()>) {
        bounded(1)
    }

    #[test]
    fn first_completion_wins() {
        let f: Future<u32> = Future::new(1);
        assert!(f.complete(Ok(7)));
        assert!(!f.complete(Ok(8)));
        assert!(!f.complete(Err(RemotingError::Timeout)));
        assert!(f.is_done());

        let (_cancel_tx, cancel_rx) = open_cancel();
        assert_eq!(f.get(&never(), &cancel_rx).unwrap(), 7);
    }

    #[test]
    fn concurrent_completion_exactly_one_wins() {
        for _ in 0..50 {
            let f: Future<&'static str> = Future::new(1);
            let a = f.clone();
            let b = f.clone();
            let ta = thread::spawn(move || a.complete(Ok("response")));
            let tb = thread::spawn(move || b.complete(Err(RemotingError::Timeout)));
            let wins = [ta.join().unwrap(), tb.join().unwrap()];
            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
        }
    }

    #[test]
    fn get_returns_value_completed_later() {
        let f: Future<u32> = Future::new(9);
        let g = f.clone();
        let h = thread::spawn(move || {
            let (_cancel_tx, cancel_rx) = open_cancel();
            g.get(&never(), &cancel_rx)
        });
        thread::sleep(Duration::from_millis(50));
        assert!(f.complete(Ok(42)));
        assert_eq!(h.join().unwrap().unwrap(), 42);
    }

    #[test]
    fn timeout_notification_produces_timeout() {
        let f: Future<u32> = Future::new(2);
        let (timeout_tx, timeout_rx) = bounded(1);
        let (_cancel_tx, cancel_rx) = open_cancel();
        timeout_tx.send(Instant::now()).unwrap();
        assert!(matches!(
            f.get(&timeout_rx, &cancel_rx),
            Err(RemotingError::Timeout)
        ));
        // A response arriving after the timeout settled loses.
        assert!(!f.complete(Ok(1)));
    }

    #[test]
    fn disconnected_timeout_channel_keeps_waiting() {
        let f: Future<u32> = Future::new(3);
        let (timeout_tx, timeout_rx) = bounded::<Instant>(1);
        drop(timeout_tx);
        let g = f.clone();
        let h = thread::spawn(move || {
            let (_cancel_tx, cancel_rx) = open_cancel();
            g.get(&timeout_rx, &cancel_rx)
        });
        thread::sleep(Duration::from_millis(50));
        assert!(f.complete(Ok(5)));
        assert_eq!(h.join().unwrap().unwrap(), 5);
    }

    #[test]
    fn dropped_cancel_channel_cancels() {
        let f: Future<u32> = Future::new(4);
        let (cancel_tx, cancel_rx) = open_cancel();
        drop(cancel_tx);
        assert!(matches!(
            f.get(&never(), &cancel_rx),
            Err(RemotingError::Cancelled)
        ));
    }
}
