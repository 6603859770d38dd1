//! Capacity-bounded table of in-flight requests.
//!
//! One owning loop thread holds the opaque→future map and its insertion
//! order; nothing else touches them. Attaching past capacity evicts the
//! oldest entry, which settles that future with `QueueFull` so its waiter
//! fails fast instead of riding out a TTL it will never win.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use minstant::Instant;

use crate::error::RemotingError;
use crate::future::Future;
use crate::timing::TimerWheel;
use crate::trace::{debug, warn};

const CMD_QUEUE: usize = 1024;

enum TableCmd<V> {
    Attach {
        future: Future<V>,
        ttl: Duration,
        reply: Sender<Receiver<Instant>>,
    },
    Detach {
        opaque: i32,
        value: V,
    },
    Len {
        reply: Sender<usize>,
    },
}

struct Entry<V> {
    future: Future<V>,
    timer_id: u32,
}

/// Cloneable handle to the table loop. The loop exits when every handle is
/// dropped.
pub struct PendingTable<V> {
    cmds: Sender<TableCmd<V>>,
    opaque: Arc<AtomicI32>,
}

impl<V> Clone for PendingTable<V> {
    fn clone(&self) -> Self {
        Self {
            cmds: self.cmds.clone(),
            opaque: Arc::clone(&self.opaque),
        }
    }
}

impl<V: Send + 'static> PendingTable<V> {
    /// Spawn the table loop. TTL timers are armed on `wheel`.
    #[must_use]
    pub fn new(capacity: usize, wheel: TimerWheel) -> Self {
        assert!(capacity > 0, "pending table capacity must be positive");
        let (tx, rx) = bounded(CMD_QUEUE);
        thread::Builder::new()
            .name("javelin-pending".into())
            .spawn(move || table_loop(capacity, &rx, &wheel))
            .expect("failed to spawn javelin-pending");
        Self {
            cmds: tx,
            opaque: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Next correlation id, strictly positive, wrapping past `i32::MAX`.
    pub fn next_opaque(&self) -> i32 {
        loop {
            let id = self.opaque.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id > 0 {
                return id;
            }
            // Wrapped into the non-positive range; reset and retry.
            self.opaque.store(0, Ordering::Relaxed);
        }
    }

    /// Register a future under its opaque. `ttl == 0` means no expiry; the
    /// returned receiver then never fires.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the table loop has shut down.
    pub fn attach(
        &self,
        future: Future<V>,
        ttl: Duration,
    ) -> Result<Receiver<Instant>, RemotingError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmds
            .send(TableCmd::Attach {
                future,
                ttl,
                reply: reply_tx,
            })
            .map_err(|_| RemotingError::ConnectionClosed)?;
        reply_rx.recv().map_err(|_| RemotingError::ConnectionClosed)
    }

    /// Settle the future registered under `opaque` with a response and
    /// disarm its TTL timer. Unknown opaques are ignored.
    pub fn detach(&self, opaque: i32, value: V) {
        if self.cmds.send(TableCmd::Detach { opaque, value }).is_err() {
            warn!(opaque, "pending table is gone, response dropped");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let (reply_tx, reply_rx) = bounded(1);
        if self.cmds.send(TableCmd::Len { reply: reply_tx }).is_err() {
            return 0;
        }
        reply_rx.recv().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn table_loop<V: Send + 'static>(capacity: usize, cmds: &Receiver<TableCmd<V>>, wheel: &TimerWheel) {
    let mut entries: HashMap<i32, Entry<V>> = HashMap::with_capacity(capacity);
    let mut order: VecDeque<i32> = VecDeque::with_capacity(capacity);
    // TTL timers report back on a private channel so the loop holds no
    // sender for its own command queue and can observe its disconnect.
    // Sized to the table capacity: at most one armed timer per live entry,
    // so a blocking send from a fire callback can never wedge.
    let (expire_tx, expire_rx) = bounded::<i32>(capacity);

    loop {
        select! {
            recv(cmds) -> cmd => match cmd {
                Ok(TableCmd::Attach { future, ttl, reply }) => {
                    // A caller reusing a live opaque supersedes the old
                    // request; its timer must go with it, or a stale fire
                    // would expire the fresh entry.
                    let opaque = future.opaque();
                    if let Some(displaced) = entries.remove(&opaque) {
                        if displaced.timer_id != 0 {
                            wheel.cancel_timer(displaced.timer_id);
                        }
                        displaced.future.complete(Err(RemotingError::Cancelled));
                        order.retain(|id| *id != opaque);
                    }
                    while entries.len() >= capacity {
                        let Some(oldest) = order.pop_front() else { break };
                        if let Some(evicted) = entries.remove(&oldest) {
                            if evicted.timer_id != 0 {
                                wheel.cancel_timer(evicted.timer_id);
                            }
                            debug!(opaque = oldest, "evicting oldest pending request");
                            evicted.future.complete(Err(RemotingError::QueueFull(
                                "pending request table over capacity".into(),
                            )));
                        }
                    }
                    let (timer_id, timeout_rx) = if ttl.is_zero() {
                        (0, never())
                    } else {
                        let tx = expire_tx.clone();
                        let (id, rx) = wheel.add_timer(
                            ttl,
                            Some(Box::new(move |_| {
                                let _ = tx.send(opaque);
                            })),
                            None,
                        );
                        (id, rx)
                    };
                    entries.insert(opaque, Entry { future, timer_id });
                    order.push_back(opaque);
                    let _ = reply.send(timeout_rx);
                }
                Ok(TableCmd::Detach { opaque, value }) => {
                    if let Some(entry) = entries.remove(&opaque) {
                        if entry.timer_id != 0 {
                            wheel.cancel_timer(entry.timer_id);
                        }
                        entry.future.complete(Ok(value));
                        order.retain(|id| *id != opaque);
                    }
                }
                Ok(TableCmd::Len { reply }) => {
                    let _ = reply.send(entries.len());
                }
                Err(_) => {
                    debug!(pending = entries.len(), "pending table stopping");
                    return;
                }
            },
            recv(expire_rx) -> opaque => {
                if let Ok(opaque) = opaque {
                    if let Some(entry) = entries.remove(&opaque) {
                        entry.future.complete(Err(RemotingError::Timeout));
                        order.retain(|id| *id != opaque);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Slots;

    fn table(capacity: usize) -> PendingTable<u32> {
        let wheel = TimerWheel::new(Duration::from_millis(100), Slots::new(2, "pending-test"));
        PendingTable::new(capacity, wheel)
    }

    fn open_cancel() -> (Sender<()>, Receiver<()>) {
        bounded(1)
    }

    #[test]
    fn opaques_are_strictly_positive_and_increasing() {
        let t = table(4);
        let a = t.next_opaque();
        let b = t.next_opaque();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn detach_settles_future_and_disarms_timer() {
        let t = table(4);
        let f: Future<u32> = Future::new(t.next_opaque());
        let timeout_rx = t.attach(f.clone(), Duration::from_secs(5)).unwrap();
        t.detach(f.opaque(), 99);

        let (_cancel_tx, cancel_rx) = open_cancel();
        assert_eq!(f.get(&timeout_rx, &cancel_rx).unwrap(), 99);
        assert!(t.is_empty());
    }

    #[test]
    fn expiry_settles_with_timeout_near_ttl() {
        let t = table(4);
        let f: Future<u32> = Future::new(t.next_opaque());
        let start = Instant::now();
        let timeout_rx = t.attach(f.clone(), Duration::from_millis(100)).unwrap();

        let (_cancel_tx, cancel_rx) = open_cancel();
        assert!(matches!(
            f.get(&timeout_rx, &cancel_rx),
            Err(RemotingError::Timeout)
        ));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(80), "expired early: {waited:?}");
        assert!(waited < Duration::from_millis(800), "expired late: {waited:?}");
    }

    #[test]
    fn attach_past_capacity_evicts_oldest_with_queue_full() {
        let t = table(2);
        let first: Future<u32> = Future::new(t.next_opaque());
        let rx1 = t.attach(first.clone(), Duration::from_secs(5)).unwrap();
        for _ in 0..2 {
            let f: Future<u32> = Future::new(t.next_opaque());
            let _ = t.attach(f, Duration::from_secs(5)).unwrap();
        }

        let (_cancel_tx, cancel_rx) = open_cancel();
        assert!(matches!(
            first.get(&rx1, &cancel_rx),
            Err(RemotingError::QueueFull(_))
        ));
        assert!(t.len() <= 2);
    }

    #[test]
    fn detach_unknown_opaque_is_noop() {
        let t = table(2);
        t.detach(12345, 1);
        assert!(t.is_empty());
    }

    #[test]
    fn zero_ttl_never_expires() {
        let t = table(2);
        let f: Future<u32> = Future::new(t.next_opaque());
        let timeout_rx = t.attach(f.clone(), Duration::ZERO).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(!f.is_done());
        t.detach(f.opaque(), 7);
        let (_cancel_tx, cancel_rx) = open_cancel();
        assert_eq!(f.get(&timeout_rx, &cancel_rx).unwrap(), 7);
    }

    #[test]
    fn reattach_same_opaque_disarms_stale_timer() {
        let t = table(4);
        let opaque = t.next_opaque();
        let first: Future<u32> = Future::new(opaque);
        let rx1 = t.attach(first.clone(), Duration::from_millis(100)).unwrap();

        let second: Future<u32> = Future::new(opaque);
        let rx2 = t.attach(second.clone(), Duration::from_secs(30)).unwrap();

        let (_cancel_tx, cancel_rx) = open_cancel();
        assert!(matches!(
            first.get(&rx1, &cancel_rx),
            Err(RemotingError::Cancelled)
        ));

        // Long enough for the displaced short TTL to have fired.
        thread::sleep(Duration::from_millis(500));
        assert!(!second.is_done());
        assert_eq!(t.len(), 1);

        t.detach(opaque, 11);
        assert_eq!(second.get(&rx2, &cancel_rx).unwrap(), 11);
    }

    #[test]
    fn simultaneous_expiries_all_settle() {
        let t = table(8);
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let f: Future<u32> = Future::new(t.next_opaque());
            let rx = t.attach(f.clone(), Duration::from_millis(50)).unwrap();
            waiters.push((f, rx));
        }

        let (_cancel_tx, cancel_rx) = open_cancel();
        for (f, rx) in waiters {
            assert!(matches!(
                f.get(&rx, &cancel_rx),
                Err(RemotingError::Timeout)
            ));
        }
        assert!(t.is_empty());
    }
}
