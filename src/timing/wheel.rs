//! Timer wheel: a dedicated thread owns the deadline heap and is driven by
//! a `crossbeam_channel::tick` source plus a command queue. Callers never
//! touch the heap; they talk to it through a cloneable [`TimerWheel`]
//! handle. Fired and cancelled callbacks run on [`Slots`], never on the
//! tick thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use minstant::Instant;

use crate::dispatch::Slots;
use crate::timing::heap::TimerHeap;
use crate::trace::{debug, trace, warn};

const CMD_QUEUE: usize = 1024;

type FireOnce = Box<dyn FnOnce(Instant) + Send + 'static>;
type FireRepeat = Arc<dyn Fn(Instant) + Send + Sync + 'static>;
type CancelHook = Box<dyn FnOnce(Instant) + Send + 'static>;

enum TimerKind {
    OneShot {
        on_fire: Option<FireOnce>,
        notify: Sender<Instant>,
    },
    Repeating {
        interval: Duration,
        on_fire: FireRepeat,
    },
}

struct Timer {
    id: u32,
    deadline: Instant,
    kind: TimerKind,
    on_cancel: Option<CancelHook>,
}

enum WheelCmd {
    Add(Timer),
    Update { id: u32, deadline: Instant },
    Cancel { id: u32 },
}

/// Cloneable scheduling handle. The wheel thread exits when every handle
/// is dropped.
#[derive(Clone)]
pub struct TimerWheel {
    cmds: Sender<WheelCmd>,
    granularity: Duration,
    next_id: Arc<AtomicU32>,
}

/// Tick granularity matched to the timeout magnitudes a wheel will carry.
/// Coarser ticks for longer horizons keep the tick thread nearly idle.
#[must_use]
pub fn granularity_for(hint: Duration) -> Duration {
    let g = if hint <= Duration::from_secs(1) {
        Duration::from_millis(10)
    } else if hint <= Duration::from_secs(60) {
        Duration::from_millis(100)
    } else {
        Duration::from_secs(1)
    };
    g.max(Duration::from_millis(1))
}

impl TimerWheel {
    /// Spawn the wheel thread. `granularity_hint` is the typical timeout
    /// this wheel will carry; the actual tick is chosen by
    /// [`granularity_for`].
    #[must_use]
    pub fn new(granularity_hint: Duration, slots: Slots) -> Self {
        let granularity = granularity_for(granularity_hint);
        let (tx, rx) = bounded(CMD_QUEUE);
        thread::Builder::new()
            .name("javelin-timer".into())
            .spawn(move || wheel_loop(&rx, granularity, &slots))
            .expect("failed to spawn javelin-timer");
        Self {
            cmds: tx,
            granularity,
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    #[must_use]
    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Arm a bare one-shot timer. The receiver gets the fire instant.
    pub fn after(&self, timeout: Duration) -> (u32, Receiver<Instant>) {
        self.arm_one_shot(timeout, None, None)
    }

    /// Arm a one-shot timer with callbacks. `on_fire` runs on a slot before
    /// the notification is sent; `on_cancel` runs on a slot if the timer is
    /// cancelled before firing.
    pub fn add_timer(
        &self,
        timeout: Duration,
        on_fire: Option<FireOnce>,
        on_cancel: Option<CancelHook>,
    ) -> (u32, Receiver<Instant>) {
        self.arm_one_shot(timeout, on_fire, on_cancel)
    }

    /// Arm a repeating timer. Keeps one stable id across every re-arm.
    pub fn repeated_timer(
        &self,
        interval: Duration,
        on_fire: FireRepeat,
        on_cancel: Option<CancelHook>,
    ) -> u32 {
        let interval = interval.max(self.granularity);
        let id = self.alloc_id();
        let timer = Timer {
            id,
            deadline: Instant::now() + interval,
            kind: TimerKind::Repeating { interval, on_fire },
            on_cancel,
        };
        self.push(WheelCmd::Add(timer));
        id
    }

    /// Move an armed timer's deadline. Unknown ids are ignored.
    pub fn update_timer(&self, id: u32, timeout: Duration) {
        let timeout = timeout.max(self.granularity);
        self.push(WheelCmd::Update {
            id,
            deadline: Instant::now() + timeout,
        });
    }

    /// Cancel a timer. Idempotent; unknown ids are ignored. A timer that
    /// was armed with `on_cancel` runs it exactly once.
    pub fn cancel_timer(&self, id: u32) {
        self.push(WheelCmd::Cancel { id });
    }

    fn arm_one_shot(
        &self,
        timeout: Duration,
        on_fire: Option<FireOnce>,
        on_cancel: Option<CancelHook>,
    ) -> (u32, Receiver<Instant>) {
        let timeout = timeout.max(self.granularity);
        let id = self.alloc_id();
        let (notify_tx, notify_rx) = bounded(1);
        let timer = Timer {
            id,
            deadline: Instant::now() + timeout,
            kind: TimerKind::OneShot {
                on_fire,
                notify: notify_tx,
            },
            on_cancel,
        };
        self.push(WheelCmd::Add(timer));
        (id, notify_rx)
    }

    fn alloc_id(&self) -> u32 {
        // 0 is reserved so callers can use it as "no timer".
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn push(&self, cmd: WheelCmd) {
        if self.cmds.send(cmd).is_err() {
            warn!("timer wheel thread is gone, command dropped");
        }
    }
}

fn wheel_loop(cmds: &Receiver<WheelCmd>, granularity: Duration, slots: &Slots) {
    let ticker = tick(granularity);
    let mut heap: TimerHeap<Timer> = TimerHeap::new();
    let mut last_tick = Instant::now();
    loop {
        select! {
            recv(cmds) -> cmd => match cmd {
                Ok(WheelCmd::Add(timer)) => {
                    heap.insert(timer.id, timer.deadline, timer);
                }
                Ok(WheelCmd::Update { id, deadline }) => {
                    // Unknown ids (already fired or cancelled) are a no-op.
                    heap.update(id, deadline);
                }
                Ok(WheelCmd::Cancel { id }) => {
                    if let Some(mut timer) = heap.remove(id) {
                        if let Some(hook) = timer.on_cancel.take() {
                            let now = Instant::now();
                            slots.dispatch(move || hook(now));
                        }
                    }
                }
                Err(_) => {
                    debug!(pending = heap.len(), "all wheel handles dropped, stopping");
                    return;
                }
            },
            recv(ticker) -> _ => {
                let now = Instant::now();
                let gap = now.duration_since(last_tick);
                if gap > granularity * 4 {
                    trace!(?gap, "tick thread stalled");
                }
                last_tick = now;
                fire_due(&mut heap, now, slots);
            }
        }
    }
}

fn fire_due(heap: &mut TimerHeap<Timer>, now: Instant, slots: &Slots) {
    while let Some((id, deadline, mut timer)) = heap.pop_due(now) {
        match &mut timer.kind {
            TimerKind::OneShot { on_fire, notify } => {
                let on_fire = on_fire.take();
                let notify = notify.clone();
                slots.dispatch(move || {
                    if let Some(f) = on_fire {
                        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            f(now);
                        }));
                    }
                    let _ = notify.try_send(now);
                });
            }
            TimerKind::Repeating { interval, on_fire } => {
                let on_fire = Arc::clone(on_fire);
                slots.dispatch(move || on_fire(now));
                // Catch-up: keep the nominal cadence unless we are so far
                // behind the next deadline is already in the past.
                let mut next = deadline + *interval;
                if next <= now {
                    next = now + *interval;
                }
                timer.deadline = next;
                heap.insert(id, next, timer);
            }
        }
    }
}
