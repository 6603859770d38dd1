//! Bounded callback slots.
//!
//! A fixed set of worker threads drains a bounded job channel. When every
//! slot is busy, `dispatch` spawns a one-off overflow thread rather than
//! stalling the caller; timer ticks and session pumps must never block on a
//! slow handler. `dispatch_wait` is the blocking variant used where caller
//! backpressure is wanted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Sender, TrySendError};

use crate::trace::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct Slots {
    jobs: Sender<Job>,
    name: &'static str,
}

impl Slots {
    /// Spawn `workers` slot threads named `{name}-{i}`.
    #[must_use]
    pub fn new(workers: usize, name: &'static str) -> Self {
        assert!(workers > 0, "slots need at least one worker");
        let (tx, rx) = bounded::<Job>(workers * 2);
        for i in 0..workers {
            let rx = rx.clone();
            let builder = thread::Builder::new().name(format!("{name}-{i}"));
            builder
                .spawn(move || {
                    for job in rx.iter() {
                        run_caught(job);
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn {name}-{i}: {e}"));
        }
        Self { jobs: tx, name }
    }

    /// Run `job` on a slot, spawning an overflow thread if all slots are
    /// busy. Never blocks.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match self.jobs.try_send(Box::new(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                warn!(slots = self.name, "all slots busy, spawning overflow thread");
                // Shared slot so the job survives a failed spawn and can
                // still run inline, without ever running twice.
                let job = Arc::new(Mutex::new(Some(job)));
                let spawned = Arc::clone(&job);
                let builder = thread::Builder::new().name(format!("{}-overflow", self.name));
                if builder
                    .spawn(move || {
                        if let Some(job) = spawned.lock().unwrap().take() {
                            run_caught(job);
                        }
                    })
                    .is_err()
                {
                    warn!(slots = self.name, "overflow spawn failed, running inline");
                    if let Some(job) = job.lock().unwrap().take() {
                        run_caught(job);
                    }
                }
            }
        }
    }

    /// Run `job` on a slot, blocking until one frees up. Caps the caller's
    /// in-flight work at the slot count.
    pub fn dispatch_wait(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.jobs.send(Box::new(job)) {
            // All workers gone; do not lose the job.
            run_caught(e.into_inner());
        }
    }
}

fn run_caught(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("dispatched job panicked");
    }
}
