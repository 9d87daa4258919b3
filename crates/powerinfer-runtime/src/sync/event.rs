//! Readiness flags with a configurable waiting policy

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::config::WaitStrategy;

/// Condition variable used by the block fallback of [`WaitStrategy`]
#[derive(Debug, Default)]
pub(crate) struct Parker {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Parker {
    /// Wait until `done` returns true, polling according to `strategy`
    pub(crate) fn wait_until<F>(&self, strategy: WaitStrategy, done: F)
    where
        F: Fn() -> bool,
    {
        match strategy {
            WaitStrategy::Spin => {
                while !done() {
                    std::hint::spin_loop();
                }
            }
            WaitStrategy::Yield => {
                while !done() {
                    thread::yield_now();
                }
            }
            WaitStrategy::SpinThenBlock { spin_iterations } => {
                for _ in 0..spin_iterations {
                    if done() {
                        return;
                    }
                    std::hint::spin_loop();
                }
                let mut guard = self.lock.lock();
                while !done() {
                    self.cond.wait(&mut guard);
                }
            }
        }
    }

    /// Wake blocked waiters. Call after publishing the state `done` reads.
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// One-shot readiness flag: `false` while work is in flight, `true` once done
#[derive(Debug)]
pub struct ReadyEvent {
    ready: AtomicBool,
    parker: Parker,
    strategy: WaitStrategy,
}

impl ReadyEvent {
    /// Create an event in the given state
    pub fn new(ready: bool, strategy: WaitStrategy) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            parker: Parker::default(),
            strategy,
        }
    }

    /// Mark work as in flight
    pub fn set(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Mark work as complete and wake waiters
    pub fn finish(&self) {
        self.ready.store(true, Ordering::Release);
        self.parker.notify_all();
    }

    /// Whether the work has completed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait until the work has completed
    pub fn wait(&self) {
        self.parker
            .wait_until(self.strategy, || self.ready.load(Ordering::Acquire));
    }

    /// Waiting policy of this event
    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }
}

impl Default for ReadyEvent {
    fn default() -> Self {
        Self::new(true, WaitStrategy::default())
    }
}
