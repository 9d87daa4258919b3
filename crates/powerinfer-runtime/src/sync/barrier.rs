//! Worker barrier and one-shot leader gate

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::event::Parker;
use crate::config::WaitStrategy;

/// Reusable counting barrier for a fixed number of workers.
///
/// Arrivals are counted monotonically; a worker arriving as number `cur`
/// waits until the count reaches the end of its generation,
/// `(cur / width + 1) * width`. No reset step is needed between phases.
#[derive(Debug)]
pub struct SpinBarrier {
    width: usize,
    count: AtomicUsize,
    parker: Parker,
    strategy: WaitStrategy,
}

impl SpinBarrier {
    /// Create a barrier for `width` workers
    pub fn new(width: usize, strategy: WaitStrategy) -> Self {
        debug_assert!(width > 0);
        Self {
            width: width.max(1),
            count: AtomicUsize::new(0),
            parker: Parker::default(),
            strategy,
        }
    }

    /// Number of workers that must arrive per generation
    pub fn width(&self) -> usize {
        self.width
    }

    /// Arrive and wait for the rest of the generation.
    ///
    /// Returns `true` for the last worker to arrive.
    pub fn wait(&self) -> bool {
        let cur = self.count.fetch_add(1, Ordering::AcqRel);
        let target = (cur / self.width + 1) * self.width;

        if cur + 1 == target {
            self.parker.notify_all();
            return true;
        }

        self.parker
            .wait_until(self.strategy, || self.count.load(Ordering::Acquire) >= target);
        false
    }
}

/// Test-and-set flag electing exactly one worker for one-time shared work
#[derive(Debug, Default)]
pub struct TestAndSetGate {
    claimed: AtomicBool,
}

impl TestAndSetGate {
    /// Create an unclaimed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate; `true` only for the first caller
    pub fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Whether someone has claimed the gate
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Reopen the gate for the next job
    pub fn reset(&self) {
        self.claimed.store(false, Ordering::Release);
    }
}
