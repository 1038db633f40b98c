//! Platform glue: the shared interrupt word and native timekeeping.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Number of interrupt lines; line 0 is the plain "leave the inner loop"
/// request, lines 1 and up belong to trigger-bound events.
pub const MAX_LINES: u32 = 32;

/// One word of pending interrupt bits, shared with interrupt handlers.
///
/// `raise` is the only entry meant for other threads; everything else
/// belongs to the scheduler thread. Cloning yields another handle onto the
/// same word.
#[derive(Clone)]
pub struct InterruptLine {
    inner: Arc<Inner>,
}

struct Inner {
    word: AtomicU32,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                word: AtomicU32::new(0),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Set one pending bit and wake an idling scheduler. Safe to call from
    /// any thread at any time.
    pub fn raise(&self, line: u32) {
        assert!(line < MAX_LINES, "interrupt line {line} out of range");
        self.inner.word.fetch_or(1 << line, Ordering::Release);
        let _held = self.inner.lock.lock();
        self.inner.wakeup.notify_all();
    }

    /// Drain all pending bits in one atomic swap.
    pub fn take_all(&self) -> u32 {
        self.inner.word.swap(0, Ordering::AcqRel)
    }

    pub fn peek(&self) -> u32 {
        self.inner.word.load(Ordering::Acquire)
    }

    /// Block until a bit is raised or the timeout elapses.
    pub fn wait(&self, timeout: Duration) {
        if self.peek() != 0 {
            return;
        }
        let mut held = self.inner.lock.lock();
        if self.peek() == 0 {
            let _ = self.inner.wakeup.wait_for(&mut held, timeout);
        }
    }
}

impl Default for InterruptLine {
    fn default() -> Self {
        Self::new()
    }
}

/// Native host: a millisecond clock and a polite idle wait.
pub struct NativeArch {
    epoch: Instant,
    line: InterruptLine,
}

impl NativeArch {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            line: InterruptLine::new(),
        }
    }

    pub fn line(&self) -> InterruptLine {
        self.line.clone()
    }

    /// Milliseconds since startup, wrapping like a hardware tick counter.
    pub fn millis(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Nothing runnable: sleep until an interrupt or a short tick.
    pub fn idle(&self) {
        self.line.wait(Duration::from_millis(10));
    }
}

impl Default for NativeArch {
    fn default() -> Self {
        Self::new()
    }
}
