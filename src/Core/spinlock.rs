//! Process-shared spinlock.
//!
//! The lock is a plain `#[repr(C)]` pair of words so it can live inside a
//! mapping shared by several processes. Critical sections guarded by it are
//! expected to last tens of instructions; waiters spin and then yield.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spins before a waiter starts yielding its timeslice.
const SPINS_BEFORE_YIELD: u32 = 128;

#[repr(C)]
pub struct RawSpinLock {
    state: AtomicU32,
    /// Pid of the process currently holding the lock (0 when free).
    owner: AtomicU32,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU32::new(0),
        }
    }

    /// Reset to the unlocked state. Only valid while no other party can
    /// observe the lock (layout initialization).
    pub fn reset(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.state.store(UNLOCKED, Ordering::Release);
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        let mut spins = 0u32;
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(std::process::id(), Ordering::Relaxed);
                return SpinGuard { lock: self };
            }
            // Test-and-test-and-set: wait on a plain load before retrying the CAS
            while self.state.load(Ordering::Relaxed) != UNLOCKED {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.owner.store(std::process::id(), Ordering::Relaxed);
                SpinGuard { lock: self }
            })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    /// Release the lock if it is held by `pid`. Used by dead-client cleanup
    /// after the owner process has exited mid-critical-section.
    ///
    /// Returns true if the lock was released.
    pub fn force_unlock_if_owner(&self, pid: u32) -> bool {
        if pid == 0 || self.owner.load(Ordering::Acquire) != pid {
            return false;
        }
        self.owner.store(0, Ordering::Relaxed);
        self.state
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; the lock is released on drop.
pub struct SpinGuard<'a> {
    lock: &'a RawSpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
