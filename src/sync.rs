//! Synchronization primitives.
//!
//! Thin, scoped-acquisition wrappers the rest of the crate builds on: a
//! mutex, a counting semaphore, and a condition variable with both
//! unbounded and deadline-bounded waits. The semaphore is the one
//! primitive the original implementation could fail to construct (POSIX
//! `sem_init`), so it is the one whose constructor here returns
//! `io::Result`; `std::sync::Mutex`/`Condvar` cannot fail to construct on
//! this platform and are wrapped only for the scoped-acquisition surface.

use std::{
    cell::UnsafeCell,
    io,
    mem::MaybeUninit,
    sync::{self, MutexGuard},
    time::Duration,
};

/// A mutex guarding arbitrary state, released unconditionally when the
/// returned guard drops.
pub struct Mutex<T>(sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self(sync::Mutex::new(value))
    }

    /// Acquire the lock. A panic while holding the lock recovers the
    /// inner value rather than poisoning every future acquisition; the
    /// reactor's mutex-held regions are O(1) list/count mutations and are
    /// not expected to panic, but a crashed worker should not wedge the
    /// whole pool.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// A condition variable pairing with [`Mutex`]'s guard type.
pub struct Condvar(sync::Condvar);

impl Condvar {
    pub fn new() -> Self {
        Self(sync::Condvar::new())
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.0.wait(guard).unwrap_or_else(|poison| poison.into_inner())
    }

    /// Returns the reacquired guard and `true` if the wait timed out
    /// before being signaled.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = self
            .0
            .wait_timeout(guard, dur)
            .unwrap_or_else(|poison| poison.into_inner());
        (guard, result.timed_out())
    }

    pub fn signal(&self) {
        self.0.notify_one();
    }

    pub fn broadcast(&self) {
        self.0.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore (P/V), backed by a raw POSIX semaphore so
/// construction can fail exactly the way the original `sem` wrapper
/// could (`sem_init` returning non-zero).
pub struct Semaphore {
    raw: UnsafeCell<libc::sem_t>,
}

// The raw sem_t is safe to share across threads; all access goes through
// sem_wait/sem_post/sem_getvalue, which are themselves thread-safe.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(initial: u32) -> io::Result<Self> {
        let mut raw = MaybeUninit::<libc::sem_t>::uninit();
        // pshared = 0: shared between threads of this process only.
        let ret = unsafe { libc::sem_init(raw.as_mut_ptr(), 0, initial) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            raw: UnsafeCell::new(unsafe { raw.assume_init() }),
        })
    }

    /// Blocks until the count is positive, then decrements it.
    /// Interrupted waits (EINTR) are retried rather than surfaced.
    pub fn wait(&self) {
        loop {
            let ret = unsafe { libc::sem_wait(self.raw.get()) };
            if ret == 0 {
                return;
            }
            if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return;
            }
        }
    }

    /// Increments the count, waking one waiter if any is blocked.
    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.raw.get());
        }
    }

    /// Current count; used only by tests to assert invariants.
    pub fn value(&self) -> i32 {
        let mut value: i32 = 0;
        unsafe {
            libc::sem_getvalue(self.raw.get(), &mut value);
        }
        value
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.raw.get());
        }
    }
}
