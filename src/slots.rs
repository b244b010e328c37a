//! Connection slot table.
//!
//! A dense array indexed directly by file descriptor value, bounded by
//! `MAX_FD`, matching the original's `users_`/`client_data` arrays each
//! sized `MAX_FD` and indexed directly by fd. The per-connection state
//! and the client-address/timer-backreference bookkeeping are merged
//! into one row (`Slot<C>`) rather than kept as two parallel `Vec`s,
//! since nothing here ever needs to address one half without the
//! other.

use std::{net::SocketAddr, os::unix::io::RawFd, sync::atomic::{AtomicUsize, Ordering}};

use crate::{sync::Mutex, timer::TimerId};

/// Per-connection state: the collaborator instance plus the bookkeeping
/// the reactor needs to find it again (peer address for logging, the
/// timer node backing its idle eviction).
pub struct Slot<C> {
    pub peer_addr: SocketAddr,
    pub timer_id: Option<TimerId>,
    pub conn: C,
}

/// Dense, `fd`-indexed table of active connection slots. Rows are
/// individually locked so a worker thread can mutate the slot it
/// dequeued while the reactor thread mutates a different row; the
/// reactor never touches a row it has handed to a worker until that
/// worker's `process()` call returns, so in practice contention on any
/// one row is never cross-thread.
pub struct SlotTable<C> {
    rows: Vec<Mutex<Option<Slot<C>>>>,
    active: AtomicUsize,
}

impl<C> SlotTable<C> {
    pub fn new(capacity: usize) -> Self {
        let mut rows = Vec::with_capacity(capacity);
        rows.resize_with(capacity, || Mutex::new(None));
        Self {
            rows,
            active: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    /// Live slot count, maintained across `activate`/`deactivate`.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn activate(&self, fd: RawFd, slot: Slot<C>) {
        *self.rows[fd as usize].lock() = Some(slot);
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes and returns the slot at `fd`, decrementing the active
    /// count. A no-op returning `None` if the slot was already gone:
    /// the reactor's error and timer-eviction paths can both reach the
    /// same fd for the same disconnect, and eviction must be
    /// idempotent.
    pub fn deactivate(&self, fd: RawFd) -> Option<Slot<C>> {
        let removed = self.rows[fd as usize].lock().take();
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn is_active(&self, fd: RawFd) -> bool {
        self.rows[fd as usize].lock().is_some()
    }

    /// Fds currently holding a live slot, in ascending order. Used by
    /// shutdown to close out every remaining connection.
    pub fn active_fds(&self) -> Vec<RawFd> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.lock().is_some())
            .map(|(fd, _)| fd as RawFd)
            .collect()
    }

    pub fn with_conn_mut<R>(&self, fd: RawFd, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut guard = self.rows[fd as usize].lock();
        guard.as_mut().map(|slot| f(&mut slot.conn))
    }

    pub fn timer_id(&self, fd: RawFd) -> Option<TimerId> {
        self.rows[fd as usize].lock().as_ref().and_then(|s| s.timer_id)
    }

    pub fn set_timer_id(&self, fd: RawFd, id: Option<TimerId>) {
        if let Some(slot) = self.rows[fd as usize].lock().as_mut() {
            slot.timer_id = id;
        }
    }

    pub fn peer_addr(&self, fd: RawFd) -> Option<SocketAddr> {
        self.rows[fd as usize].lock().as_ref().map(|s| s.peer_addr)
    }
}
