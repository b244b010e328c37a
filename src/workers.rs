//! Worker thread pool.
//!
//! A fixed number of threads (`T`) pull [`WorkItem`]s off a bounded FIFO
//! queue guarded by a mutex, gated by a counting semaphore: the same
//! shape as the original `threadpool<T>`'s `m_queuelocker` + `m_queuestat`
//! pair, generalized from "append a request pointer" to "append a slot
//! index". Strict FIFO; no cross-worker fairness beyond queue order.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::{
    conn::HttpConnection,
    dbpool::Pool,
    error::Error,
    slots::SlotTable,
    sync::{Mutex, Semaphore},
};

struct WorkItem {
    fd: i32,
}

pub struct WorkerPool {
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    sem: Arc<Semaphore>,
    max_queue: usize,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `thread_count` workers, each blocking on `sem` and pulling
    /// from `queue`. Rejects `thread_count == 0` or `max_queue == 0` up
    /// front instead of building a pool that can never make progress.
    pub fn new<C>(
        thread_count: usize,
        max_queue: usize,
        slots: Arc<SlotTable<C>>,
        db: Arc<Pool>,
    ) -> Result<Self, Error>
    where
        C: HttpConnection + Send + 'static,
    {
        if thread_count == 0 || max_queue == 0 {
            return Err(Error::WorkerPoolConfig);
        }

        let queue: Arc<Mutex<VecDeque<WorkItem>>> = Arc::new(Mutex::new(VecDeque::new()));
        let sem = Arc::new(Semaphore::new(0).map_err(Error::Semaphore)?);
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(thread_count);

        for index in 0..thread_count {
            let queue = queue.clone();
            let sem = sem.clone();
            let stop = stop.clone();
            let slots = slots.clone();
            let db = db.clone();
            let handle = thread::Builder::new()
                .name(format!("reactord-worker-{index}"))
                .spawn(move || Self::run(queue, sem, stop, slots, db))
                .map_err(Error::WorkerSpawn)?;
            handles.push(handle);
        }

        Ok(Self {
            queue,
            sem,
            max_queue,
            stop,
            handles,
        })
    }

    fn run<C>(
        queue: Arc<Mutex<VecDeque<WorkItem>>>,
        sem: Arc<Semaphore>,
        stop: Arc<AtomicBool>,
        slots: Arc<SlotTable<C>>,
        db: Arc<Pool>,
    ) where
        C: HttpConnection,
    {
        loop {
            sem.wait();
            if stop.load(Ordering::Acquire) {
                return;
            }
            let item = {
                let mut q = queue.lock();
                match q.pop_front() {
                    Some(item) => item,
                    None => continue, // spurious wake
                }
            };
            let mut lease = db.lease();
            slots.with_conn_mut(item.fd, |conn| conn.process(lease.handle_mut()));
        }
    }

    /// Enqueues `fd`'s pending work. Returns `false` without enqueueing
    /// if the queue already holds more than `max_queue` items. The
    /// off-by-one `len() > max_queue` check is preserved verbatim from
    /// the original `append`, not tightened to `>=`.
    pub fn append(&self, fd: i32) -> bool {
        {
            let mut q = self.queue.lock();
            if q.len() > self.max_queue {
                return false;
            }
            q.push_back(WorkItem { fd });
        }
        self.sem.post();
        true
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops accepting new work, wakes every blocked worker exactly
    /// once, and joins them. Items still queued when this is called are
    /// dropped unprocessed: best-effort draining only.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for _ in 0..self.handles.len() {
            self.sem.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
