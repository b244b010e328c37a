//! DB connection pool with scoped leasing.
//!
//! A fixed-size pool of [`SqlHandle`]s. `lease()` blocks on a semaphore
//! whose value tracks the idle count, then does an O(1) mutex-guarded
//! list pop; the returned [`Lease`] gives the handle back to the pool
//! unconditionally when it drops. This mirrors `connection_pool` /
//! `connectionRAII` from the original implementation and the
//! `Arc<Mutex<Inner>>`-around-an-idle-list shape used by `volo-thrift`'s
//! own connection pool (`transport::pool::Pool`), with the blocking
//! handled by a counting semaphore instead of async oneshot waiters.

use std::{collections::VecDeque, sync::Arc};

use crate::{
    error::Error,
    sqlhandle::{DbConfig, SqlHandle},
    sync::{Mutex, Semaphore},
};

struct Inner {
    idle: VecDeque<SqlHandle>,
    leased: usize,
}

pub struct Pool {
    inner: Mutex<Inner>,
    sem: Semaphore,
    capacity: usize,
}

impl Pool {
    /// Opens exactly `capacity` handles eagerly against `cfg`. Fails as a
    /// whole, closing everything already opened, if any handle cannot
    /// be opened.
    pub fn init(cfg: &DbConfig, capacity: usize) -> Result<Arc<Pool>, Error> {
        let mut idle = VecDeque::with_capacity(capacity);
        for index in 0..capacity {
            match SqlHandle::open(cfg) {
                Ok(handle) => idle.push_back(handle),
                Err(source) => {
                    while let Some(handle) = idle.pop_front() {
                        let _ = handle.close();
                    }
                    return Err(Error::PoolInit {
                        index,
                        total: capacity,
                        source,
                    });
                }
            }
        }
        let sem = Semaphore::new(capacity as u32).map_err(Error::Semaphore)?;
        Ok(Arc::new(Pool {
            inner: Mutex::new(Inner { idle, leased: 0 }),
            sem,
            capacity,
        }))
    }

    /// Blocks until a handle is available, then leases it.
    pub fn lease(self: &Arc<Self>) -> Lease {
        self.sem.wait();
        let handle = {
            let mut inner = self.inner.lock();
            let handle = inner
                .idle
                .pop_front()
                .expect("semaphore accounting guarantees an idle handle is present");
            inner.leased += 1;
            handle
        };
        Lease {
            pool: self.clone(),
            handle: Some(handle),
        }
    }

    fn return_handle(&self, handle: SqlHandle) {
        {
            let mut inner = self.inner.lock();
            inner.idle.push_back(handle);
            inner.leased -= 1;
        }
        self.sem.post();
    }

    /// Closes every idle handle. Errors rather than blocking or
    /// corrupting state if leases are still outstanding: the original's
    /// `DestroyPool` has undefined behavior here, and this implementation
    /// picks the safe, observable alternative.
    pub fn teardown(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.leased != 0 {
            return Err(Error::PoolTeardownBusy {
                leased: inner.leased,
            });
        }
        while let Some(handle) = inner.idle.pop_front() {
            let _ = handle.close();
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn leased_count(&self) -> usize {
        self.inner.lock().leased
    }

    /// Exposed for the invariant tests below.
    pub fn semaphore_value(&self) -> i32 {
        self.sem.value()
    }
}

/// A scoped lease on a [`SqlHandle`]. Drop returns the handle to the pool
/// unconditionally. A worker installs this into its connection slot for
/// the duration of `process()` and lets it fall out of scope afterward.
pub struct Lease {
    pool: Arc<Pool>,
    handle: Option<SqlHandle>,
}

impl Lease {
    pub fn handle(&self) -> &SqlHandle {
        self.handle.as_ref().expect("handle taken before drop")
    }

    pub fn handle_mut(&mut self) -> &mut SqlHandle {
        self.handle.as_mut().expect("handle taken before drop")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.return_handle(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn local_db_config(accept_loops: usize) -> (DbConfig, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            for _ in 0..accept_loops {
                if listener.accept().is_err() {
                    break;
                }
            }
        });
        (
            DbConfig {
                host: addr.ip().to_string(),
                user: "root".into(),
                password: String::new(),
                database: "mydb".into(),
                port: addr.port(),
            },
            handle,
        )
    }

    #[test]
    fn lease_then_drop_restores_prior_state() {
        let (cfg, accept_thread) = local_db_config(2);
        let pool = Pool::init(&cfg, 2).unwrap();
        assert_eq!((pool.idle_count(), pool.leased_count(), pool.semaphore_value()), (2, 0, 2));

        let lease = pool.lease();
        assert_eq!((pool.idle_count(), pool.leased_count(), pool.semaphore_value()), (1, 1, 1));
        drop(lease);
        assert_eq!((pool.idle_count(), pool.leased_count(), pool.semaphore_value()), (2, 0, 2));
        accept_thread.join().unwrap();
    }

    #[test]
    fn pool_exhaustion_blocks_then_unblocks() {
        let (cfg, accept_thread) = local_db_config(2);
        let pool = Pool::init(&cfg, 2).unwrap();

        let first = pool.lease();
        let second = pool.lease();

        let pool2 = pool.clone();
        let started = Instant::now();
        let waiter = thread::spawn(move || {
            let _third = pool2.lease();
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        drop(first);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40));

        drop(second);
        accept_thread.join().unwrap();
    }

    #[test]
    fn teardown_fails_while_leases_outstanding() {
        let (cfg, accept_thread) = local_db_config(1);
        let pool = Pool::init(&cfg, 1).unwrap();
        let lease = pool.lease();
        assert!(matches!(pool.teardown(), Err(Error::PoolTeardownBusy { leased: 1 })));
        drop(lease);
        assert!(pool.teardown().is_ok());
        accept_thread.join().unwrap();
    }
}
