//! Crate-wide error type.
//!
//! Every fallible constructor in the reactor core (pool init, worker
//! pool construction, reactor bring-up) returns [`Error`] so `main` can
//! convert any of them into exit code 1 uniformly.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create OS semaphore: {0}")]
    Semaphore(#[source] io::Error),

    #[error("db pool init failed: could not open handle {index} of {total}: {source}")]
    PoolInit {
        index: usize,
        total: usize,
        #[source]
        source: io::Error,
    },

    #[error("db pool teardown called with {leased} lease(s) still outstanding")]
    PoolTeardownBusy { leased: usize },

    #[error("worker pool requires thread_count > 0 and max_queue > 0")]
    WorkerPoolConfig,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("reactor bring-up failed: {0}")]
    ReactorInit(#[source] io::Error),

    #[error("failed to install signal handler for {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
