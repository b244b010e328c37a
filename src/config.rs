//! Ambient configuration & CLI surface.
//!
//! Mirrors `volo-cli`'s `clap::Parser` derive pattern: one struct is both
//! the CLI surface and (via `Cli::into_config`) the typed configuration
//! the rest of the crate consumes. Defaults match the original's
//! hardcoded constants: `T = 8` worker threads, `Q = 10000` max queue
//! depth, `MAX_FD = 65536`, `TIMESLOT = 5s`.

use std::{net::IpAddr, path::PathBuf};

use clap::Parser;

pub const DEFAULT_THREAD_COUNT: usize = 8;
pub const DEFAULT_MAX_QUEUE: usize = 10_000;
pub const DEFAULT_MAX_FD: usize = 65_536;
pub const DEFAULT_TIMESLOT_SECS: u64 = 5;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Parser)]
#[command(name = "reactord", about = "Single-process epoll HTTP reactor")]
pub struct Cli {
    /// Address to bind the listening socket to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to bind the listening socket to.
    pub port: u16,

    /// Database host.
    #[arg(long, default_value = "127.0.0.1")]
    pub db_host: String,

    /// Database port.
    #[arg(long, default_value_t = 3306)]
    pub db_port: u16,

    /// Database user.
    #[arg(long, default_value = "root")]
    pub db_user: String,

    /// Database password.
    #[arg(long, default_value = "")]
    pub db_password: String,

    /// Database name.
    #[arg(long, default_value = "reactord")]
    pub db_name: String,

    /// Size of the DB connection pool.
    #[arg(long, default_value_t = DEFAULT_THREAD_COUNT)]
    pub db_pool_size: usize,

    /// Worker thread count (`T`).
    #[arg(long, default_value_t = DEFAULT_THREAD_COUNT)]
    pub threads: usize,

    /// Max dispatch queue depth (`Q`).
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUE)]
    pub max_queue: usize,

    /// Max tracked file descriptor value (`MAX_FD`).
    #[arg(long, default_value_t = DEFAULT_MAX_FD)]
    pub max_fd: usize,

    /// Timer sweep interval in seconds (`TIMESLOT`).
    #[arg(long, default_value_t = DEFAULT_TIMESLOT_SECS)]
    pub timeslot_secs: u64,

    /// Idle connection eviction threshold in seconds.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    /// Log file path.
    #[arg(long, default_value = "reactord.log")]
    pub log_file: PathBuf,

    /// Lines buffered by the async log writer before it blocks (0 = synchronous).
    #[arg(long, default_value_t = 800)]
    pub log_queue_depth: usize,
}

impl Cli {
    pub fn into_config(self) -> Config {
        Config {
            bind: self.bind,
            port: self.port,
            db: crate::sqlhandle::DbConfig {
                host: self.db_host,
                user: self.db_user,
                password: self.db_password,
                database: self.db_name,
                port: self.db_port,
            },
            db_pool_size: self.db_pool_size,
            threads: self.threads,
            max_queue: self.max_queue,
            max_fd: self.max_fd,
            timeslot_secs: self.timeslot_secs,
            idle_timeout_secs: self.idle_timeout_secs,
            log_file: self.log_file,
            log_queue_depth: self.log_queue_depth,
        }
    }
}

/// Resolved runtime configuration, independent of how it was sourced.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub db: crate::sqlhandle::DbConfig,
    pub db_pool_size: usize,
    pub threads: usize,
    pub max_queue: usize,
    pub max_fd: usize,
    pub timeslot_secs: u64,
    pub idle_timeout_secs: u64,
    pub log_file: PathBuf,
    pub log_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            db: crate::sqlhandle::DbConfig {
                host: "127.0.0.1".into(),
                user: "root".into(),
                password: String::new(),
                database: "reactord".into(),
                port: 3306,
            },
            db_pool_size: DEFAULT_THREAD_COUNT,
            threads: DEFAULT_THREAD_COUNT,
            max_queue: DEFAULT_MAX_QUEUE,
            max_fd: DEFAULT_MAX_FD,
            timeslot_secs: DEFAULT_TIMESLOT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            log_file: PathBuf::from("reactord.log"),
            log_queue_depth: 800,
        }
    }
}
