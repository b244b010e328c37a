//! SQL driver collaborator.
//!
//! The core treats the SQL driver as an opaque handle type: it
//! opens/closes/pings it and never calls any query surface. `SqlHandle`
//! stands in for a real MySQL client by holding a live TCP connection to
//! the configured database endpoint, enough to prove connectivity at
//! pool-init time and to support `ping`, without pulling in a full
//! wire-protocol driver the core never drives.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub port: u16,
}

/// An opaque database connection handle. No query methods are exposed;
/// the core only manages its lifecycle (open/close/ping).
pub struct SqlHandle {
    stream: TcpStream,
    cfg: DbConfig,
}

impl SqlHandle {
    /// Opens a new handle against `cfg`. This is the only place the
    /// `(host, user, password, db, port)` constructor tuple is consumed.
    pub fn open(cfg: &DbConfig) -> io::Result<Self> {
        let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        Ok(Self {
            stream,
            cfg: cfg.clone(),
        })
    }

    /// Liveness check: a zero-length non-blocking peek that fails only if
    /// the peer has gone away. Never invoked by the core itself; it
    /// exists for the collaborator surface callers can use directly.
    pub fn ping(&self) -> io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1];
        let res = match self.stream.peek(&mut buf) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        };
        self.stream.set_nonblocking(false)?;
        res
    }

    pub fn database(&self) -> &str {
        &self.cfg.database
    }

    /// Closes the underlying connection. Consumes `self`; the pool calls
    /// this during teardown instead of relying on `Drop` so close errors
    /// are observable.
    pub fn close(mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    #[allow(dead_code)]
    fn write_probe(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.stream.write(bytes)
    }

    #[allow(dead_code)]
    fn read_probe(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn open_and_close_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = thread::spawn(move || {
            let _ = listener.accept();
        });

        let cfg = DbConfig {
            host: addr.ip().to_string(),
            user: "root".into(),
            password: "".into(),
            database: "mydb".into(),
            port: addr.port(),
        };
        let handle = SqlHandle::open(&cfg).unwrap();
        assert_eq!(handle.database(), "mydb");
        handle.close().unwrap();
        accept_thread.join().unwrap();
    }
}
