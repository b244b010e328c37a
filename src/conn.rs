//! HTTP connection collaborator interface.
//!
//! The request parser and response writer are out of scope here; the
//! reactor only needs four operations from a connection type: `init`,
//! `read_once`, `write`, `process`. [`EchoConnection`] is a minimal
//! concrete implementation, just enough HTTP-adjacent behavior to
//! exercise the reactor end to end, not a production parser.

use std::{
    io,
    net::SocketAddr,
    os::unix::io::RawFd,
};

use crate::sqlhandle::SqlHandle;

/// The collaborator surface the reactor drives on every registered
/// client socket. Implementations own re-arming their `epoll` interest
/// (`EPOLLIN` while awaiting a request, `EPOLLOUT` while a response is
/// pending) the same way the original `http_conn::process`/`write` call
/// `modfd` themselves rather than leaving it to the dispatch loop.
pub trait HttpConnection: Send {
    fn init(&mut self, fd: RawFd, peer_addr: SocketAddr, epoll_fd: RawFd);

    /// Drains the socket into an internal buffer (non-blocking, drained
    /// fully under edge-triggered mode). Returns `false` on EOF or a
    /// fatal read error; the caller must evict.
    fn read_once(&mut self) -> bool;

    /// Flushes pending response bytes. Returns `false` on a fatal write
    /// error; the caller must evict.
    fn write(&mut self) -> bool;

    /// Parses the buffered request and prepares a response, using `db`
    /// for the duration of the call. Runs on a worker thread.
    fn process(&mut self, db: &mut SqlHandle);
}

fn rearm(epoll_fd: RawFd, fd: RawFd, interest: u32) {
    let mut event = libc::epoll_event {
        events: interest | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
        u64: fd as u64,
    };
    unsafe {
        libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event);
    }
}

const READ_CHUNK: usize = 4096;

/// A minimal HTTP/1.1-ish echo connection: reads until it sees the
/// request terminator, pings the leased db handle to prove it has one,
/// and replies with a fixed small body. Good enough to drive the
/// reactor's end-to-end scenarios; not a real HTTP implementation.
#[derive(Default)]
pub struct EchoConnection {
    fd: RawFd,
    epoll_fd: RawFd,
    peer_addr: Option<SocketAddr>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
}

impl EchoConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn request_complete(&self) -> bool {
        self.read_buf.windows(4).any(|w| w == b"\r\n\r\n")
    }
}

impl HttpConnection for EchoConnection {
    fn init(&mut self, fd: RawFd, peer_addr: SocketAddr, epoll_fd: RawFd) {
        self.fd = fd;
        self.epoll_fd = epoll_fd;
        self.peer_addr = Some(peer_addr);
        self.read_buf.clear();
        self.write_buf.clear();
        self.write_pos = 0;
    }

    fn read_once(&mut self) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = unsafe {
                libc::read(self.fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
            };
            if n > 0 {
                self.read_buf.extend_from_slice(&chunk[..n as usize]);
                if (n as usize) < chunk.len() {
                    // Drained for now; more may follow once the caller
                    // re-arms and epoll fires again.
                    return true;
                }
                continue;
            }
            if n == 0 {
                return false; // peer closed
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return true,
                io::ErrorKind::Interrupted => continue,
                _ => return false,
            }
        }
    }

    fn process(&mut self, db: &mut SqlHandle) {
        let _ = db.ping();
        if !self.request_complete() {
            // Nothing to respond to yet; keep waiting for more bytes.
            rearm(self.epoll_fd, self.fd, libc::EPOLLIN as u32);
            return;
        }
        let body = b"reactord ok";
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        self.write_buf = response;
        self.write_pos = 0;
        self.read_buf.clear();
        rearm(self.epoll_fd, self.fd, libc::EPOLLOUT as u32);
    }

    fn write(&mut self) -> bool {
        while self.write_pos < self.write_buf.len() {
            let remaining = &self.write_buf[self.write_pos..];
            let n = unsafe {
                libc::write(self.fd, remaining.as_ptr() as *const libc::c_void, remaining.len())
            };
            if n > 0 {
                self.write_pos += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    rearm(self.epoll_fd, self.fd, libc::EPOLLOUT as u32);
                    return true;
                }
                io::ErrorKind::Interrupted => continue,
                _ => return false,
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        rearm(self.epoll_fd, self.fd, libc::EPOLLIN as u32);
        true
    }
}
