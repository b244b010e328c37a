//! Reactor event loop.
//!
//! The single thread that owns the `epoll` instance, the listening
//! socket, and the ordered timer list. It demultiplexes readiness
//! across three kinds of fd: the listener (level-triggered, always
//! armed), client sockets (edge-triggered, one-shot, re-armed by the
//! connection itself once its worker finishes), and the two signal
//! self-pipes from [`crate::signal`]. Everything it does with a ready
//! client fd beyond "read it" / "hand it to a worker" is delegated to
//! [`crate::conn::HttpConnection`] and [`crate::workers::WorkerPool`];
//! this module is wiring, not policy.

use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    conn::HttpConnection,
    config::Config,
    dbpool::Pool,
    error::Error,
    logsink::Logger,
    signal::{self, SignalBridge},
    slots::{Slot, SlotTable},
    timer::TimerList,
    workers::WorkerPool,
};

/// `MAX_EVENT_NUMBER` from the original: the epoll readiness buffer size.
const MAX_EVENTS: usize = 10_000;

fn epoll_add(epoll_fd: RawFd, fd: RawFd, events: u32) -> std::io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: fd as u64 };
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_mod(epoll_fd: RawFd, fd: RawFd, events: u32) {
    let mut ev = libc::epoll_event { events, u64: fd as u64 };
    unsafe {
        libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev);
    }
}

fn epoll_del(epoll_fd: RawFd, fd: RawFd) {
    unsafe {
        libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
    }
}

/// Builds the listening socket through `socket2` rather than
/// `TcpListener::bind` directly, so `SO_REUSEADDR` can be set before
/// `bind` the way the original sets it with a raw `setsockopt` call
/// right before its own `bind`/`listen`.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(socket.into())
}

/// Owns the reactor thread's state. Parameterized over the connection
/// type so the crate's consumers can plug in a real HTTP implementation
/// in place of [`crate::conn::EchoConnection`] without touching this
/// module.
pub struct Reactor<C, F>
where
    C: HttpConnection + Send + 'static,
    F: Fn() -> C + Send + Sync + 'static,
{
    epoll_fd: RawFd,
    listener: TcpListener,
    signals: SignalBridge,
    slots: Arc<SlotTable<C>>,
    timers: TimerList,
    workers: WorkerPool,
    db_pool: Arc<Pool>,
    logger: Arc<dyn Logger>,
    conn_factory: F,
    config: Config,
}

impl<C, F> Reactor<C, F>
where
    C: HttpConnection + Send + 'static,
    F: Fn() -> C + Send + Sync + 'static,
{
    /// Brings up the listener, the `epoll` instance, the signal bridge,
    /// the DB pool, and the worker pool, in that order, matching the
    /// original `main`'s init sequence: init failures are fatal, surfaced
    /// before the first `epoll_wait`.
    pub fn bind(config: Config, conn_factory: F, logger: Arc<dyn Logger>) -> Result<Self, Error> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::ReactorInit(std::io::Error::last_os_error()));
        }

        let listener = bind_listener(SocketAddr::new(config.bind, config.port))
            .map_err(Error::ReactorInit)?;
        epoll_add(epoll_fd, listener.as_raw_fd(), libc::EPOLLIN as u32)
            .map_err(Error::ReactorInit)?;

        let signals = SignalBridge::install()?;
        epoll_add(epoll_fd, signals.alarm_fd(), libc::EPOLLIN as u32).map_err(Error::ReactorInit)?;
        epoll_add(epoll_fd, signals.term_fd(), libc::EPOLLIN as u32).map_err(Error::ReactorInit)?;

        let db_pool = Pool::init(&config.db, config.db_pool_size)?;
        let slots = Arc::new(SlotTable::new(config.max_fd));
        let workers = WorkerPool::new(config.threads, config.max_queue, slots.clone(), db_pool.clone())?;

        signal::arm_alarm(config.timeslot_secs as u32);

        Ok(Self {
            epoll_fd,
            listener,
            signals,
            slots,
            timers: TimerList::new(),
            workers,
            db_pool,
            logger,
            conn_factory,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until a `SIGTERM` arrives, then tears down the worker pool
    /// and DB pool and returns. Consumes `self`; the reactor has no
    /// further use once the loop exits.
    pub fn run(mut self) -> Result<(), Error> {
        let mut events: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let listener_fd = self.listener.as_raw_fd();
        let alarm_fd = self.signals.alarm_fd();
        let term_fd = self.signals.term_fd();

        'outer: loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, -1)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::ReactorInit(err));
            }

            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                let flags = ev.events;

                if fd == listener_fd {
                    self.accept_loop();
                } else if fd == alarm_fd {
                    self.signals.drain_alarm();
                    self.sweep_idle();
                    signal::arm_alarm(self.config.timeslot_secs as u32);
                } else if fd == term_fd {
                    self.signals.drain_term();
                    self.logger.info("SIGTERM received, shutting down");
                    break 'outer;
                } else {
                    self.dispatch_client_event(fd, flags);
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.handle_accept(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.logger.error(&format!("accept failed: {e}"));
                    break;
                }
            }
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let fd = stream.into_raw_fd();

        if fd as usize >= self.slots.capacity() || self.slots.active_count() >= self.slots.capacity()
        {
            reject_busy(fd, &*self.logger);
            return;
        }

        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
        }

        let mut conn = (self.conn_factory)();
        conn.init(fd, peer, self.epoll_fd);
        self.slots.activate(
            fd,
            Slot {
                peer_addr: peer,
                timer_id: None,
                conn,
            },
        );

        let expire = Instant::now() + Duration::from_secs(self.config.idle_timeout_secs);
        let timer_id = self.timers.add(fd as usize, expire);
        self.slots.set_timer_id(fd, Some(timer_id));

        if epoll_add(
            self.epoll_fd,
            fd,
            libc::EPOLLIN as u32 | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
        )
        .is_err()
        {
            self.logger.error("epoll_ctl(ADD) failed for accepted socket");
            evict(&self.slots, &mut self.timers, self.epoll_fd, fd);
        }
    }

    fn dispatch_client_event(&mut self, fd: RawFd, flags: u32) {
        let hangup = flags & (libc::EPOLLRDHUP as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0;
        if hangup {
            evict(&self.slots, &mut self.timers, self.epoll_fd, fd);
            return;
        }

        if flags & libc::EPOLLIN as u32 != 0 {
            let ok = self.slots.with_conn_mut(fd, |c| c.read_once());
            match ok {
                Some(true) => {
                    self.touch_timer(fd);
                    self.workers.append(fd);
                }
                _ => evict(&self.slots, &mut self.timers, self.epoll_fd, fd),
            }
            return;
        }

        if flags & libc::EPOLLOUT as u32 != 0 {
            let ok = self.slots.with_conn_mut(fd, |c| c.write());
            match ok {
                Some(true) => self.touch_timer(fd),
                _ => evict(&self.slots, &mut self.timers, self.epoll_fd, fd),
            }
        }
    }

    /// Pushes `fd`'s idle-eviction deadline forward on any observed
    /// progress: activity resets the clock.
    fn touch_timer(&mut self, fd: RawFd) {
        if let Some(timer_id) = self.slots.timer_id(fd) {
            let expire = Instant::now() + Duration::from_secs(self.config.idle_timeout_secs);
            self.timers.adjust(timer_id, expire);
        }
    }

    /// Drains every timer whose deadline has passed, closing and
    /// deregistering each connection. Runs once per `SIGALRM`.
    fn sweep_idle(&mut self) {
        let slots = &self.slots;
        let epoll_fd = self.epoll_fd;
        let logger = &*self.logger;
        self.timers.tick(Instant::now(), |slot_index| {
            let fd = slot_index as RawFd;
            logger.info(&format!("evicting idle connection fd={fd}"));
            evict_no_timer(slots, epoll_fd, fd);
        });
    }

    /// Drains the worker pool, tears down the DB pool, then destroys the
    /// slot table by evicting every connection still registered (closing
    /// its fd and dropping its timer node), leaving `active_count() == 0`
    /// before the listener and epoll instance are closed.
    fn shutdown(mut self) {
        self.logger.info("worker pool draining");
        self.workers.shutdown();
        if let Err(err) = self.db_pool.teardown() {
            self.logger.error(&format!("db pool teardown: {err}"));
        }
        for fd in self.slots.active_fds() {
            evict(&self.slots, &mut self.timers, self.epoll_fd, fd);
        }
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// Sends the literal busy banner and closes. Raw bytes, not a formatted
/// HTTP response: the client never gets far enough into the protocol for
/// one, since this fires before a slot (and therefore any HTTP state) is
/// ever allocated for the new descriptor.
fn reject_busy(fd: RawFd, logger: &dyn Logger) {
    const MSG: &[u8] = b"Internal server busy";
    unsafe {
        libc::write(fd, MSG.as_ptr() as *const libc::c_void, MSG.len());
        libc::close(fd);
    }
    logger.error("connection rejected: at capacity (MAX_FD reached)");
}

/// Evicts a connection the reactor itself is giving up on (read/write
/// failure, hangup, registration failure): removes its `epoll`
/// registration, its slot, and its still-live timer node.
fn evict<C>(slots: &SlotTable<C>, timers: &mut TimerList, epoll_fd: RawFd, fd: RawFd) {
    epoll_del(epoll_fd, fd);
    if let Some(slot) = slots.deactivate(fd) {
        if let Some(timer_id) = slot.timer_id {
            timers.remove(timer_id);
        }
    }
    unsafe {
        libc::close(fd);
    }
}

/// Evicts a connection whose timer node has *already* been removed by
/// [`TimerList::tick`]. Used from inside the `tick` callback itself, so
/// it must not call `timers.remove` again.
fn evict_no_timer<C>(slots: &SlotTable<C>, epoll_fd: RawFd, fd: RawFd) {
    epoll_del(epoll_fd, fd);
    slots.deactivate(fd);
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::EchoConnection;
    use crate::logsink::TracingLogger;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;

    fn test_config(port: u16, db_port: u16) -> Config {
        let mut cfg = Config::default();
        cfg.bind = "127.0.0.1".parse().unwrap();
        cfg.port = port;
        cfg.db.port = db_port;
        cfg.threads = 2;
        cfg.max_queue = 64;
        cfg.max_fd = 64;
        cfg.db_pool_size = 2;
        cfg.timeslot_secs = 1;
        cfg.idle_timeout_secs = 1;
        cfg
    }

    fn fake_db_listener(capacity: usize) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            for _ in 0..capacity * 4 {
                if listener.accept().is_err() {
                    break;
                }
            }
        });
        (port, handle)
    }

    #[test]
    fn accepts_and_echoes_a_request() {
        let (db_port, _db_thread) = fake_db_listener(2);
        let cfg = test_config(0, db_port);
        let dir = tempfile::tempdir().unwrap();
        let logger: Arc<dyn Logger> =
            Arc::new(TracingLogger::init(dir.path().join("r.log"), 1000, 0).unwrap());

        let reactor = Reactor::bind(cfg, EchoConnection::new, logger).unwrap();
        let slots_handle = reactor.slots.clone();
        let addr = reactor.local_addr().unwrap();

        let server = thread::spawn(move || reactor.run());

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.ends_with(b"ok") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(buf.starts_with(b"HTTP/1.1 200 OK"));
        assert!(buf.ends_with(b"reactord ok"));
        assert_eq!(slots_handle.active_count(), 1);

        drop(stream);
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        server.join().unwrap().unwrap();
        assert_eq!(slots_handle.active_count(), 0);
    }

    /// A connection that goes quiet after its response is flushed must be
    /// evicted once it has been idle for `idle_timeout_secs`, observed on
    /// the next `SIGALRM` sweep (`timeslot_secs` later at the latest).
    #[test]
    fn idle_connection_is_evicted_after_timeout_sweeps() {
        let (db_port, _db_thread) = fake_db_listener(2);
        let cfg = test_config(0, db_port); // idle_timeout_secs = timeslot_secs = 1
        let dir = tempfile::tempdir().unwrap();
        let logger: Arc<dyn Logger> =
            Arc::new(TracingLogger::init(dir.path().join("r3.log"), 1000, 0).unwrap());

        let reactor = Reactor::bind(cfg, EchoConnection::new, logger).unwrap();
        let slots_handle = reactor.slots.clone();
        let addr = reactor.local_addr().unwrap();

        let server = thread::spawn(move || reactor.run());

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.ends_with(b"ok") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(buf.ends_with(b"reactord ok"));
        assert_eq!(slots_handle.active_count(), 1);

        // Send nothing further; the next SIGALRM sweep after the idle
        // deadline must close this socket from the server side.
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let n = stream.read(&mut chunk).unwrap_or(0);
        assert_eq!(n, 0, "server should close the idle socket (EOF)");

        for _ in 0..50 {
            if slots_handle.active_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(slots_handle.active_count(), 0);

        drop(stream);
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        server.join().unwrap().unwrap();
    }

    /// Drives accepted connections up to `max_fd`; once the slot table is
    /// at capacity, further accepts must be rejected with the busy banner
    /// and closed rather than added as a slot. Because every kept
    /// connection stays open (no request is ever sent, so nothing is
    /// evicted), the `(capacity + margin)`th connect is guaranteed to land
    /// once capacity is reached, regardless of the fd values already open
    /// in the test process.
    #[test]
    fn overflow_rejects_with_busy_banner_once_at_capacity() {
        let (db_port, _db_thread) = fake_db_listener(2);
        let mut cfg = test_config(0, db_port);
        cfg.max_fd = 8;
        let dir = tempfile::tempdir().unwrap();
        let logger: Arc<dyn Logger> =
            Arc::new(TracingLogger::init(dir.path().join("r2.log"), 1000, 0).unwrap());

        let reactor = Reactor::bind(cfg, EchoConnection::new, logger).unwrap();
        let slots_handle = reactor.slots.clone();
        let capacity = slots_handle.capacity();
        let addr = reactor.local_addr().unwrap();

        let server = thread::spawn(move || reactor.run());

        let mut kept = Vec::new();
        let mut saw_busy = false;
        for _ in 0..capacity + 8 {
            let mut stream = StdTcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
            let mut chunk = [0u8; 64];
            match stream.read(&mut chunk) {
                Ok(n) if n > 0 && chunk[..n].starts_with(b"Internal server busy") => saw_busy = true,
                _ => kept.push(stream),
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(saw_busy, "expected at least one connection to be rejected once at capacity");
        assert!(slots_handle.active_count() <= capacity);

        drop(kept);
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        server.join().unwrap().unwrap();
        assert_eq!(slots_handle.active_count(), 0);
    }
}
