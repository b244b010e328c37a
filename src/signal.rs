//! Signal-to-reactor bridge.
//!
//! Unix signal handlers may only call async-signal-safe functions, so
//! the handler itself must do nothing but write a byte to a pipe the
//! reactor thread has registered with `epoll`: it cannot touch the
//! timer list or connection table directly. The `signal_hook` crate's
//! `low_level::pipe` module is exactly this pattern already wired up
//! for libc's `sigaction`; it does not guarantee which byte value is
//! written, so unlike the original's single shared pipe keyed by
//! signal number, this bridge uses one pipe per signal and lets the fd
//! identity carry the meaning instead.

use std::{
    fs::File,
    io,
    os::unix::io::{FromRawFd, RawFd},
};

use signal_hook::consts::{SIGALRM, SIGTERM};

use crate::error::Error;

/// One half-duplex pipe used as a signal-safe wakeup source. The read
/// end is a bare fd this struct owns and drains/closes itself; the
/// write end is handed to `signal_hook::low_level::pipe::register`,
/// which takes ownership of it and keeps it alive until unregistered.
struct SelfPipe {
    read_fd: RawFd,
    write_end: Option<File>,
}

impl SelfPipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let write_end = unsafe { File::from_raw_fd(fds[1]) };
        Ok(Self {
            read_fd: fds[0],
            write_end: Some(write_end),
        })
    }

    /// Drains every byte currently buffered. Non-blocking reads stop at
    /// the first `EAGAIN`, which is the normal end-of-data case here.
    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
        }
    }
}

/// Owns the two self-pipes backing SIGALRM/SIGTERM delivery and the
/// `signal_hook` registrations that feed them. Register the two read
/// fds with the reactor's `epoll` instance; on readiness, call
/// `drain_alarm`/`drain_term` and act on the corresponding flag.
pub struct SignalBridge {
    alarm: SelfPipe,
    term: SelfPipe,
    alarm_id: signal_hook::SigId,
    term_id: signal_hook::SigId,
}

impl SignalBridge {
    pub fn install() -> Result<Self, Error> {
        let mut alarm = SelfPipe::new().map_err(|source| Error::SignalInstall {
            signal: SIGALRM,
            source,
        })?;
        let mut term = SelfPipe::new().map_err(|source| Error::SignalInstall {
            signal: SIGTERM,
            source,
        })?;

        let alarm_write = alarm.write_end.take().expect("write end set by SelfPipe::new");
        let term_write = term.write_end.take().expect("write end set by SelfPipe::new");

        let alarm_id = signal_hook::low_level::pipe::register(SIGALRM, alarm_write)
            .map_err(|source| Error::SignalInstall { signal: SIGALRM, source })?;
        let term_id = signal_hook::low_level::pipe::register(SIGTERM, term_write)
            .map_err(|source| Error::SignalInstall { signal: SIGTERM, source })?;

        Ok(Self {
            alarm,
            term,
            alarm_id,
            term_id,
        })
    }

    pub fn alarm_fd(&self) -> RawFd {
        self.alarm.read_fd
    }

    pub fn term_fd(&self) -> RawFd {
        self.term.read_fd
    }

    pub fn drain_alarm(&self) {
        self.alarm.drain();
    }

    pub fn drain_term(&self) {
        self.term.drain();
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.alarm_id);
        signal_hook::low_level::unregister(self.term_id);
    }
}

/// Arms (or re-arms) the process alarm to fire in `secs` seconds,
/// mirroring the original's periodic `alarm(TIMESLOT)` call made right
/// after each timer tick.
pub fn arm_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn install_creates_distinct_readable_fds() {
        let bridge = SignalBridge::install().unwrap();
        assert_ne!(bridge.alarm_fd(), bridge.term_fd());
    }

    #[test]
    fn sigterm_delivery_makes_term_fd_readable() {
        let bridge = SignalBridge::install().unwrap();
        unsafe {
            libc::raise(SIGTERM);
        }
        std::thread::sleep(Duration::from_millis(20));

        let mut pfd = libc::pollfd {
            fd: bridge.term_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ret, 1);
        bridge.drain_term();
    }
}
