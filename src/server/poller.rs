//! Level-triggered epoll, one registration per descriptor with the
//! descriptor itself as the event token.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

/// Readiness a descriptor is polled for. Hang-ups and errors are reported
/// whatever the interest, as epoll always delivers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(EPOLLOUT as u32);
    /// Only the peer shutting down its side of the connection.
    pub const PEER_CLOSED: Interest = Interest(EPOLLRDHUP as u32);

    fn bits(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    bits: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.bits & EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & EPOLLOUT as u32 != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.bits & EPOLLHUP as u32 != 0
    }

    pub fn is_peer_closed(&self) -> bool {
        self.bits & EPOLLRDHUP as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.bits & EPOLLERR as u32 != 0
    }
}

pub struct Poller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
}

impl Poller {
    pub fn new(max_events: usize) -> io::Result<Poller> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let rc = unsafe {
            epoll_ctl(
                self.epoll.as_raw_fd(),
                op,
                fd,
                &mut event as *mut epoll_event,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` and returns the ready descriptors. An
    /// interrupted wait is reported as no events.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        Ok(self.events[..n as usize]
            .iter()
            .map(|event| Event {
                fd: event.u64 as RawFd,
                bits: event.events,
            })
            .collect())
    }
}
