//! Readiness multiplexing over epoll.
//!
//! `Notifier` wraps one epoll instance. Registration control calls are plain
//! thread-safe syscalls, so workers may re-arm interest directly while the
//! reactor thread blocks in `wait`. Edge/level triggering and one-shot
//! delivery are per-registration bits in the `Interest` mask.

use std::io;
use std::os::unix::io::RawFd;

/// Interest mask for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer shut down its write half (EPOLLRDHUP).
    pub const PEER_CLOSED: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Edge-triggered delivery; the registration must be drained fully.
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    /// Deliver one event, then suppress until the next `modify`.
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    pub const fn empty() -> Interest {
        Interest(0)
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One readiness event delivered by `wait`.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    id: u64,
    flags: u32,
}

impl Event {
    /// Registration id supplied at `register`/`modify` time.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_readable(&self) -> bool {
        self.flags & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0
    }

    pub fn is_peer_closed(&self) -> bool {
        self.flags & libc::EPOLLRDHUP as u32 != 0
    }
}

/// Reusable event batch, owned by the polling thread.
pub struct Events {
    list: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            list: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            len: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.list[..self.len].iter().map(|ev| Event {
            id: ev.u64,
            flags: ev.events,
        })
    }
}

/// Epoll-backed readiness notifier.
pub struct Notifier {
    epfd: RawFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Start watching `fd`; events for it carry `id`.
    pub fn register(&self, fd: RawFd, id: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, id, interest)
    }

    /// Replace the interest mask of an existing registration.
    pub fn modify(&self, fd: RawFd, id: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, id, interest)
    }

    /// Stop watching `fd`.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block for up to `timeout_ms` (-1 blocks indefinitely, 0 polls) and
    /// fill `events` with ready registrations. Returns the event count.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.list.as_mut_ptr(),
                    events.list.len() as i32,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            events.len = n as usize;
            return Ok(events.len);
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, id: u64, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: id,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
