//! Socket readiness poller.
//!
//! A thin wrapper over epoll in one-shot edge-triggered mode. A registration
//! stores a fiber pointer as opaque user data; when the kernel reports the
//! socket ready, the scheduler maps the event straight back to the parked
//! fiber. One-shot semantics guarantee at most one delivery per arm, so a
//! fiber that consumed its wakeup can never receive a second, stale event;
//! anything arriving for a fiber that is not waiting is discarded.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Readiness event set, both as registration interest and as the
    /// delivered mask returned by [`fiber::wait_io`](crate::fiber::wait_io).
    ///
    /// `ERROR` and `HUP` are always delivered when they occur, whether or
    /// not they were requested.
    pub struct Events: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const ERROR = 0x4;
        const HUP = 0x8;
    }
}

impl Events {
    #[inline]
    fn to_epoll(self) -> u32 {
        let mut bits = 0;
        if self.contains(Self::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Self::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        if self.contains(Self::HUP) {
            bits |= libc::EPOLLRDHUP as u32;
        }
        bits
    }

    #[inline]
    fn from_epoll(bits: u32) -> Self {
        let mut events = Self::empty();
        if bits & libc::EPOLLIN as u32 != 0 {
            events |= Self::READ;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            events |= Self::WRITE;
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            events |= Self::ERROR;
        }
        if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            events |= Self::HUP;
        }
        events
    }
}

/// Maximum events drained per poller wait.
pub(crate) const EVENT_BATCH: usize = 128;

/// A single delivered event: the mask and the opaque user data of the
/// registration it fired for.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub events: Events,
    pub token: u64,
}

#[derive(Debug)]
pub(crate) struct Poller {
    epfd: RawFd,
}

// The epoll fd is shared freely: the kernel serializes operations on it.
unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Poller(io::Error::last_os_error()));
        }
        Ok(Self { epfd })
    }

    /// Arm `fd` one-shot edge-triggered for `interest`, with `token` as the
    /// opaque user data. If the descriptor is already known (a re-arm of the
    /// same socket by the same fiber), the registration is modified in
    /// place.
    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Events) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.to_epoll()
                | libc::EPOLLET as u32
                | libc::EPOLLONESHOT as u32
                | libc::EPOLLRDHUP as u32,
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Change the interest of an existing registration.
    pub(crate) fn update(&self, fd: RawFd, token: u64, interest: Events) -> io::Result<()> {
        // Same ADD-then-MOD dance as register: an update racing a one-shot
        // delivery must re-create the registration, not fail.
        self.register(fd, token, interest)
    }

    /// Remove the registration of `fd`. A descriptor the kernel no longer
    /// knows (closed, or never armed) is not an error.
    pub(crate) fn deregister(&self, fd: RawFd) {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => {}
                _ => log::warn!("poller: failed to deregister fd {}: {}", fd, err),
            }
        }
    }

    /// Wait up to `timeout_ms` for ready events (`0` polls, `-1` blocks).
    /// An interrupted wait reports zero events.
    pub(crate) fn wait(
        &self,
        buf: &mut [PollEvent; EVENT_BATCH],
        timeout_ms: i32,
    ) -> Result<usize> {
        let mut raw: [libc::epoll_event; EVENT_BATCH] =
            unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), EVENT_BATCH as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Poll(err));
        }
        let n = n as usize;
        for i in 0..n {
            buf[i] = PollEvent {
                events: Events::from_epoll(raw[i].events),
                token: raw[i].u64,
            };
        }
        Ok(n)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mask_mapping() {
        let interest = Events::READ | Events::WRITE;
        let bits = interest.to_epoll();
        assert_ne!(bits & libc::EPOLLIN as u32, 0);
        assert_ne!(bits & libc::EPOLLOUT as u32, 0);

        let delivered = Events::from_epoll(
            (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32,
        );
        assert_eq!(delivered, Events::READ | Events::ERROR | Events::HUP);
    }

    #[test]
    fn poll_zero_is_nonblocking() {
        let poller = Poller::new().unwrap();
        let mut buf = [PollEvent { events: Events::empty(), token: 0 }; EVENT_BATCH];
        let started = std::time::Instant::now();
        let n = poller.wait(&mut buf, 0).unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn deregister_unknown_fd_is_silent() {
        let poller = Poller::new().unwrap();
        // Never registered; must not panic or error out loudly.
        poller.deregister(i32::MAX - 1);
    }
}
