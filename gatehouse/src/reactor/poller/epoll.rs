//! Linux `epoll`-based backend.
//!
//! Sockets are registered one-shot: after the kernel reports a socket it
//! is disarmed until the next [`EpollBackend::wait`] re-arms it with its
//! current interest. The token handed to the kernel is a slot in an
//! internal [`Slab`] that maps back to the socket; an event whose token
//! has no slot is reported as [`PollerError::Unmapped`].

use super::common::{Event, Interest};
use super::{Backend, remaining};
use crate::error::PollerError;
use crate::utils::Slab;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

/// Reserved token used for the wake-up pipe.
///
/// Slab indices never reach `u64::MAX`.
const WAKE_TOKEN: u64 = u64::MAX;

pub(crate) struct EpollBackend {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Reusable buffer for kernel events.
    events: Vec<epoll_event>,

    /// Token table: slot index → (socket, interest).
    tokens: Slab<(RawFd, Interest)>,

    /// Reverse index: socket → token.
    by_fd: HashMap<RawFd, usize>,

    /// Tokens reported by the previous wait, to be re-armed.
    fired: Vec<usize>,

    /// Read end of the reactor waker.
    waker_fd: RawFd,
}

fn flags(interest: Interest) -> u32 {
    let mut flags = EPOLLONESHOT | EPOLLRDHUP;

    if interest.read {
        flags |= EPOLLIN;
    }
    if interest.write {
        flags |= EPOLLOUT;
    }

    flags as u32
}

impl EpollBackend {
    pub(crate) fn new(waker_fd: RawFd, max_events: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, waker_fd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        Ok(Self {
            epoll,
            events: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
            tokens: Slab::new(64),
            by_fd: HashMap::new(),
            fired: Vec::new(),
            waker_fd,
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags(interest),
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn rearm(&mut self) {
        for token in std::mem::take(&mut self.fired) {
            if let Some(&(fd, interest)) = self.tokens.get(token) {
                // A socket closed between waits simply drops out.
                let _ = self.ctl(EPOLL_CTL_MOD, fd, token, interest);
            }
        }
    }
}

impl Backend for EpollBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.by_fd.contains_key(&fd) {
            return self.reregister(fd, interest);
        }

        let token = self.tokens.insert((fd, interest));
        if let Err(e) = self.ctl(EPOLL_CTL_ADD, fd, token, interest) {
            self.tokens.remove(token);
            return Err(e);
        }

        self.by_fd.insert(fd, token);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(&token) = self.by_fd.get(&fd) else {
            return self.register(fd, interest);
        };

        if let Some(slot) = self.tokens.get_mut(token) {
            slot.1 = interest;
        }

        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd) {
        if let Some(token) = self.by_fd.remove(&fd) {
            self.tokens.remove(token);
            unsafe {
                epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    fn wait(
        &mut self,
        events: &mut Vec<Event>,
        faults: &mut Vec<PollerError>,
        deadline: Option<Instant>,
    ) -> io::Result<()> {
        self.rearm();

        let n = loop {
            let timeout_ms = remaining(deadline);

            let n = unsafe {
                epoll_wait(
                    self.epoll,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    timeout_ms,
                )
            };

            if n >= 0 {
                break n as usize;
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut woken = false;

        for i in 0..n {
            let ev = self.events[i];
            let (bits, token) = (ev.events, ev.u64);

            if token == WAKE_TOKEN {
                woken = true;
                continue;
            }

            let Some(&(fd, _)) = self.tokens.get(token as usize) else {
                faults.push(PollerError::Unmapped(token));
                continue;
            };

            let broken = bits & ((EPOLLERR | EPOLLHUP) as u32) != 0;
            let readable = broken || bits & ((EPOLLIN | EPOLLRDHUP) as u32) != 0;
            let writable = broken || bits & (EPOLLOUT as u32) != 0;

            self.fired.push(token as usize);
            events.push(Event {
                fd,
                readable,
                writable,
            });
        }

        if woken {
            super::drain_waker(self.waker_fd);
        }

        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}
