//! Portable `poll(2)` backend.
//!
//! The descriptor array is rebuilt from the registry on every call, so
//! there is no arming state to keep in sync and the array index maps
//! straight back to the socket.

use super::common::{Event, Interest};
use super::{Backend, remaining};
use crate::error::PollerError;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, nfds_t, pollfd};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

pub(crate) struct PollBackend {
    /// Registered sockets and their interest.
    registry: HashMap<RawFd, Interest>,

    /// Reusable descriptor array. Slot 0 is always the waker.
    fds: Vec<pollfd>,

    waker_fd: RawFd,
}

impl PollBackend {
    pub(crate) fn new(waker_fd: RawFd) -> Self {
        Self {
            registry: HashMap::new(),
            fds: Vec::with_capacity(64),
            waker_fd,
        }
    }
}

impl Backend for PollBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registry.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registry.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) {
        self.registry.remove(&fd);
    }

    fn wait(
        &mut self,
        events: &mut Vec<Event>,
        _faults: &mut Vec<PollerError>,
        deadline: Option<Instant>,
    ) -> io::Result<()> {
        self.fds.clear();
        self.fds.push(pollfd {
            fd: self.waker_fd,
            events: POLLIN,
            revents: 0,
        });

        for (&fd, interest) in &self.registry {
            let mut flags = 0;
            if interest.read {
                flags |= POLLIN;
            }
            if interest.write {
                flags |= POLLOUT;
            }

            self.fds.push(pollfd {
                fd,
                events: flags,
                revents: 0,
            });
        }

        loop {
            let timeout_ms = remaining(deadline);
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as nfds_t,
                    timeout_ms,
                )
            };

            if rc >= 0 {
                break;
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        if self.fds[0].revents & POLLIN != 0 {
            super::drain_waker(self.waker_fd);
        }

        for slot in &self.fds[1..] {
            let bits = slot.revents;

            // Closed underneath us by the caller; nothing to report.
            if bits == 0 || bits & POLLNVAL != 0 {
                continue;
            }

            let broken = bits & (POLLERR | POLLHUP) != 0;
            events.push(Event {
                fd: slot.fd,
                readable: broken || bits & POLLIN != 0,
                writable: broken || bits & POLLOUT != 0,
            });
        }

        Ok(())
    }
}
