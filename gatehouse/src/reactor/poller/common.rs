use super::unix::{sys_close, sys_pipe, sys_write};

use std::os::fd::RawFd;

/// Readiness a socket is waiting for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };

    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    pub fn is_none(self) -> bool {
        !self.read && !self.write
    }

    pub fn union(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }
}

/// An I/O event reported by a backend.
///
/// Hang-ups and socket errors are folded into both flags so that whichever
/// step runs next (read or write) observes the failure.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Interrupts a blocking poll from another thread.
///
/// Backed by a non-blocking self-pipe. Collaborator threads (decision
/// workers, resolvers) call [`Waker::wake`] after queueing a completion so
/// the reactor picks it up without waiting for the poll timeout.
#[derive(Debug)]
pub struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    pub(crate) fn new() -> std::io::Result<Self> {
        let (read_fd, write_fd) = sys_pipe()?;
        Ok(Self { read_fd, write_fd })
    }

    /// Wake the poller.
    ///
    /// A full pipe already guarantees a pending wake-up, so a failed write
    /// is ignored.
    pub fn wake(&self) {
        let _ = sys_write(self.write_fd, &[1]);
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        sys_close(self.read_fd);
        sys_close(self.write_fd);
    }
}
