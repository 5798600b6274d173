//! Readiness multiplexer with named, corkable interest sets.
//!
//! The reactor never talks to the OS facility directly. It declares named
//! sets (`read_client`, `write_download`, ...), each carrying a read or
//! write interest, and moves sockets in and out of them. A socket may sit
//! in several sets at once; the poller registers the union of the
//! interests of every set that holds it uncorked.
//!
//! Corking keeps a socket's membership but suspends delivery for that one
//! set. Cork state is keyed per (set, socket), so corking `read_client`
//! leaves the same socket's `write_client` membership untouched.
//!
//! Two backends exist: `epoll` on Linux and the portable `poll(2)`.

pub(crate) mod common;
#[cfg(target_os = "linux")]
mod epoll;
mod poll;
pub(crate) mod unix;

pub use common::{Event, Interest, Waker};

use crate::error::PollerError;

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of an interest set.
pub type SetName = &'static str;

/// OS multiplexing facility behind a [`Poller`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[cfg_attr(target_os = "linux", default)]
    Epoll,
    #[cfg_attr(not(target_os = "linux"), default)]
    Poll,
}

/// What the poller needs from an OS facility.
///
/// `register`/`reregister` receive the union interest of a socket; a
/// socket with no remaining interest is deregistered.
pub(crate) trait Backend: Send {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Must tolerate sockets the caller already closed.
    fn deregister(&mut self, fd: RawFd);

    /// Blocks until readiness, a wake-up, or `deadline`. Signal
    /// interruptions are retried with the remaining time.
    fn wait(
        &mut self,
        events: &mut Vec<Event>,
        faults: &mut Vec<PollerError>,
        deadline: Option<Instant>,
    ) -> io::Result<()>;
}

struct InterestSet {
    interest: Interest,
    members: HashSet<RawFd>,
    corked: HashSet<RawFd>,
}

/// Sockets reported ready by one [`Poller::poll`] call, grouped by set.
#[derive(Default, Debug)]
pub struct Ready {
    sets: HashMap<SetName, Vec<RawFd>>,
    faults: Vec<PollerError>,
}

impl Ready {
    /// Ready sockets in `name`, in the order the backend reported them.
    pub fn get(&self, name: SetName) -> &[RawFd] {
        self.sets.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(Vec::is_empty)
    }

    /// Internal faults raised while mapping backend events.
    pub fn faults(&self) -> &[PollerError] {
        &self.faults
    }
}

pub struct Poller {
    backend: Box<dyn Backend>,
    sets: HashMap<SetName, InterestSet>,

    /// Union interest currently registered with the backend, per socket.
    armed: HashMap<RawFd, Interest>,

    events: Vec<Event>,
    waker: Arc<Waker>,
}

impl Poller {
    /// Builds a poller on the requested backend.
    ///
    /// Asking for `epoll` off Linux falls back to `poll(2)`.
    pub fn new(kind: BackendKind, max_events: usize) -> io::Result<Self> {
        let waker = Arc::new(Waker::new()?);

        let backend: Box<dyn Backend> = match kind {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Box::new(epoll::EpollBackend::new(waker.fd(), max_events)?),
            _ => Box::new(poll::PollBackend::new(waker.fd())),
        };

        Ok(Self {
            backend,
            sets: HashMap::new(),
            armed: HashMap::new(),
            events: Vec::with_capacity(max_events),
            waker,
        })
    }

    /// Handle used by other threads to interrupt a blocking [`poll`](Self::poll).
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Declares a named set. Redefining an existing set is a no-op.
    pub fn define_set(&mut self, name: SetName, interest: Interest) {
        self.sets.entry(name).or_insert_with(|| InterestSet {
            interest,
            members: HashSet::new(),
            corked: HashSet::new(),
        });
    }

    pub fn watch(&mut self, name: SetName, fd: RawFd) -> Result<(), PollerError> {
        let set = self
            .sets
            .get_mut(name)
            .ok_or(PollerError::UnknownSet(name))?;

        if set.members.insert(fd) {
            self.sync(fd)?;
        }

        Ok(())
    }

    /// Removes a socket from a set, dropping its cork state with it.
    pub fn unwatch(&mut self, name: SetName, fd: RawFd) -> Result<(), PollerError> {
        let set = self
            .sets
            .get_mut(name)
            .ok_or(PollerError::UnknownSet(name))?;

        set.corked.remove(&fd);
        if set.members.remove(&fd) {
            self.sync(fd)?;
        }

        Ok(())
    }

    /// Suspends delivery for a socket in one set without unregistering it.
    ///
    /// No-op for sockets outside the set; idempotent otherwise.
    pub fn cork(&mut self, name: SetName, fd: RawFd) -> Result<(), PollerError> {
        let set = self
            .sets
            .get_mut(name)
            .ok_or(PollerError::UnknownSet(name))?;

        if set.members.contains(&fd) && set.corked.insert(fd) {
            self.sync(fd)?;
        }

        Ok(())
    }

    pub fn uncork(&mut self, name: SetName, fd: RawFd) -> Result<(), PollerError> {
        let set = self
            .sets
            .get_mut(name)
            .ok_or(PollerError::UnknownSet(name))?;

        if set.corked.remove(&fd) {
            self.sync(fd)?;
        }

        Ok(())
    }

    /// Drops every socket from a set.
    pub fn clear(&mut self, name: SetName) -> Result<(), PollerError> {
        let set = self
            .sets
            .get_mut(name)
            .ok_or(PollerError::UnknownSet(name))?;

        set.corked.clear();
        let members: Vec<RawFd> = set.members.drain().collect();

        for fd in members {
            self.sync(fd)?;
        }

        Ok(())
    }

    /// Removes a socket from every set and from the backend.
    ///
    /// Call before closing the socket. Safe to call more than once.
    pub fn forget(&mut self, fd: RawFd) {
        for set in self.sets.values_mut() {
            set.members.remove(&fd);
            set.corked.remove(&fd);
        }

        if self.armed.remove(&fd).is_some() {
            self.backend.deregister(fd);
        }
    }

    pub fn is_watched(&self, name: SetName, fd: RawFd) -> bool {
        self.sets
            .get(name)
            .is_some_and(|set| set.members.contains(&fd))
    }

    pub fn is_corked(&self, name: SetName, fd: RawFd) -> bool {
        self.sets
            .get(name)
            .is_some_and(|set| set.corked.contains(&fd))
    }

    /// Whether a socket belongs to any set at all.
    pub fn is_known(&self, fd: RawFd) -> bool {
        self.sets.values().any(|set| set.members.contains(&fd))
    }

    /// Waits up to `timeout` (forever when `None`) and returns the ready
    /// sockets per set. A timeout yields an empty [`Ready`].
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Ready, PollerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ready = Ready::default();

        self.events.clear();
        self.backend
            .wait(&mut self.events, &mut ready.faults, deadline)?;

        for event in &self.events {
            for (name, set) in &self.sets {
                if !set.members.contains(&event.fd) || set.corked.contains(&event.fd) {
                    continue;
                }

                let hit = (set.interest.read && event.readable)
                    || (set.interest.write && event.writable);

                if hit {
                    ready.sets.entry(name).or_default().push(event.fd);
                }
            }
        }

        Ok(ready)
    }

    /// Pushes the union interest of `fd` down to the backend.
    fn sync(&mut self, fd: RawFd) -> Result<(), PollerError> {
        let wanted = self
            .sets
            .values()
            .filter(|set| set.members.contains(&fd) && !set.corked.contains(&fd))
            .fold(Interest::NONE, |acc, set| acc.union(set.interest));

        match self.armed.get(&fd).copied() {
            None if wanted.is_none() => {}
            None => {
                self.backend.register(fd, wanted)?;
                self.armed.insert(fd, wanted);
            }
            Some(_) if wanted.is_none() => {
                self.backend.deregister(fd);
                self.armed.remove(&fd);
            }
            Some(current) if current != wanted => {
                self.backend.reregister(fd, wanted)?;
                self.armed.insert(fd, wanted);
            }
            Some(_) => {}
        }

        Ok(())
    }
}

/// Milliseconds left until `deadline`, rounded up, as a poll timeout.
pub(crate) fn remaining(deadline: Option<Instant>) -> i32 {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            let ms = left.as_millis() + u128::from(left.subsec_nanos() % 1_000_000 != 0);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Empties the waker pipe after a backend saw it readable.
pub(crate) fn drain_waker(fd: RawFd) {
    let mut buf = [0u8; 64];
    while unix::sys_read(fd, &mut buf) > 0 {}
}
