//! One socket and its buffers.
//!
//! A [`Connection`] is owned by the reactor's registry. Front-end
//! connections carry a [`Decoder`]; upstream connections relay whatever
//! they read verbatim.

use crate::error::ParseError;
use crate::protocol::{Decoded, Decoder, SourceKind};
use crate::reactor::poller::unix::{sys_close, sys_read, sys_send};

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

/// Stable identifier assigned when a connection is created.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Front,
    Upstream,
}

/// Result of one read attempt.
#[derive(Debug)]
pub enum Fill {
    Read(usize),
    WouldBlock,
    Eof,
    Failed(io::Error),
}

/// Result of one write step.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Whether the output buffer was non-empty before and after the step.
    Progress { had_buffer: bool, now_buffered: bool },

    /// Everything drained after [`Connection::finish`]; close the socket.
    Finished,

    Failed(io::Error),
}

#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    fd: RawFd,
    kind: SourceKind,
    role: Role,

    /// Reported peer; replaced by the PROXY line source when present.
    peer: SocketAddr,

    /// Accepting (front) or connecting (upstream) local address.
    local: SocketAddr,

    input: Vec<u8>,
    decoder: Option<Decoder>,

    output: Vec<u8>,
    finish_after_drain: bool,

    /// The other end of the relay this connection belongs to.
    link: Option<ConnId>,

    last_active: Instant,
}

impl Connection {
    pub fn front(
        id: ConnId,
        fd: RawFd,
        peer: SocketAddr,
        local: SocketAddr,
        decoder: Decoder,
    ) -> Self {
        Self {
            id,
            fd,
            kind: decoder.kind(),
            role: Role::Front,
            peer,
            local,
            input: Vec::new(),
            decoder: Some(decoder),
            output: Vec::new(),
            finish_after_drain: false,
            link: None,
            last_active: Instant::now(),
        }
    }

    pub fn upstream(
        id: ConnId,
        fd: RawFd,
        kind: SourceKind,
        peer: SocketAddr,
        local: SocketAddr,
        front: ConnId,
    ) -> Self {
        Self {
            id,
            fd,
            kind,
            role: Role::Upstream,
            peer,
            local,
            input: Vec::new(),
            decoder: None,
            output: Vec::new(),
            finish_after_drain: false,
            link: Some(front),
            last_active: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn link(&self) -> Option<ConnId> {
        self.link
    }

    pub fn set_link(&mut self, link: Option<ConnId>) {
        self.link = link;
    }

    pub fn decoder(&self) -> Option<&Decoder> {
        self.decoder.as_ref()
    }

    pub fn decoder_mut(&mut self) -> Option<&mut Decoder> {
        self.decoder.as_mut()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn is_finishing(&self) -> bool {
        self.finish_after_drain
    }

    pub fn buffered_input(&self) -> usize {
        self.input.len()
    }

    /// Reads once, appending at most `max` bytes to the input buffer.
    pub fn fill(&mut self, max: usize) -> Fill {
        let start = self.input.len();
        self.input.resize(start + max, 0);

        let n = sys_read(self.fd, &mut self.input[start..]);

        match n {
            (1..) => {
                self.input.truncate(start + n as usize);
                self.last_active = Instant::now();
                Fill::Read(n as usize)
            }
            0 => {
                self.input.truncate(start);
                Fill::Eof
            }
            _ => {
                self.input.truncate(start);
                let error = io::Error::last_os_error();

                match error.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Fill::WouldBlock,
                    _ => Fill::Failed(error),
                }
            }
        }
    }

    /// Runs the decoder one step.
    ///
    /// A stripped PROXY line replaces the reported peer before the step is
    /// handed back.
    pub fn decode(&mut self) -> Result<Decoded, ParseError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(Decoded::NeedMore);
        };

        let step = decoder.decode(&mut self.input)?;
        if let Decoded::ProxyHeader(header) = &step
            && let Some(source) = header.source
        {
            self.peer = source;
        }

        Ok(step)
    }

    /// Hands over everything read so far (upstream side).
    pub fn take_input(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.input)
    }

    /// Appends `data` and attempts a single non-blocking send of the
    /// whole output buffer.
    pub fn write_step(&mut self, data: &[u8]) -> WriteOutcome {
        let had_buffer = !self.output.is_empty();
        self.output.extend_from_slice(data);

        if self.output.is_empty() {
            return self.drained(had_buffer);
        }

        let n = sys_send(self.fd, &self.output);
        if n < 0 {
            let error = io::Error::last_os_error();
            return match error.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                    WriteOutcome::Progress {
                        had_buffer,
                        now_buffered: true,
                    }
                }
                _ => WriteOutcome::Failed(error),
            };
        }

        self.output.drain(..n as usize);
        self.last_active = Instant::now();

        if self.output.is_empty() {
            self.drained(had_buffer)
        } else {
            WriteOutcome::Progress {
                had_buffer,
                now_buffered: true,
            }
        }
    }

    /// Marks the connection to close once its output buffer drains.
    pub fn finish(&mut self) {
        self.finish_after_drain = true;
    }

    fn drained(&self, had_buffer: bool) -> WriteOutcome {
        if self.finish_after_drain {
            WriteOutcome::Finished
        } else {
            WriteOutcome::Progress {
                had_buffer,
                now_buffered: false,
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        sys_close(self.fd);
    }
}
