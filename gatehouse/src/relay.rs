//! Front-end/upstream pairing and backpressure bookkeeping.
//!
//! A relay never touches sockets itself. The reactor reports every write
//! step on either side through [`Relay::note`] and applies the cork
//! transition it returns to the *source* side's read set.

use crate::connection::ConnId;
use crate::protocol::framing::{Expect, ResponseFraming};

use std::net::SocketAddr;

/// Direction bytes travel through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Front-end to upstream (request bytes).
    Upstream,

    /// Upstream to front-end (response bytes).
    Downstream,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Upstream => 0,
            Direction::Downstream => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { Family::V4 } else { Family::V6 }
    }
}

/// What the reactor must do with the source side's read interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorkChange {
    Cork,
    Uncork,
}

#[derive(Debug)]
pub struct Relay {
    front: ConnId,
    upstream: ConnId,

    /// Host and port the upstream was opened for.
    target: (String, u16),

    family: Family,

    /// Indexed by [`Direction`].
    corked: [bool; 2],
    bytes: [u64; 2],

    /// Front-end messages carried over this upstream.
    exchanges: u32,

    responses: ResponseFraming,
}

impl Relay {
    pub fn new(
        front: ConnId,
        upstream: ConnId,
        target: (String, u16),
        family: Family,
        max_header: usize,
    ) -> Self {
        Self {
            front,
            upstream,
            target,
            family,
            corked: [false; 2],
            bytes: [0; 2],
            exchanges: 1,
            responses: ResponseFraming::new(max_header),
        }
    }

    pub fn front(&self) -> ConnId {
        self.front
    }

    pub fn upstream(&self) -> ConnId {
        self.upstream
    }

    pub fn target(&self) -> (&str, u16) {
        (&self.target.0, self.target.1)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn bytes(&self, direction: Direction) -> u64 {
        self.bytes[direction.index()]
    }

    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }

    /// Another front-end message reuses this upstream.
    pub fn reuse(&mut self) {
        self.exchanges += 1;
    }

    /// Registers what the upstream owes for the message just forwarded.
    pub fn expect(&mut self, expect: Expect) {
        self.responses.expect(expect);
    }

    /// Whether the upstream still owes (part of) a response.
    pub fn response_in_flight(&self) -> bool {
        self.responses.in_flight()
    }

    /// Feeds response bytes to the boundary tracker. Returns `true` when
    /// they complete the last outstanding response.
    pub fn observe_response(&mut self, bytes: &[u8]) -> bool {
        let was_in_flight = self.responses.in_flight();
        self.responses.observe(bytes);
        was_in_flight && !self.responses.in_flight()
    }

    pub fn count(&mut self, direction: Direction, n: usize) {
        self.bytes[direction.index()] += n as u64;
    }

    pub fn is_corked(&self, direction: Direction) -> bool {
        self.corked[direction.index()]
    }

    /// Records a write step on the sink of `direction`.
    ///
    /// A direction is corked exactly while its sink has buffered output.
    pub fn note(
        &mut self,
        direction: Direction,
        had_buffer: bool,
        now_buffered: bool,
    ) -> Option<CorkChange> {
        let corked = &mut self.corked[direction.index()];

        match (had_buffer, now_buffered, *corked) {
            (_, true, false) => {
                *corked = true;
                Some(CorkChange::Cork)
            }
            (_, false, true) => {
                *corked = false;
                Some(CorkChange::Uncork)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> Relay {
        Relay::new(1, 2, ("example.com".into(), 80), Family::V4, 8192)
    }

    #[test]
    fn test_cork_follows_sink_buffer() {
        let mut relay = relay();

        assert_eq!(relay.note(Direction::Upstream, false, false), None);
        assert_eq!(
            relay.note(Direction::Upstream, false, true),
            Some(CorkChange::Cork)
        );
        assert!(relay.is_corked(Direction::Upstream));

        assert_eq!(relay.note(Direction::Upstream, true, true), None);
        assert_eq!(
            relay.note(Direction::Upstream, true, false),
            Some(CorkChange::Uncork)
        );
        assert!(!relay.is_corked(Direction::Upstream));
    }

    #[test]
    fn test_directions_are_independent() {
        let mut relay = relay();

        relay.note(Direction::Downstream, false, true);
        assert!(relay.is_corked(Direction::Downstream));
        assert!(!relay.is_corked(Direction::Upstream));

        assert_eq!(relay.note(Direction::Upstream, false, false), None);
        assert!(relay.is_corked(Direction::Downstream));
    }

    #[test]
    fn test_observe_reports_response_end() {
        let mut relay = relay();
        assert!(!relay.response_in_flight());

        relay.expect(Expect::Response { bodiless: false });
        assert!(!relay.observe_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\no"));
        assert!(relay.observe_response(b"k"));
        assert!(!relay.response_in_flight());
    }

    #[test]
    fn test_counters() {
        let mut relay = relay();
        relay.count(Direction::Upstream, 10);
        relay.count(Direction::Downstream, 5);
        relay.count(Direction::Downstream, 5);

        assert_eq!(relay.bytes(Direction::Upstream), 10);
        assert_eq!(relay.bytes(Direction::Downstream), 10);
        assert_eq!(relay.target(), ("example.com", 80));
    }
}
