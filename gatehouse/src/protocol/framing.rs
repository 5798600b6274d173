//! Upstream response boundaries.
//!
//! Response bytes are relayed to the client untouched; [`ResponseFraming`]
//! only watches them go by so the reactor knows when the response to the
//! last forwarded request has been fully received. Until then, the next
//! pipelined request on the same front-end is left undecoded.

use std::collections::VecDeque;

/// What the reactor expects back for a forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// One HTTP response; `bodiless` for `HEAD` requests.
    Response { bodiless: bool },

    /// Raw bytes until the upstream closes (tunnels, upgrades).
    Opaque,
}

#[derive(Debug)]
enum State {
    Idle,
    Head(Vec<u8>),
    Sized(u64),
    Chunked(Chunks),
    UntilClose,
}

/// Tracks response boundaries on one upstream connection.
#[derive(Debug)]
pub struct ResponseFraming {
    /// One entry per forwarded request still waiting for its final
    /// response head; `true` when that response has no body.
    awaiting: VecDeque<bool>,
    state: State,
    max_header: usize,
}

impl ResponseFraming {
    pub fn new(max_header: usize) -> Self {
        Self {
            awaiting: VecDeque::new(),
            state: State::Idle,
            max_header,
        }
    }

    pub fn expect(&mut self, expect: Expect) {
        match expect {
            Expect::Response { bodiless } => self.awaiting.push_back(bodiless),
            Expect::Opaque => self.state = State::UntilClose,
        }
    }

    /// Whether a response is still owed or still arriving.
    pub fn in_flight(&self) -> bool {
        !self.awaiting.is_empty() || !matches!(self.state, State::Idle)
    }

    /// Accounts for bytes received from the upstream.
    pub fn observe(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let (consumed, next) = match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle if self.awaiting.is_empty() => (0, State::UntilClose),
                State::Idle => (0, State::Head(Vec::new())),
                State::Head(buf) => self.head(buf, bytes),
                State::Sized(left) => {
                    let n = left.min(bytes.len() as u64);
                    let next = match left - n {
                        0 => State::Idle,
                        left => State::Sized(left),
                    };
                    (n as usize, next)
                }
                State::Chunked(mut chunks) => match chunks.feed(bytes) {
                    Some((n, true)) => (n, State::Idle),
                    Some((n, false)) => (n, State::Chunked(chunks)),
                    None => (bytes.len(), State::UntilClose),
                },
                State::UntilClose => (bytes.len(), State::UntilClose),
            };

            self.state = next;
            bytes = &bytes[consumed..];
        }
    }

    /// Buffers head bytes; once the head is complete, decides how the
    /// body is delimited.
    fn head(&mut self, mut buf: Vec<u8>, bytes: &[u8]) -> (usize, State) {
        let before = buf.len();
        buf.extend_from_slice(bytes);

        let Some(end) = head_end(&buf, before.saturating_sub(3)) else {
            if buf.len() > self.max_header {
                return (bytes.len(), State::UntilClose);
            }
            return (bytes.len(), State::Head(buf));
        };
        let consumed = end - before;

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        let Ok(httparse::Status::Complete(_)) = response.parse(&buf[..end]) else {
            return (consumed, State::UntilClose);
        };
        let status = response.code.unwrap_or(0);

        match status {
            101 => return (consumed, State::UntilClose),
            100..=199 => return (consumed, State::Head(Vec::new())),
            _ => {}
        }

        let bodiless = self.awaiting.pop_front().unwrap_or(false);
        if bodiless || status == 204 || status == 304 {
            return (consumed, State::Idle);
        }

        let mut chunked = false;
        let mut length = None;
        for header in response.headers.iter() {
            if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = header
                    .value
                    .rsplit(|&b| b == b',')
                    .next()
                    .is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"));
            } else if header.name.eq_ignore_ascii_case("content-length") {
                length = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok());
            }
        }

        let next = match (chunked, length) {
            (true, _) => State::Chunked(Chunks::default()),
            (false, Some(0)) => State::Idle,
            (false, Some(n)) => State::Sized(n),
            (false, None) => State::UntilClose,
        };
        (consumed, next)
    }
}

/// Offset just past the blank line ending a head, searching from `from`.
fn head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut at = from;
    while let Some(pos) = buf[at..].iter().position(|&b| b == b'\n') {
        let nl = at + pos;
        match buf.get(nl + 1..) {
            Some([b'\n', ..]) => return Some(nl + 2),
            Some([b'\r', b'\n', ..]) => return Some(nl + 3),
            _ => at = nl + 1,
        }
    }
    None
}

#[derive(Debug, Default)]
enum Chunks {
    #[default]
    SizeLine,
    Size {
        size: u64,
        extension: bool,
    },
    Data(u64),
    DataEnd,
    Trailer {
        blank: bool,
    },
}

impl Chunks {
    /// Skips over chunked framing. Returns the bytes consumed and whether
    /// the body ended, or `None` when the framing is unreadable.
    fn feed(&mut self, bytes: &[u8]) -> Option<(usize, bool)> {
        let mut i = 0;

        while i < bytes.len() {
            if let Chunks::Data(left) = *self {
                let n = left.min((bytes.len() - i) as u64);
                i += n as usize;
                *self = match left - n {
                    0 => Chunks::DataEnd,
                    left => Chunks::Data(left),
                };
                continue;
            }

            let b = bytes[i];
            i += 1;

            *self = match (std::mem::take(self), b) {
                (Chunks::SizeLine, b) => Chunks::Size {
                    size: hex(b)?,
                    extension: false,
                },
                (Chunks::Size { size: 0, .. }, b'\n') => Chunks::Trailer { blank: true },
                (Chunks::Size { size, .. }, b'\n') => Chunks::Data(size),
                (Chunks::Size { size, extension: false }, b) if b.is_ascii_hexdigit() => {
                    Chunks::Size {
                        size: size.checked_mul(16)?.checked_add(hex(b)?)?,
                        extension: false,
                    }
                }
                (Chunks::Size { size, .. }, b';' | b' ' | b'\t' | b'\r') => Chunks::Size {
                    size,
                    extension: true,
                },
                (state @ Chunks::Size { extension: true, .. }, _) => state,
                (Chunks::Size { .. }, _) => return None,
                (Chunks::DataEnd, b'\r') => Chunks::DataEnd,
                (Chunks::DataEnd, b'\n') => Chunks::SizeLine,
                (Chunks::DataEnd, _) => return None,
                (Chunks::Trailer { blank: true }, b'\n') => return Some((i, true)),
                (Chunks::Trailer { blank }, b'\r') => Chunks::Trailer { blank },
                (Chunks::Trailer { .. }, b'\n') => Chunks::Trailer { blank: true },
                (Chunks::Trailer { .. }, _) => Chunks::Trailer { blank: false },
                (Chunks::Data(left), _) => match left - 1 {
                    0 => Chunks::DataEnd,
                    left => Chunks::Data(left),
                },
            };
        }

        Some((i, false))
    }
}

fn hex(b: u8) -> Option<u64> {
    (b as char).to_digit(16).map(u64::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(expect: Expect) -> ResponseFraming {
        let mut framing = ResponseFraming::new(8192);
        framing.expect(expect);
        framing
    }

    #[test]
    fn test_sized_response_completes() {
        let mut framing = tracker(Expect::Response { bodiless: false });
        assert!(framing.in_flight());

        framing.observe(b"HTTP/1.1 200 OK\r\nContent-Le");
        framing.observe(b"ngth: 5\r\n\r\nhel");
        assert!(framing.in_flight());
        framing.observe(b"lo");
        assert!(!framing.in_flight());
    }

    #[test]
    fn test_chunked_response_completes_after_trailer() {
        let mut framing = tracker(Expect::Response { bodiless: false });
        let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                         5;x=y\r\nhello\r\n10\r\n0123456789abcdef\r\n0\r\nX-Sum: 1\r\n\r\n";

        for (i, byte) in response.iter().enumerate() {
            assert!(framing.in_flight(), "ended early at byte {i}");
            framing.observe(std::slice::from_ref(byte));
        }
        assert!(!framing.in_flight());
    }

    #[test]
    fn test_interim_and_bodiless_responses() {
        let mut framing = tracker(Expect::Response { bodiless: false });
        framing.observe(b"HTTP/1.1 100 Continue\r\n\r\n");
        assert!(framing.in_flight());
        framing.observe(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert!(!framing.in_flight());

        framing.expect(Expect::Response { bodiless: true });
        framing.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n");
        assert!(!framing.in_flight());
    }

    #[test]
    fn test_pipelined_responses_in_one_read() {
        let mut framing = tracker(Expect::Response { bodiless: false });
        framing.expect(Expect::Response { bodiless: false });

        framing.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA");
        assert!(framing.in_flight());
        framing.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nB");
        assert!(!framing.in_flight());
    }

    #[test]
    fn test_unframed_responses_last_until_close() {
        let mut framing = tracker(Expect::Response { bodiless: false });
        framing.observe(b"HTTP/1.0 200 OK\r\n\r\nuntil close");
        assert!(framing.in_flight());

        let mut tunnel = tracker(Expect::Opaque);
        tunnel.observe(b"anything");
        assert!(tunnel.in_flight());

        let mut garbage = tracker(Expect::Response { bodiless: false });
        garbage.observe(b"not http\r\n\r\n");
        assert!(garbage.in_flight());
    }
}
