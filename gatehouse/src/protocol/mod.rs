//! Incremental front-end decoders.
//!
//! A [`Decoder`] owns no bytes. It inspects a connection's append-only
//! input buffer, removes what it has classified, and reports one
//! [`Decoded`] step per call. The connection keeps calling until it gets
//! [`Decoded::NeedMore`] or the decoder is held waiting for a decision.

pub mod boundary;
pub mod chunked;
pub mod framing;
pub mod http;
pub mod icap;
pub mod proxy_header;
pub mod tls;

use crate::error::ParseError;
use boundary::BoundaryScan;
use chunked::{ChunkDecoder, ChunkStep};
use http::{BodyFraming, RequestHead};
use icap::{IcapHead, IcapMethod};
use proxy_header::ProxyHeader;
use tls::ClientHello;

use serde::{Deserialize, Serialize};

/// Front-end protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Proxy,
    Icap,
    Tls,
    Passthrough,
    Web,
}

impl SourceKind {
    /// Whether errors can be reported to the client as an HTTP response.
    pub fn speaks_http(self) -> bool {
        matches!(self, SourceKind::Proxy | SourceKind::Web)
    }
}

/// Framing state of a front-end stream.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Expecting a PROXY v1 line before anything else.
    ProxyLine,

    /// Scanning for the end of an HTTP or ICAP head.
    Header,

    /// ICAP head parsed; collecting the encapsulated HTTP headers.
    Encapsulated { head: Box<IcapHead>, header: Vec<u8> },

    /// Waiting for a full TLS Client Hello record.
    Hello,

    /// Passthrough listener about to announce its connection.
    Announce,

    /// A message was emitted; nothing is consumed until released.
    Held,

    FixedLength(u64),
    Chunked(ChunkDecoder),
    EndChunk,
    TrailerHeaders,

    /// Body complete; reports [`Decoded::Complete`] once.
    Finished,

    /// Raw bytes until EOF.
    Passthrough,
}

/// How the stream continues once a held message is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// The message's own body, then the next message.
    Body,

    /// The message's own body, then raw bytes until EOF.
    BodyThenTunnel,

    /// This many body bytes, then raw bytes until EOF.
    LengthThenTunnel(u64),

    /// Raw bytes straight away.
    Tunnel,
}

/// Protocol metadata of a complete front-end message.
#[derive(Debug, Clone)]
pub enum Meta {
    Http(RequestHead),
    Icap(IcapHead),
    Tls(ClientHello),
    Raw,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub header: Vec<u8>,

    /// ICAP only: the encapsulated HTTP header block(s).
    pub sub_header: Vec<u8>,

    pub meta: Meta,
}

#[derive(Debug)]
pub enum Decoded {
    NeedMore,

    /// A PROXY line was stripped; the source replaces the peer address.
    ProxyHeader(ProxyHeader),

    Message(Message),

    /// Verbatim body bytes to relay.
    Body(Vec<u8>),

    /// The current message's body is over.
    Complete,
}

#[derive(Debug)]
pub struct Decoder {
    kind: SourceKind,
    mode: Mode,
    scan: BoundaryScan,
    max_header: usize,

    /// Body mode to enter when the held message is released.
    pending: Mode,

    /// Switch to passthrough instead of the next head once the body ends.
    tunnel_after: bool,
}

impl Decoder {
    pub fn new(kind: SourceKind, proxy_protocol: bool, max_header: usize) -> Self {
        let mode = if proxy_protocol {
            Mode::ProxyLine
        } else {
            initial_mode(kind)
        };

        Self {
            kind,
            mode,
            scan: BoundaryScan::new(),
            max_header,
            pending: Mode::Finished,
            tunnel_after: false,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn is_held(&self) -> bool {
        matches!(self.mode, Mode::Held)
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self.mode, Mode::Passthrough)
    }

    /// Whether the decoder sits between messages, with no body pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.mode, Mode::Header | Mode::ProxyLine)
    }

    /// Resumes decoding after a decision for the held message.
    pub fn release(&mut self, continuation: Continuation) {
        if !self.is_held() {
            return;
        }

        let body = std::mem::replace(&mut self.pending, Mode::Finished);
        self.tunnel_after = false;

        self.mode = match continuation {
            Continuation::Body => body,
            Continuation::BodyThenTunnel => {
                self.tunnel_after = true;
                body
            }
            Continuation::LengthThenTunnel(0) | Continuation::Tunnel => Mode::Passthrough,
            Continuation::LengthThenTunnel(n) => {
                self.tunnel_after = true;
                Mode::FixedLength(n)
            }
        };
    }

    /// Drives the state machine one step over `input`.
    pub fn decode(&mut self, input: &mut Vec<u8>) -> Result<Decoded, ParseError> {
        match &mut self.mode {
            Mode::Held => Ok(Decoded::NeedMore),

            Mode::ProxyLine => match proxy_header::parse_proxy_v1(input)? {
                None => Ok(Decoded::NeedMore),
                Some((header, used)) => {
                    input.drain(..used);
                    self.mode = initial_mode(self.kind);
                    Ok(Decoded::ProxyHeader(header))
                }
            },

            Mode::Announce => {
                self.hold(Mode::Passthrough);
                Ok(Decoded::Message(Message {
                    header: Vec::new(),
                    sub_header: Vec::new(),
                    meta: Meta::Raw,
                }))
            }

            Mode::Hello => match tls::parse_client_hello(input)? {
                None => Ok(Decoded::NeedMore),
                Some(hello) => {
                    // The hello stays buffered; it is relayed once permitted.
                    let header = input[..hello.record_len].to_vec();
                    self.hold(Mode::Passthrough);
                    Ok(Decoded::Message(Message {
                        header,
                        sub_header: Vec::new(),
                        meta: Meta::Tls(hello),
                    }))
                }
            },

            Mode::Header => self.decode_head(input),

            Mode::Encapsulated { head, header } => {
                let len = head.encapsulated_len();
                if len > self.max_header {
                    return Err(ParseError::HeaderTooLarge {
                        limit: self.max_header,
                    });
                }
                if input.len() < len {
                    return Ok(Decoded::NeedMore);
                }

                let sub_header: Vec<u8> = input.drain(..len).collect();
                let head = (**head).clone();
                let header = std::mem::take(header);

                let body = if head.has_body() {
                    Mode::Chunked(ChunkDecoder::new())
                } else {
                    Mode::Finished
                };
                self.hold(body);

                Ok(Decoded::Message(Message {
                    header,
                    sub_header,
                    meta: Meta::Icap(head),
                }))
            }

            Mode::FixedLength(left) => {
                if input.is_empty() {
                    return Ok(Decoded::NeedMore);
                }

                let take = (*left).min(input.len() as u64) as usize;
                *left -= take as u64;
                if *left == 0 {
                    self.mode = Mode::Finished;
                }

                Ok(Decoded::Body(input.drain(..take).collect()))
            }

            Mode::Chunked(chunks) => match chunks.decode(input)? {
                ChunkStep::NeedMore => Ok(Decoded::NeedMore),
                ChunkStep::Data { consumed, .. } => {
                    Ok(Decoded::Body(input.drain(..consumed).collect()))
                }
                ChunkStep::Last { consumed } => {
                    self.mode = Mode::EndChunk;
                    Ok(Decoded::Body(input.drain(..consumed).collect()))
                }
            },

            Mode::EndChunk => match input.as_slice() {
                [] | [b'\r'] => Ok(Decoded::NeedMore),
                [b'\r', b'\n', ..] => {
                    self.mode = Mode::Finished;
                    Ok(Decoded::Body(input.drain(..2).collect()))
                }
                [b'\n', ..] => {
                    self.mode = Mode::Finished;
                    Ok(Decoded::Body(input.drain(..1).collect()))
                }
                _ => {
                    self.scan.reset();
                    self.mode = Mode::TrailerHeaders;
                    Ok(Decoded::Body(Vec::new()))
                }
            },

            Mode::TrailerHeaders => match self.scan.find(input, self.max_header)? {
                None => Ok(Decoded::NeedMore),
                Some(len) => {
                    self.mode = Mode::Finished;
                    Ok(Decoded::Body(input.drain(..len).collect()))
                }
            },

            Mode::Finished => {
                self.mode = if std::mem::take(&mut self.tunnel_after) {
                    Mode::Passthrough
                } else {
                    self.scan.reset();
                    initial_mode(self.kind)
                };
                Ok(Decoded::Complete)
            }

            Mode::Passthrough => {
                if input.is_empty() {
                    Ok(Decoded::NeedMore)
                } else {
                    Ok(Decoded::Body(std::mem::take(input)))
                }
            }
        }
    }

    fn decode_head(&mut self, input: &mut Vec<u8>) -> Result<Decoded, ParseError> {
        // Empty lines before a request line are ignored.
        if self.scan.cursor() == 0 {
            let skip = input
                .iter()
                .take_while(|&&b| b == b'\r' || b == b'\n')
                .count();
            input.drain(..skip);
        }

        let Some(len) = self.scan.find(input, self.max_header)? else {
            return Ok(Decoded::NeedMore);
        };
        let header: Vec<u8> = input.drain(..len).collect();

        if self.kind == SourceKind::Icap {
            let head = icap::parse_request(&header)?;

            if head.method == IcapMethod::Options {
                self.hold(Mode::Finished);
                return Ok(Decoded::Message(Message {
                    header,
                    sub_header: Vec::new(),
                    meta: Meta::Icap(head),
                }));
            }

            self.mode = Mode::Encapsulated {
                head: Box::new(head),
                header,
            };
            return self.decode(input);
        }

        let head = http::parse_request(&header)?;
        let body = match head.body {
            _ if head.is_connect() => Mode::Finished,
            BodyFraming::None | BodyFraming::Length(0) => Mode::Finished,
            BodyFraming::Length(n) => Mode::FixedLength(n),
            BodyFraming::Chunked => Mode::Chunked(ChunkDecoder::new()),
        };
        self.hold(body);

        Ok(Decoded::Message(Message {
            header,
            sub_header: Vec::new(),
            meta: Meta::Http(head),
        }))
    }

    fn hold(&mut self, body: Mode) {
        self.pending = body;
        self.mode = Mode::Held;
    }
}

fn initial_mode(kind: SourceKind) -> Mode {
    match kind {
        SourceKind::Proxy | SourceKind::Icap | SourceKind::Web => Mode::Header,
        SourceKind::Tls => Mode::Hello,
        SourceKind::Passthrough => Mode::Announce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(kind: SourceKind) -> Decoder {
        Decoder::new(kind, false, 8192)
    }

    fn expect_message(dec: &mut Decoder, input: &mut Vec<u8>) -> Message {
        match dec.decode(input).unwrap() {
            Decoded::Message(message) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn drain_body(dec: &mut Decoder, input: &mut Vec<u8>) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            match dec.decode(input).unwrap() {
                Decoded::Body(bytes) => body.extend(bytes),
                Decoded::Complete | Decoded::NeedMore => return body,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_request_with_fixed_body() {
        let mut dec = decoder(SourceKind::Proxy);
        let mut input = b"\r\nPOST http://a.test/ HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello".to_vec();

        let message = expect_message(&mut dec, &mut input);
        assert!(message.header.starts_with(b"POST"));
        assert!(dec.is_held());
        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::NeedMore));

        dec.release(Continuation::Body);
        assert_eq!(drain_body(&mut dec, &mut input), b"hello");
        assert!(dec.is_idle());
    }

    #[test]
    fn test_chunked_body_is_relayed_verbatim() {
        let mut dec = decoder(SourceKind::Proxy);
        let body = b"4;x=y\r\nwiki\r\n0\r\nExpires: never\r\n\r\n";
        let mut input = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        input.extend_from_slice(body);

        expect_message(&mut dec, &mut input);
        dec.release(Continuation::Body);

        assert_eq!(drain_body(&mut dec, &mut input), body);
        assert!(input.is_empty());
        assert!(dec.is_idle());
    }

    #[test]
    fn test_pipelined_requests() {
        let mut dec = decoder(SourceKind::Proxy);
        let mut input = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /2 HTTP/1.1\r\nHost: a\r\n\r\n".to_vec();

        expect_message(&mut dec, &mut input);
        dec.release(Continuation::Body);
        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::Complete));

        let second = expect_message(&mut dec, &mut input);
        assert!(second.header.starts_with(b"GET /2"));
    }

    #[test]
    fn test_connect_switches_to_tunnel() {
        let mut dec = decoder(SourceKind::Proxy);
        let mut input = b"CONNECT a.test:443 HTTP/1.1\r\n\r\n\x16\x03\x01".to_vec();

        expect_message(&mut dec, &mut input);
        dec.release(Continuation::Tunnel);

        assert!(dec.is_tunnel());
        assert!(matches!(
            dec.decode(&mut input).unwrap(),
            Decoded::Body(bytes) if bytes == b"\x16\x03\x01"
        ));
    }

    #[test]
    fn test_upgrade_length_then_tunnel() {
        let mut dec = decoder(SourceKind::Proxy);
        let mut input = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nabcdef".to_vec();

        expect_message(&mut dec, &mut input);
        dec.release(Continuation::LengthThenTunnel(2));

        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::Body(b) if b == b"ab"));
        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::Complete));
        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::Body(b) if b == b"cdef"));
    }

    #[test]
    fn test_tls_hello_stays_buffered() {
        let mut dec = decoder(SourceKind::Tls);
        let record = tls::sample_hello(Some("a.test"));
        let mut input = record.clone();

        let message = expect_message(&mut dec, &mut input);
        assert_eq!(message.header, record);
        assert_eq!(input, record);
        assert!(matches!(message.meta, Meta::Tls(ref h) if h.sni.as_deref() == Some("a.test")));

        dec.release(Continuation::Body);
        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::Body(b) if b == record));
    }

    #[test]
    fn test_proxy_line_then_passthrough() {
        let mut dec = Decoder::new(SourceKind::Passthrough, true, 8192);
        let mut input = b"PROXY TCP4 10.0.0.1 10.0.0.2 1234 80\r\nraw".to_vec();

        assert!(matches!(
            dec.decode(&mut input).unwrap(),
            Decoded::ProxyHeader(h) if h.source == Some("10.0.0.1:1234".parse().unwrap())
        ));
        let message = expect_message(&mut dec, &mut input);
        assert!(matches!(message.meta, Meta::Raw));

        dec.release(Continuation::Body);
        assert!(matches!(dec.decode(&mut input).unwrap(), Decoded::Body(b) if b == b"raw"));
    }

    #[test]
    fn test_missing_proxy_line_is_fatal() {
        let mut dec = Decoder::new(SourceKind::Proxy, true, 8192);
        let mut input = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        assert_eq!(
            dec.decode(&mut input).unwrap_err(),
            ParseError::MissingProxyHeader
        );
    }

    #[test]
    fn test_icap_reqmod_with_body() {
        let http = b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n";
        let mut input = format!(
            "REQMOD icap://gw/filter ICAP/1.0\r\nHost: gw\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
            http.len()
        )
        .into_bytes();
        input.extend_from_slice(http);
        input.extend_from_slice(b"3\r\nabc\r\n0\r\n\r\n");

        let mut dec = decoder(SourceKind::Icap);
        let message = expect_message(&mut dec, &mut input);

        assert!(message.header.starts_with(b"REQMOD"));
        assert_eq!(message.sub_header, http);

        dec.release(Continuation::Body);
        assert_eq!(drain_body(&mut dec, &mut input), b"3\r\nabc\r\n0\r\n\r\n");
        assert!(dec.is_idle());
    }

    #[test]
    fn test_icap_options() {
        let mut dec = decoder(SourceKind::Icap);
        let mut input = b"OPTIONS icap://gw/filter ICAP/1.0\r\nHost: gw\r\n\r\n".to_vec();

        let message = expect_message(&mut dec, &mut input);
        assert!(matches!(message.meta, Meta::Icap(ref h) if h.method == IcapMethod::Options));
    }

    #[test]
    fn test_oversized_chunk_relays_nothing() {
        let mut dec = decoder(SourceKind::Proxy);
        let mut input =
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n100001\r\n".to_vec();

        expect_message(&mut dec, &mut input);
        dec.release(Continuation::Body);

        assert!(matches!(
            dec.decode(&mut input),
            Err(ParseError::ChunkTooLarge { .. })
        ));
        assert_eq!(input, b"100001\r\n");
    }
}
