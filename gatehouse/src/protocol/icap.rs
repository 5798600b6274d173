//! ICAP (RFC 3507) request inspection and response building.
//!
//! Only the parts a request-modification service needs are handled:
//! the request line, the `Encapsulated` offsets, and the handful of
//! responses the proxy sends back (`OPTIONS`, `204`, `200` with an
//! encapsulated HTTP message, errors).

use crate::error::ParseError;
use crate::response::reason;

const MAX_HEADERS: usize = 64;

/// Service tag returned on every response.
pub const ISTAG: &str = "\"gatehouse-1\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcapMethod {
    Options,
    Reqmod,
    Respmod,
}

/// Sections named by the `Encapsulated` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    ReqHdr,
    ResHdr,
    ReqBody,
    ResBody,
    OptBody,
    NullBody,
}

impl Section {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "req-hdr" => Section::ReqHdr,
            "res-hdr" => Section::ResHdr,
            "req-body" => Section::ReqBody,
            "res-body" => Section::ResBody,
            "opt-body" => Section::OptBody,
            "null-body" => Section::NullBody,
            _ => return None,
        })
    }

    fn is_body(self) -> bool {
        !matches!(self, Section::ReqHdr | Section::ResHdr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcapHead {
    pub method: IcapMethod,
    pub service: String,

    /// `Encapsulated` entries in offset order.
    pub sections: Vec<(Section, usize)>,

    /// Client accepts a `204 No Content` answer.
    pub allow_204: bool,
}

impl IcapHead {
    /// Bytes of encapsulated HTTP header that follow the ICAP head.
    pub fn encapsulated_len(&self) -> usize {
        self.sections
            .iter()
            .find(|(section, _)| section.is_body())
            .map_or(0, |&(_, offset)| offset)
    }

    /// Whether a chunked body follows the encapsulated headers.
    pub fn has_body(&self) -> bool {
        self.sections
            .iter()
            .any(|(section, _)| matches!(section, Section::ReqBody | Section::ResBody))
    }
}

/// Parses a complete ICAP head.
pub fn parse_request(head: &[u8]) -> Result<IcapHead, ParseError> {
    let malformed = |what: &str| ParseError::MalformedHeader(what.to_string());

    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| malformed("missing ICAP request line"))?;
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| malformed("ICAP request line is not text"))?
        .trim_end_matches('\r');

    let mut parts = line.split(' ');
    let (Some(method), Some(service), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed("ICAP request line"));
    };

    if version != "ICAP/1.0" {
        return Err(ParseError::Unsupported(format!("version {version}")));
    }

    let method = match method {
        "OPTIONS" => IcapMethod::Options,
        "REQMOD" => IcapMethod::Reqmod,
        "RESPMOD" => IcapMethod::Respmod,
        other => return Err(ParseError::Unsupported(format!("ICAP method {other}"))),
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let parsed = match httparse::parse_headers(&head[line_end + 1..], &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        Ok(httparse::Status::Partial) => return Err(malformed("incomplete ICAP head")),
        Err(e) => return Err(ParseError::MalformedHeader(e.to_string())),
    };

    let mut sections = None;
    let mut allow_204 = false;

    for header in parsed {
        let value = String::from_utf8_lossy(header.value);

        if header.name.eq_ignore_ascii_case("encapsulated") {
            sections = Some(parse_encapsulated(&value)?);
        } else if header.name.eq_ignore_ascii_case("allow") {
            allow_204 = value.split(',').any(|v| v.trim() == "204");
        }
    }

    let sections = match (method, sections) {
        (_, Some(sections)) => sections,
        (IcapMethod::Options, None) => Vec::new(),
        (_, None) => {
            return Err(ParseError::MalformedEncapsulation(
                "missing Encapsulated header".into(),
            ));
        }
    };

    if method != IcapMethod::Options && !sections.iter().any(|(s, _)| s.is_body()) {
        return Err(ParseError::MalformedEncapsulation("no body section".into()));
    }

    Ok(IcapHead {
        method,
        service: service.to_string(),
        sections,
        allow_204,
    })
}

/// Parses `req-hdr=0, req-body=412` style values.
pub fn parse_encapsulated(value: &str) -> Result<Vec<(Section, usize)>, ParseError> {
    let mut sections = Vec::new();
    let mut last = 0;

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let bad = || ParseError::MalformedEncapsulation(entry.to_string());

        let (name, offset) = entry.split_once('=').ok_or_else(bad)?;
        let section = Section::parse(name.trim()).ok_or_else(bad)?;
        let offset: usize = offset.trim().parse().map_err(|_| bad())?;

        if offset < last || sections.iter().any(|&(s, _): &(Section, usize)| s.is_body()) {
            return Err(bad());
        }

        last = offset;
        sections.push((section, offset));
    }

    if sections.is_empty() {
        return Err(ParseError::MalformedEncapsulation(value.to_string()));
    }

    Ok(sections)
}

/// The encapsulated HTTP request head, when the client sent one.
pub fn request_section<'a>(head: &IcapHead, sub_header: &'a [u8]) -> Option<&'a [u8]> {
    let start = head
        .sections
        .iter()
        .position(|&(s, _)| s == Section::ReqHdr)?;
    let from = head.sections[start].1;
    let to = head
        .sections
        .get(start + 1)
        .map_or(sub_header.len(), |&(_, offset)| offset);

    sub_header.get(from..to)
}

fn status_line(status: u16) -> String {
    format!("ICAP/1.0 {status} {}\r\nISTag: {ISTAG}\r\n", reason(status))
}

pub fn options_response() -> Vec<u8> {
    let mut out = status_line(200);
    out.push_str("Methods: REQMOD, RESPMOD\r\n");
    out.push_str("Service: gatehouse\r\n");
    out.push_str("Allow: 204\r\n");
    out.push_str("Preview: 0\r\n");
    out.push_str("Transfer-Preview: *\r\n");
    out.push_str("Encapsulated: null-body=0\r\n\r\n");
    out.into_bytes()
}

/// `204`: forward the message unchanged.
pub fn no_modification() -> Vec<u8> {
    let mut out = status_line(204);
    out.push_str("Encapsulated: null-body=0\r\n\r\n");
    out.into_bytes()
}

/// `200` carrying a replacement HTTP response (head plus optional body).
pub fn with_response(http_head: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = status_line(200);
    let section = if body.is_empty() { "null-body" } else { "res-body" };
    out.push_str(&format!(
        "Encapsulated: res-hdr=0, {section}={}\r\n\r\n",
        http_head.len()
    ));

    let mut out = out.into_bytes();
    out.extend_from_slice(http_head);
    if !body.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n0\r\n\r\n");
    }
    out
}

/// `200` carrying a rewritten HTTP request head.
pub fn with_request(http_head: &[u8]) -> Vec<u8> {
    let mut out = status_line(200);
    out.push_str(&format!(
        "Encapsulated: req-hdr=0, null-body={}\r\n\r\n",
        http_head.len()
    ));

    let mut out = out.into_bytes();
    out.extend_from_slice(http_head);
    out
}

/// Protocol-level failure (`400`, `500`, ...).
pub fn error_response(status: u16) -> Vec<u8> {
    let mut out = status_line(status);
    out.push_str("Connection: close\r\nEncapsulated: null-body=0\r\n\r\n");
    out.into_bytes()
}
