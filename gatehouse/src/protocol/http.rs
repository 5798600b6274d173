//! HTTP/1.x request-head inspection and rewriting.
//!
//! The proxy forwards request heads almost verbatim. Parsing extracts
//! what the reactor needs to route and frame the exchange; rewriting
//! only ever touches the request line (and adds a `Host` header when an
//! absolute-form request lacked one).

use crate::error::ParseError;

const MAX_HEADERS: usize = 128;

/// How the request target was written on the request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `CONNECT host:port`.
    Authority { host: String, port: u16 },

    /// `GET http://host[:port]/path`.
    Absolute {
        scheme: String,
        host: String,
        port: Option<u16>,
        path: String,
    },

    /// `GET /path`, routed by the `Host` header.
    Origin { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: Target,

    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,

    /// Value of the `Host` header, if present.
    pub host: Option<String>,

    pub body: BodyFraming,

    /// The request asks to switch protocols (`Upgrade:`).
    pub upgrade: bool,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Host and port the request is addressed to.
    pub fn destination(&self, default_port: u16) -> Option<(String, u16)> {
        match &self.target {
            Target::Authority { host, port } => Some((host.clone(), *port)),
            Target::Absolute {
                scheme, host, port, ..
            } => Some((host.clone(), port.unwrap_or_else(|| scheme_port(scheme)))),
            Target::Origin { .. } => {
                let host = self.host.as_deref()?;
                split_authority(host, default_port).ok()
            }
        }
    }

    /// Path and query as they would appear in origin-form.
    pub fn path(&self) -> &str {
        match &self.target {
            Target::Authority { .. } => "",
            Target::Absolute { path, .. } | Target::Origin { path } => path,
        }
    }
}

fn scheme_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// Parses a complete request head (request line through blank line).
pub fn parse_request(head: &[u8]) -> Result<RequestHead, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ParseError::MalformedHeader("incomplete request head".into()));
        }
        Err(httparse::Error::TooManyHeaders) => {
            return Err(ParseError::HeaderTooLarge { limit: head.len() });
        }
        Err(e) => return Err(ParseError::MalformedHeader(e.to_string())),
    }

    let method = req
        .method
        .ok_or_else(|| ParseError::MalformedHeader("missing method".into()))?
        .to_string();
    let raw_target = req
        .path
        .ok_or_else(|| ParseError::MalformedHeader("missing request target".into()))?;
    let version = req.version.unwrap_or(1);

    let mut host = None;
    let mut lengths = Vec::new();
    let mut codings = Vec::new();
    let mut upgrade = false;

    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| ParseError::MalformedHeader(format!("{} is not text", header.name)))?
            .trim();

        if header.name.eq_ignore_ascii_case("host") {
            if host.is_some() {
                return Err(ParseError::MalformedHeader("duplicate Host header".into()));
            }
            host = Some(value.to_string());
        } else if header.name.eq_ignore_ascii_case("content-length") {
            lengths.extend(value.split(',').map(str::trim).map(str::to_string));
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            codings.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_ascii_lowercase),
            );
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade = !value.is_empty();
        }
    }

    let body = body_framing(&lengths, &codings)?;
    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let target = parse_target(raw_target, is_connect)?;

    Ok(RequestHead {
        method,
        target,
        version,
        host,
        body,
        upgrade,
    })
}

fn body_framing(lengths: &[String], codings: &[String]) -> Result<BodyFraming, ParseError> {
    if !codings.is_empty() {
        if !lengths.is_empty() {
            return Err(ParseError::MalformedHeader(
                "both Content-Length and Transfer-Encoding".into(),
            ));
        }
        return match codings.last().map(String::as_str) {
            Some("chunked") if codings[..codings.len() - 1].iter().all(|c| c != "chunked") => {
                Ok(BodyFraming::Chunked)
            }
            _ => Err(ParseError::Unsupported(format!(
                "transfer coding {}",
                codings.join(", ")
            ))),
        };
    }

    let mut framing = BodyFraming::None;
    for text in lengths {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::MalformedHeader("invalid Content-Length".into()));
        }
        let len: u64 = text
            .parse()
            .map_err(|_| ParseError::MalformedHeader("invalid Content-Length".into()))?;

        match framing {
            BodyFraming::Length(seen) if seen != len => {
                return Err(ParseError::MalformedHeader(
                    "conflicting Content-Length values".into(),
                ));
            }
            _ => framing = BodyFraming::Length(len),
        }
    }

    Ok(framing)
}

fn parse_target(raw: &str, is_connect: bool) -> Result<Target, ParseError> {
    if is_connect {
        let (host, port) = split_authority(raw, 0)?;
        if port == 0 {
            return Err(ParseError::MalformedHeader("CONNECT target lacks a port".into()));
        }
        return Ok(Target::Authority { host, port });
    }

    if raw.starts_with('/') || raw == "*" {
        return Ok(Target::Origin {
            path: raw.to_string(),
        });
    }

    let Some((scheme, rest)) = raw.split_once("://") else {
        return Err(ParseError::MalformedHeader(format!(
            "unrecognised request target {raw}"
        )));
    };

    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return Err(ParseError::Unsupported(format!("scheme {scheme}")));
    }

    let (authority, path) = match rest.find(['/', '?']) {
        Some(at) if rest.as_bytes()[at] == b'?' => (&rest[..at], format!("/{}", &rest[at..])),
        Some(at) => (&rest[..at], rest[at..].to_string()),
        None => (rest, "/".to_string()),
    };

    // Userinfo never reaches the upstream.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let (host, port) = split_authority(authority, 0)?;

    Ok(Target::Absolute {
        scheme: scheme.to_ascii_lowercase(),
        host,
        port: (port != 0).then_some(port),
        path,
    })
}

/// Splits `host[:port]` (or `[v6]:port`), lower-casing the host.
///
/// `default_port` fills in a missing port.
pub fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let bad = || ParseError::MalformedHeader(format!("invalid authority {authority}"));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(bad)?)),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            Some(_) => return Err(bad()),
            None => (authority, None),
        }
    };

    if host.is_empty() || host.bytes().any(|b| b.is_ascii_whitespace() || b == b'/') {
        return Err(bad());
    }

    let port = match port {
        Some(text) => text.parse::<u16>().map_err(|_| bad())?,
        None => default_port,
    };

    Ok((host.to_ascii_lowercase(), port))
}

/// Rebuilds `raw` for an origin server: the request line is rewritten to
/// origin-form, with `path` replacing the original path when given.
/// Header lines pass through untouched.
pub fn forward_head(raw: &[u8], head: &RequestHead, path: Option<&str>) -> Vec<u8> {
    let line_end = raw
        .iter()
        .position(|&b| b == b'\n')
        .map_or(raw.len(), |at| at + 1);

    let target = path.unwrap_or_else(|| head.path());

    let mut out = Vec::with_capacity(raw.len() + 32);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(format!(" HTTP/1.{}\r\n", head.version).as_bytes());

    if head.host.is_none()
        && let Target::Absolute { host, port, .. } = &head.target
    {
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        let value = match port {
            Some(port) => format!("Host: {host}:{port}\r\n"),
            None => format!("Host: {host}\r\n"),
        };
        out.extend_from_slice(value.as_bytes());
    }

    out.extend_from_slice(&raw[line_end..]);
    out
}

/// Joins a rewritten path with optional query arguments.
pub fn rewritten_path(path: &str, args: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    if args.is_empty() {
        path
    } else {
        format!("{path}?{}", args.trim_start_matches('?'))
    }
}
