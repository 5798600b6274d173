//! PROXY protocol v1 preamble.

use crate::error::ParseError;

use std::net::{IpAddr, SocketAddr};

const SIGNATURE: &[u8] = b"PROXY ";

/// Longest legal v1 line, CRLF included.
const MAX_LINE: usize = 107;

/// Addresses carried by a PROXY line. Both are `None` for `UNKNOWN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Parses a PROXY v1 line at the start of `buf`.
///
/// Returns the header and the number of bytes it occupies, or `None`
/// while the line is incomplete.
pub fn parse_proxy_v1(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ParseError> {
    let prefix = buf.len().min(SIGNATURE.len());
    if buf[..prefix] != SIGNATURE[..prefix] {
        return Err(ParseError::MissingProxyHeader);
    }

    let window = &buf[..buf.len().min(MAX_LINE)];
    let Some(cr) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= MAX_LINE {
            return Err(ParseError::MalformedProxyHeader("line too long"));
        }
        return Ok(None);
    };

    let line = std::str::from_utf8(&buf[SIGNATURE.len()..cr])
        .map_err(|_| ParseError::MalformedProxyHeader("line is not text"))?;

    let header = parse_fields(line)?;
    Ok(Some((header, cr + 2)))
}

fn parse_fields(line: &str) -> Result<ProxyHeader, ParseError> {
    let mut fields = line.split(' ');

    let family = fields
        .next()
        .ok_or(ParseError::MalformedProxyHeader("missing family"))?;

    let want_v6 = match family {
        "TCP4" => false,
        "TCP6" => true,
        // Whatever follows UNKNOWN is ignored.
        "UNKNOWN" => {
            return Ok(ProxyHeader {
                source: None,
                destination: None,
            });
        }
        _ => return Err(ParseError::MalformedProxyHeader("unknown family")),
    };

    let rest: Vec<&str> = fields.collect();
    let [src, dst, sport, dport] = rest[..] else {
        return Err(ParseError::MalformedProxyHeader("wrong field count"));
    };

    let address = |text: &str| -> Result<IpAddr, ParseError> {
        let ip: IpAddr = text
            .parse()
            .map_err(|_| ParseError::MalformedProxyHeader("bad address"))?;
        if ip.is_ipv6() != want_v6 {
            return Err(ParseError::MalformedProxyHeader("address family mismatch"));
        }
        Ok(ip)
    };

    let port = |text: &str| -> Result<u16, ParseError> {
        if text.len() > 1 && text.starts_with('0') {
            return Err(ParseError::MalformedProxyHeader("bad port"));
        }
        text.parse()
            .map_err(|_| ParseError::MalformedProxyHeader("bad port"))
    };

    Ok(ProxyHeader {
        source: Some(SocketAddr::new(address(src)?, port(sport)?)),
        destination: Some(SocketAddr::new(address(dst)?, port(dport)?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp4_line() {
        let buf = b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 443\r\nGET /";
        let (header, used) = parse_proxy_v1(buf).unwrap().unwrap();

        assert_eq!(used, buf.len() - 5);
        assert_eq!(header.source, Some("192.0.2.1:56324".parse().unwrap()));
        assert_eq!(header.destination, Some("198.51.100.2:443".parse().unwrap()));
    }

    #[test]
    fn test_tcp6_line() {
        let buf = b"PROXY TCP6 2001:db8::1 2001:db8::2 1000 80\r\n";
        let (header, _) = parse_proxy_v1(buf).unwrap().unwrap();
        assert_eq!(header.source, Some("[2001:db8::1]:1000".parse().unwrap()));
    }

    #[test]
    fn test_unknown_family() {
        let (header, used) = parse_proxy_v1(b"PROXY UNKNOWN\r\n").unwrap().unwrap();
        assert_eq!(header.source, None);
        assert_eq!(used, 15);
    }

    #[test]
    fn test_partial_line_needs_more() {
        assert_eq!(parse_proxy_v1(b"PRO").unwrap(), None);
        assert_eq!(parse_proxy_v1(b"PROXY TCP4 1.2.3.4").unwrap(), None);
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            parse_proxy_v1(b"GET / HTTP/1.1\r\n"),
            Err(ParseError::MissingProxyHeader)
        );
    }

    #[test]
    fn test_malformed_lines() {
        for line in [
            &b"PROXY TCP4 1.2.3.4 5.6.7.8 80\r\n"[..],
            b"PROXY TCP4 ::1 ::1 80 80\r\n",
            b"PROXY TCP5 1.2.3.4 5.6.7.8 80 80\r\n",
            b"PROXY TCP4 1.2.3.4 5.6.7.8 080 80\r\n",
            b"PROXY TCP4 1.2.3.4 5.6.7.8 80 99999\r\n",
        ] {
            assert!(
                matches!(
                    parse_proxy_v1(line),
                    Err(ParseError::MalformedProxyHeader(_))
                ),
                "{:?}",
                String::from_utf8_lossy(line)
            );
        }
    }

    #[test]
    fn test_overlong_line() {
        let mut buf = b"PROXY TCP4 ".to_vec();
        buf.resize(200, b'1');
        assert_eq!(
            parse_proxy_v1(&buf),
            Err(ParseError::MalformedProxyHeader("line too long"))
        );
    }
}
