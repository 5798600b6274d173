//! Header/body boundary search.
//!
//! A header block ends at the first blank line (`CRLFCRLF` or `LFLF`)
//! that is not inside a double-quoted string. Quotes preceded by a
//! backslash do not count. The scanner keeps its position and quote
//! parity between calls so a growing buffer is never rescanned.

use crate::error::ParseError;

#[derive(Debug, Default, Clone)]
pub struct BoundaryScan {
    /// Next byte to inspect.
    pos: usize,
    in_quote: bool,
    escaped: bool,
}

impl BoundaryScan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all progress; the next search starts at offset zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Offset the next call resumes from.
    pub fn cursor(&self) -> usize {
        self.pos
    }

    /// Searches `buf` for the end of a header block.
    ///
    /// Returns the header length including the blank line, `None` when
    /// more bytes are needed, or an error once `buf` grew past `max`
    /// without a boundary. `buf` must be the same buffer as on the
    /// previous call, possibly extended at the end.
    pub fn find(&mut self, buf: &[u8], max: usize) -> Result<Option<usize>, ParseError> {
        while self.pos < buf.len() {
            let i = self.pos;
            self.pos += 1;

            if self.escaped {
                self.escaped = false;
                continue;
            }

            match buf[i] {
                b'\\' => self.escaped = true,
                b'"' => self.in_quote = !self.in_quote,
                b'\n' if !self.in_quote && ends_blank_line(buf, i) => {
                    let len = i + 1;
                    self.reset();

                    if len > max {
                        return Err(ParseError::HeaderTooLarge { limit: max });
                    }
                    return Ok(Some(len));
                }
                _ => {}
            }
        }

        if buf.len() > max {
            return Err(ParseError::HeaderTooLarge { limit: max });
        }

        Ok(None)
    }
}

/// Whether the LF at `i` closes an empty line.
fn ends_blank_line(buf: &[u8], i: usize) -> bool {
    (i >= 1 && buf[i - 1] == b'\n') || (i >= 3 && &buf[i - 3..=i] == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 8192;

    #[test]
    fn test_crlf_boundary() {
        let buf = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody";
        let mut scan = BoundaryScan::new();
        assert_eq!(scan.find(buf, MAX).unwrap(), Some(buf.len() - 4));
    }

    #[test]
    fn test_bare_lf_boundary() {
        let buf = b"GET / HTTP/1.1\nHost: a\n\nrest";
        let mut scan = BoundaryScan::new();
        assert_eq!(scan.find(buf, MAX).unwrap(), Some(buf.len() - 4));
    }

    #[test]
    fn test_quoted_blank_line_is_skipped() {
        let buf = b"X: \"a\r\n\r\nb\"\r\n\r\n";
        let mut scan = BoundaryScan::new();
        assert_eq!(scan.find(buf, MAX).unwrap(), Some(buf.len()));
    }

    #[test]
    fn test_escaped_quote_does_not_toggle() {
        let buf = b"X: a\\\"b\r\n\r\n";
        let mut scan = BoundaryScan::new();
        assert_eq!(scan.find(buf, MAX).unwrap(), Some(buf.len()));
    }

    #[test]
    fn test_resumes_without_rescanning() {
        let full = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut scan = BoundaryScan::new();

        assert_eq!(scan.find(&full[..10], MAX).unwrap(), None);
        assert_eq!(scan.cursor(), 10);
        assert_eq!(scan.find(&full[..26], MAX).unwrap(), None);
        assert_eq!(scan.find(full, MAX).unwrap(), Some(full.len()));
        assert_eq!(scan.cursor(), 0);
    }

    #[test]
    fn test_boundary_split_across_calls() {
        let full = b"A: b\r\n\r\n";
        let mut scan = BoundaryScan::new();

        for end in 1..full.len() {
            assert_eq!(scan.find(&full[..end], MAX).unwrap(), None);
        }
        assert_eq!(scan.find(full, MAX).unwrap(), Some(full.len()));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let buf = vec![b'a'; 100];
        let mut scan = BoundaryScan::new();
        assert_eq!(
            scan.find(&buf, 64),
            Err(ParseError::HeaderTooLarge { limit: 64 })
        );
    }
}
