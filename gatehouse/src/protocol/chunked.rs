//! Chunked transfer-coding validation.
//!
//! The decoder walks a chunked body one whole chunk at a time. A chunk is
//! only reported once its size line, its data and the line ending after
//! the data are all buffered; until then the caller's buffer is left
//! untouched so it can simply append and retry.

use crate::error::ParseError;

use std::ops::Range;

/// Largest chunk the decoder agrees to buffer.
pub const MAX_CHUNK_SIZE: u64 = 0x100000;

/// Longest size line (digits plus extensions) accepted before giving up.
const MAX_SIZE_LINE: usize = 4096;

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStep {
    NeedMore,

    /// A complete data chunk spanning `consumed` raw bytes; the payload
    /// sits at `payload` within them.
    Data {
        consumed: usize,
        payload: Range<usize>,
    },

    /// The terminating zero-size line. Trailers or the final line ending
    /// follow and are not part of `consumed`.
    Last { consumed: usize },
}

#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    /// Size of the chunk whose size line has been validated.
    remaining: u64,

    /// Length of that size line, including its line ending.
    line_len: usize,

    expect_size_line: bool,

    /// Payload bytes validated so far.
    validated: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            remaining: 0,
            line_len: 0,
            expect_size_line: true,
            validated: 0,
        }
    }

    pub fn validated(&self) -> u64 {
        self.validated
    }

    /// Inspects the unconsumed input starting at a chunk boundary.
    ///
    /// After `Data` or `Last` the caller removes `consumed` bytes before
    /// calling again.
    pub fn decode(&mut self, buf: &[u8]) -> Result<ChunkStep, ParseError> {
        if self.expect_size_line {
            let Some(lf) = buf.iter().position(|&b| b == b'\n') else {
                if buf.len() > MAX_SIZE_LINE {
                    return Err(ParseError::InvalidChunkSize);
                }
                return Ok(ChunkStep::NeedMore);
            };

            let size = parse_size_line(&buf[..lf])?;
            if size == 0 {
                return Ok(ChunkStep::Last { consumed: lf + 1 });
            }

            self.remaining = size;
            self.line_len = lf + 1;
            self.expect_size_line = false;
        }

        let start = self.line_len;
        let end = start + self.remaining as usize;

        if buf.len() <= end {
            return Ok(ChunkStep::NeedMore);
        }

        let eol = match buf[end] {
            b'\n' => 1,
            b'\r' if buf.len() < end + 2 => return Ok(ChunkStep::NeedMore),
            b'\r' if buf[end + 1] == b'\n' => 2,
            _ => return Err(ParseError::MissingChunkTerminator),
        };

        self.validated += self.remaining;
        self.remaining = 0;
        self.line_len = 0;
        self.expect_size_line = true;

        Ok(ChunkStep::Data {
            consumed: end + eol,
            payload: start..end,
        })
    }
}

/// Parses `<hex>[;ext...]` with an optional trailing CR.
fn parse_size_line(line: &[u8]) -> Result<u64, ParseError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let digits = match line.iter().position(|&b| b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };

    let digits = trim_trailing_whitespace(digits);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunkSize);
    }

    let significant = match digits.iter().position(|&b| b != b'0') {
        Some(first) => &digits[first..],
        None => return Ok(0),
    };

    if significant.len() > 16 {
        return Err(ParseError::ChunkTooLarge {
            size: u64::MAX,
            limit: MAX_CHUNK_SIZE,
        });
    }

    let mut size = 0u64;
    for &digit in significant {
        let value = (digit as char).to_digit(16).unwrap_or(0) as u64;
        size = (size << 4) | value;
    }

    if size > MAX_CHUNK_SIZE {
        return Err(ParseError::ChunkTooLarge {
            size,
            limit: MAX_CHUNK_SIZE,
        });
    }

    Ok(size)
}

fn trim_trailing_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk() {
        let mut dec = ChunkDecoder::new();
        let buf = b"5\r\nhello\r\n0\r\n\r\n";

        assert_eq!(
            dec.decode(buf).unwrap(),
            ChunkStep::Data {
                consumed: 10,
                payload: 3..8
            }
        );
        assert_eq!(
            dec.decode(&buf[10..]).unwrap(),
            ChunkStep::Last { consumed: 3 }
        );
        assert_eq!(dec.validated(), 5);
    }

    #[test]
    fn test_extension_and_bare_lf() {
        let mut dec = ChunkDecoder::new();
        let buf = b"3;name=value\nabc\n";

        assert_eq!(
            dec.decode(buf).unwrap(),
            ChunkStep::Data {
                consumed: buf.len(),
                payload: 13..16
            }
        );
    }

    #[test]
    fn test_partial_chunk_needs_more_without_consuming() {
        let mut dec = ChunkDecoder::new();
        let full = b"a\r\n0123456789\r\n";

        for end in 0..full.len() {
            assert_eq!(dec.decode(&full[..end]).unwrap(), ChunkStep::NeedMore);
        }
        assert!(matches!(
            dec.decode(full).unwrap(),
            ChunkStep::Data { consumed, .. } if consumed == full.len()
        ));
    }

    #[test]
    fn test_non_hex_size_rejected() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(dec.decode(b"xyz\r\n"), Err(ParseError::InvalidChunkSize));

        let mut dec = ChunkDecoder::new();
        assert_eq!(dec.decode(b"\r\n"), Err(ParseError::InvalidChunkSize));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(
            dec.decode(b"100001\r\n"),
            Err(ParseError::ChunkTooLarge {
                size: 0x100001,
                limit: MAX_CHUNK_SIZE
            })
        );

        let mut dec = ChunkDecoder::new();
        assert!(matches!(
            dec.decode(b"fffffffffffffffffffff\r\n"),
            Err(ParseError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(dec.decode(b"100000\r\n").unwrap(), ChunkStep::NeedMore);
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(
            dec.decode(b"2\r\nabX"),
            Err(ParseError::MissingChunkTerminator)
        );
    }

    #[test]
    fn test_leading_zeros_and_whitespace() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(
            dec.decode(b"0002 \r\nab\r\n").unwrap(),
            ChunkStep::Data {
                consumed: 11,
                payload: 7..9
            }
        );
    }
}
