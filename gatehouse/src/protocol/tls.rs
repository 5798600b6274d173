//! TLS Client Hello inspection.
//!
//! Only the first handshake record is examined. Nothing is decrypted; the
//! hello bytes stay in the connection's input and are relayed verbatim
//! once a decision is reached.

use crate::error::ParseError;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Plaintext record ceiling plus the expansion allowance.
const MAX_RECORD_LEN: usize = 16384 + 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Lower-cased server name, when the client sent one.
    pub sni: Option<String>,

    /// Length of the whole first record, header included.
    pub record_len: usize,
}

/// Bounds-checked reader over the hello record body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ParseError::MalformedTls(what))?;

        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, ParseError> {
        let b = self.take(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn skip_u8_prefixed(&mut self, what: &'static str) -> Result<(), ParseError> {
        let len = self.u8(what)? as usize;
        self.take(len, what).map(|_| ())
    }

    fn skip_u16_prefixed(&mut self, what: &'static str) -> Result<(), ParseError> {
        let len = self.u16(what)? as usize;
        self.take(len, what).map(|_| ())
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Parses the Client Hello at the start of `buf`.
///
/// Returns `Ok(None)` until the whole first record is buffered.
pub fn parse_client_hello(buf: &[u8]) -> Result<Option<ClientHello>, ParseError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }

    if buf[0] & 0x80 != 0 && buf[2] == HANDSHAKE_CLIENT_HELLO {
        return Err(ParseError::SslV2Hello);
    }
    if buf[0] != CONTENT_HANDSHAKE {
        return Err(ParseError::MalformedTls("not a handshake record"));
    }
    if buf[1] != 3 {
        return Err(ParseError::MalformedTls("unsupported record version"));
    }

    let body_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if body_len == 0 || body_len > MAX_RECORD_LEN {
        return Err(ParseError::MalformedTls("record length out of range"));
    }

    if let Some(&kind) = buf.get(RECORD_HEADER_LEN)
        && kind != HANDSHAKE_CLIENT_HELLO
    {
        return Err(ParseError::NotClientHello);
    }

    let record_len = RECORD_HEADER_LEN + body_len;
    if buf.len() < record_len {
        return Ok(None);
    }

    let sni = find_server_name(&buf[RECORD_HEADER_LEN..record_len])?;
    Ok(Some(ClientHello { sni, record_len }))
}

fn find_server_name(record: &[u8]) -> Result<Option<String>, ParseError> {
    let mut r = Reader::new(record);

    r.u8("handshake type")?;
    let hello_len = r.u24("handshake length")?;

    // A hello fragmented over several records is inspected only as far as
    // the first record reaches; running out of bytes there means no SNI.
    let available = record.len() - r.pos;
    let body = r.take(hello_len.min(available), "hello body")?;

    match server_name_from_hello(body) {
        Err(ParseError::MalformedTls(_)) if hello_len > available => Ok(None),
        found => found,
    }
}

fn server_name_from_hello(body: &[u8]) -> Result<Option<String>, ParseError> {
    let mut r = Reader::new(body);

    r.take(2, "client version")?;
    r.take(32, "random")?;
    r.skip_u8_prefixed("session id")?;
    r.skip_u16_prefixed("cipher suites")?;
    r.skip_u8_prefixed("compression methods")?;

    if r.is_empty() {
        return Ok(None);
    }

    let ext_len = r.u16("extensions length")? as usize;
    let mut exts = Reader::new(r.take(ext_len, "extensions")?);

    while !exts.is_empty() {
        let kind = exts.u16("extension type")?;
        let len = exts.u16("extension length")? as usize;
        let data = exts.take(len, "extension data")?;

        if kind == EXTENSION_SERVER_NAME {
            return server_name_from_extension(data);
        }
    }

    Ok(None)
}

fn server_name_from_extension(data: &[u8]) -> Result<Option<String>, ParseError> {
    let mut r = Reader::new(data);
    let list_len = r.u16("server name list length")? as usize;
    let mut list = Reader::new(r.take(list_len, "server name list")?);

    while !list.is_empty() {
        let name_type = list.u8("server name type")?;
        let len = list.u16("server name length")? as usize;
        let name = list.take(len, "server name")?;

        if name_type == NAME_TYPE_HOST {
            let host = std::str::from_utf8(name)
                .map_err(|_| ParseError::MalformedTls("server name is not text"))?;
            return Ok(Some(host.to_ascii_lowercase()));
        }
    }

    Ok(None)
}

/// Builds a minimal Client Hello record, optionally carrying SNI.
#[cfg(test)]
pub(crate) fn sample_hello(sni: Option<&str>) -> Vec<u8> {
    let mut exts = Vec::new();
    if let Some(host) = sni {
        let name = host.as_bytes();
        let mut entry = vec![NAME_TYPE_HOST];
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);

        let mut data = (entry.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&entry);

        exts.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        exts.extend_from_slice(&(data.len() as u16).to_be_bytes());
        exts.extend_from_slice(&data);
    }
    // An unrelated extension (supported_versions) after SNI.
    exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[0xab; 32]);
    hello.push(0);
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    hello.extend_from_slice(&exts);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![CONTENT_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
