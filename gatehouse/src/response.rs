//! Responses the proxy synthesizes itself.

use std::fmt::Write as _;

/// Line sent back for a permitted `CONNECT`.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Canonical reason phrase, shared by HTTP and ICAP.
pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.header("Content-Type", content_type)
    }

    /// Plain error page for `status`.
    pub fn error(status: u16, detail: &str) -> Self {
        let page = format!(
            "<html><head><title>{status} {reason}</title></head>\
             <body><h1>{status} {reason}</h1><p>{detail}</p></body></html>\n",
            reason = reason(status),
            detail = escape(detail),
        );
        Response::new(status).body("text/html; charset=utf-8", page)
    }

    pub fn redirect(url: &str) -> Self {
        Response::new(302).header("Location", url)
    }

    pub fn inline(status: u16, body: &str) -> Self {
        Response::new(status).body("text/plain; charset=utf-8", body.as_bytes())
    }

    pub fn json(body: Vec<u8>) -> Self {
        Response::new(200).body("application/json", body)
    }

    /// Status line and headers, terminated by the blank line.
    ///
    /// Synthesized responses always close the connection.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        let _ = write!(
            head,
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        );
        head.into_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = self.head_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_bytes() {
        let bytes = Response::redirect("http://blocked.test/").into_bytes();
        assert_eq!(
            bytes,
            b"HTTP/1.1 302 Found\r\nLocation: http://blocked.test/\r\n\
              Content-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_error_page_escapes_detail() {
        let response = Response::error(400, "<bad>");
        let text = String::from_utf8(response.into_bytes()).unwrap();

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("&lt;bad&gt;"));
        assert!(!text.contains("<bad>"));
    }

    #[test]
    fn test_content_length_matches_body() {
        let response = Response::inline(403, "denied");
        let text = String::from_utf8(response.into_bytes()).unwrap();
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\ndenied"));
    }
}
