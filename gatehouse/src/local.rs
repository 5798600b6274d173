//! Locally served content for `serve-local` and `rewrite` decisions.

use crate::response::{Response, reason};

/// Renders a page the proxy answers with itself.
pub trait LocalContent: Send {
    fn render(&self, code: u16, resource: &str, args: &str) -> Response;
}

/// Built-in pages compiled into the binary.
///
/// Resources are looked up by name; unknown names fall back to a generic
/// page for the requested status.
#[derive(Debug, Default, Clone)]
pub struct BuiltinPages;

impl LocalContent for BuiltinPages {
    fn render(&self, code: u16, resource: &str, args: &str) -> Response {
        let name = resource.trim_start_matches('/');

        match name {
            "blocked" | "blocked.html" => Response::error(
                code,
                &format!("Access to this site is blocked by policy. {args}"),
            ),
            "robots.txt" => Response::new(code).body(
                "text/plain; charset=utf-8",
                "User-agent: *\nDisallow: /\n",
            ),
            "empty.gif" => Response::new(code).body("image/gif", EMPTY_GIF),
            _ => Response::error(code, reason(code)),
        }
    }
}

/// 1x1 transparent GIF.
const EMPTY_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];
