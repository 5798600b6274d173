//! Error types shared across the engine.
//!
//! The reactor never propagates these across connection boundaries:
//! a [`ParseError`] terminates the connection it was raised on, a
//! [`PollerError`] is logged, and only startup failures bubble up as
//! [`Error`].

use std::io;

/// A protocol violation found in an untrusted byte stream.
///
/// Parse errors are never retryable. Feeding more bytes to a decoder
/// after it returned one of these is meaningless.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("header exceeds {limit} bytes without a terminating blank line")]
    HeaderTooLarge { limit: usize },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported request: {0}")]
    Unsupported(String),

    #[error("chunk size line is not hexadecimal")]
    InvalidChunkSize,

    #[error("chunk of {size} bytes exceeds the {limit} byte ceiling")]
    ChunkTooLarge { size: u64, limit: u64 },

    #[error("chunk data is not followed by a line ending")]
    MissingChunkTerminator,

    #[error("malformed TLS record: {0}")]
    MalformedTls(&'static str),

    #[error("SSLv2-compatible client hello is not supported")]
    SslV2Hello,

    #[error("handshake message is not a client hello")]
    NotClientHello,

    #[error("expected a PROXY protocol header")]
    MissingProxyHeader,

    #[error("malformed PROXY protocol header: {0}")]
    MalformedProxyHeader(&'static str),

    #[error("malformed ICAP encapsulation: {0}")]
    MalformedEncapsulation(String),
}

impl ParseError {
    /// HTTP status used when the front-end protocol allows a reply.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::HeaderTooLarge { .. } => 431,
            ParseError::Unsupported(_) => 501,
            _ => 400,
        }
    }
}

/// Failures inside the readiness multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("interest set `{0}` was never defined")]
    UnknownSet(&'static str),

    #[error("backend reported token {0} with no socket mapped to it")]
    Unmapped(u64),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", .0.join(", "))]
    Validation(Vec<String>),
}

/// Crate-level error for setup paths (binding listeners, building the
/// poller, spawning collaborator threads).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
