//! Reactor core and event handling.
//!
//! The reactor owns every socket the proxy touches and drives them from a
//! single thread:
//! - accepting front-end connections and decoding their messages,
//! - handing complete messages to the decision provider,
//! - opening upstreams and relaying with backpressure,
//! - reaping idle connections.
//!
//! Readiness comes from the [`poller`], which sorts sockets into named
//! interest sets so a handler can be suspended without being forgotten.

mod core;
mod exchange;
mod timer;

pub mod poller;

pub use core::{
    ACCEPT, OPENING_DOWNLOAD, READ_CLIENT, READ_DOWNLOAD, Reactor, ReactorHandle, WRITE_CLIENT,
    WRITE_DOWNLOAD,
};
