//! # Gatehouse
//!
//! **Gatehouse** is the connection-handling core of a content-filtering
//! forward proxy. It accepts HTTP proxy, ICAP, TLS and raw passthrough
//! connections, frames each incoming message, asks an external decision
//! provider what to do with it, and then relays, redirects, rewrites or
//! answers locally.
//!
//! Everything runs on one thread around a custom poller. Blocking work
//! (classification, DNS) lives on worker threads and reports back through
//! queues and a wakeup pipe. The engine offers:
//!
//! - **Incremental framing** of HTTP headers, chunked bodies, ICAP
//!   encapsulation, TLS ClientHello and PROXY v1, tolerant of arbitrary
//!   fragmentation
//! - **Named interest sets** with per-socket corking on top of epoll or
//!   `poll(2)`
//! - **Flow-controlled relaying**: a side stops being read while the other
//!   side has unsent bytes
//! - **Keep-alive upstream reuse** and HTTP upgrade / CONNECT tunnelling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gatehouse::config::Config;
//! use gatehouse::policy::PolicyPool;
//! use gatehouse::reactor::Reactor;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("gatehouse.toml")?;
//!     let policy = config.policy.clone();
//!
//!     let reactor = Reactor::new(config)?;
//!     let pool = PolicyPool::spawn(&policy, reactor.waker())?;
//!
//!     reactor.with_decision_provider(Box::new(pool)).run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Incremental decoders for every front-end protocol
//! - [`reactor`]: Event loop, poller and relaying
//! - [`decision`]: Decision provider contract and dispatch
//! - [`resolve`]: Asynchronous name resolution
//! - [`config`]: TOML configuration

mod utils;

pub mod config;
pub mod connection;
pub mod decision;
pub mod error;
pub mod local;
pub mod logging;
pub mod net;
pub mod policy;
pub mod protocol;
pub mod reactor;
pub mod relay;
pub mod resolve;
pub mod response;
pub mod stats;

pub use config::Config;
pub use error::{Error, Result};
pub use reactor::{Reactor, ReactorHandle};
