//! Small data structures shared by the poller and the reactor.
//!
//! [`Slab`] provides indexed storage with reuse of freed slots; the epoll
//! backend keys its kernel tokens on it.

mod slab;

pub use slab::Slab;
