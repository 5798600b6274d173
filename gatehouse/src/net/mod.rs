//! Sockets the reactor drives: front-end listeners and outbound
//! upstream connections.

mod listener;

pub use listener::Listener;

use crate::reactor::poller::unix::{domain_of, sys_close, sys_connect, sys_socket};

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Starts a non-blocking connect to `addr`.
///
/// Returns the socket and whether the connection is already established;
/// otherwise completion is signalled by writability.
pub fn connect(addr: &SocketAddr) -> io::Result<(RawFd, bool)> {
    let fd = sys_socket(domain_of(addr))?;

    match sys_connect(fd, addr) {
        Ok(connected) => Ok((fd, connected)),
        Err(e) => {
            sys_close(fd);
            Err(e)
        }
    }
}
