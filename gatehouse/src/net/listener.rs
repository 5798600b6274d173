use crate::config::ListenerConfig;
use crate::reactor::poller::unix::{
    domain_of, sys_accept, sys_bind, sys_close, sys_enable_dual_stack, sys_listen,
    sys_set_reuseaddr, sys_socket, sys_sockname,
};

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

const BACKLOG: i32 = 1024;

/// A non-blocking listening socket for one configured front-end.
///
/// The listener keeps the configuration it was bound from so accepted
/// connections can be tagged with its protocol and options.
#[derive(Debug)]
pub struct Listener {
    /// File descriptor of the listening socket.
    fd: RawFd,

    local: SocketAddr,
    config: ListenerConfig,
}

impl Listener {
    /// Binds and starts listening.
    ///
    /// The socket is non-blocking with `SO_REUSEADDR` set, and IPv6
    /// listeners accept IPv4-mapped peers as well.
    pub fn bind(config: ListenerConfig) -> io::Result<Self> {
        let domain = domain_of(&config.address);
        let fd = sys_socket(domain)?;

        let setup = || -> io::Result<SocketAddr> {
            sys_set_reuseaddr(fd)?;
            sys_enable_dual_stack(fd, domain)?;
            sys_bind(fd, &config.address)?;
            sys_listen(fd, BACKLOG)?;
            sys_sockname(fd)
        };

        match setup() {
            Ok(local) => Ok(Self { fd, local, config }),
            Err(e) => {
                sys_close(fd);
                Err(e)
            }
        }
    }

    /// Accepts one pending connection, `None` once the backlog is empty.
    pub fn accept(&self) -> io::Result<Option<(RawFd, SocketAddr)>> {
        match sys_accept(self.fd) {
            Ok(accepted) => Ok(Some(accepted)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Address actually bound, with the kernel-chosen port for `:0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        sys_close(self.fd);
    }
}
