//! Hostname resolution off the reactor thread.

use crate::connection::ConnId;
use crate::reactor::poller::Waker;

use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::mpsc::{Receiver, SendError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Resolution {
    pub conn: ConnId,
    pub host: String,
    pub result: io::Result<IpAddr>,
}

/// An asynchronous name resolver.
///
/// Implementations must wake the reactor's poller when a resolution
/// becomes available.
pub trait Resolver: Send {
    fn submit(&mut self, conn: ConnId, host: String);
    fn poll_resolved(&mut self, out: &mut Vec<Resolution>);
}

struct Query {
    conn: ConnId,
    host: String,
}

/// Resolves through the system resolver on a small thread pool.
pub struct ThreadedResolver {
    queries: Option<Sender<Query>>,
    results: Receiver<Resolution>,
    workers: Vec<JoinHandle<()>>,

    /// Queries no worker could take.
    rejected: Vec<Resolution>,
}

impl ThreadedResolver {
    pub fn spawn(workers: usize, waker: Arc<Waker>) -> io::Result<Self> {
        let (query_tx, query_rx) = channel::<Query>();
        let (result_tx, result_rx) = channel();
        let query_rx = Arc::new(Mutex::new(query_rx));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers.max(1) {
            let queries = query_rx.clone();
            let results = result_tx.clone();
            let waker = waker.clone();

            let handle = thread::Builder::new()
                .name(format!("gatehouse-resolver-{index}"))
                .spawn(move || resolver_loop(queries, results, waker))?;
            handles.push(handle);
        }

        Ok(Self {
            queries: Some(query_tx),
            results: result_rx,
            workers: handles,
            rejected: Vec::new(),
        })
    }
}

fn resolver_loop(queries: Arc<Mutex<Receiver<Query>>>, results: Sender<Resolution>, waker: Arc<Waker>) {
    loop {
        let query = {
            let Ok(queries) = queries.lock() else {
                return;
            };
            match queries.recv() {
                Ok(query) => query,
                Err(_) => return,
            }
        };

        let result = lookup(&query.host);
        debug!(host = %query.host, ok = result.is_ok(), "resolved");

        let resolution = Resolution {
            conn: query.conn,
            host: query.host,
            result,
        };
        if results.send(resolution).is_err() {
            return;
        }
        waker.wake();
    }
}

/// First address the system resolver returns, IPv4 preferred.
fn lookup(host: &str) -> io::Result<IpAddr> {
    let addrs: Vec<IpAddr> = (host, 0).to_socket_addrs()?.map(|a| a.ip()).collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
}

impl ThreadedResolver {
    /// Fails a query locally; it surfaces on the next poll.
    fn reject(&mut self, query: Query) {
        warn!(conn = query.conn, host = %query.host, "resolver workers are gone");
        self.rejected.push(Resolution {
            conn: query.conn,
            host: query.host,
            result: Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "resolver unavailable",
            )),
        });
    }
}

impl Resolver for ThreadedResolver {
    fn submit(&mut self, conn: ConnId, host: String) {
        let query = Query { conn, host };
        let Some(queries) = &self.queries else {
            self.reject(query);
            return;
        };

        if let Err(SendError(query)) = queries.send(query) {
            self.reject(query);
        }
    }

    fn poll_resolved(&mut self, out: &mut Vec<Resolution>) {
        out.append(&mut self.rejected);
        out.extend(self.results.try_iter());
    }
}

impl Drop for ThreadedResolver {
    fn drop(&mut self) {
        // Closing the query channel stops the workers once they finish
        // their current lookup.
        self.queries.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
