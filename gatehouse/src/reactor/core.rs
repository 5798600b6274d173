use super::exchange::{Exchange, Stage};
use super::poller::unix::{sys_ignore_sigpipe, sys_take_error};
use super::poller::{Interest, Poller, SetName, Waker};
use super::timer::IdleTimers;
use crate::config::{Config, ReactorConfig};
use crate::connection::{ConnId, Connection, Fill, Role, WriteOutcome};
use crate::decision::{Decision, DecisionProvider, Dispatcher, Unavailable};
use crate::error::{Error, Result};
use crate::local::{BuiltinPages, LocalContent};
use crate::net::Listener;
use crate::protocol::{Decoded, Decoder, SourceKind};
use crate::relay::{CorkChange, Direction, Relay};
use crate::resolve::{Resolution, Resolver, ThreadedResolver};
use crate::stats::Stats;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Listening sockets.
pub const ACCEPT: SetName = "accept";
/// Front-end sockets, read side.
pub const READ_CLIENT: SetName = "read_client";
/// Front-end sockets with buffered output.
pub const WRITE_CLIENT: SetName = "write_client";
/// Upstream sockets, read side.
pub const READ_DOWNLOAD: SetName = "read_download";
/// Upstream sockets with buffered output.
pub const WRITE_DOWNLOAD: SetName = "write_download";
/// Upstream sockets with a connect in progress.
pub const OPENING_DOWNLOAD: SetName = "opening_download";

/// How long a listener stays corked after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const SETS: [(SetName, Interest); 6] = [
    (ACCEPT, Interest::READ),
    (READ_CLIENT, Interest::READ),
    (WRITE_CLIENT, Interest::WRITE),
    (READ_DOWNLOAD, Interest::READ),
    (WRITE_DOWNLOAD, Interest::WRITE),
    (OPENING_DOWNLOAD, Interest::WRITE),
];

/// Stops a running [`Reactor`] from another thread.
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Asks the loop to close every connection and return.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// The event loop.
///
/// One reactor owns every listener, connection and relay, and runs on a
/// single thread. Collaborators (decision provider, resolver) live on
/// their own threads and reach the loop only through their queues and
/// the poller's [`Waker`].
pub struct Reactor {
    pub(super) config: ReactorConfig,
    pub(super) poller: Poller,

    pub(super) listeners: HashMap<RawFd, Listener>,
    pub(super) conns: HashMap<ConnId, Connection>,
    pub(super) by_fd: HashMap<RawFd, ConnId>,

    /// Per front-end connection.
    pub(super) exchanges: HashMap<ConnId, Exchange>,

    /// Keyed by the front-end connection.
    pub(super) relays: HashMap<ConnId, Relay>,

    pub(super) dispatcher: Dispatcher,
    pub(super) resolver: Box<dyn Resolver>,
    pub(super) local: Box<dyn LocalContent>,

    pub(super) timers: IdleTimers,
    pub(super) stats: Stats,

    next_id: ConnId,
    stop: Arc<AtomicBool>,

    /// Connections whose poller registration failed this turn.
    broken: Vec<ConnId>,

    /// Listeners corked after an accept error, and when to retry them.
    paused: Vec<RawFd>,
    accept_resume: Option<Instant>,

    decided: Vec<(ConnId, Decision)>,
    resolved: Vec<Resolution>,
}

impl Reactor {
    /// Binds every configured listener and starts the default resolver.
    ///
    /// Without [`with_decision_provider`](Self::with_decision_provider)
    /// every request is answered with a server error.
    pub fn new(config: Config) -> Result<Self> {
        sys_ignore_sigpipe();

        let mut poller = Poller::new(config.reactor.backend, config.reactor.max_events)?;
        for (name, interest) in SETS {
            poller.define_set(name, interest);
        }

        let mut listeners = HashMap::new();
        for listener in config.listeners {
            let address = listener.address;
            let listener = Listener::bind(listener).map_err(|source| Error::Bind {
                address: address.to_string(),
                source,
            })?;

            poller.watch(ACCEPT, listener.fd())?;
            info!(
                address = %listener.local_addr(),
                kind = ?listener.config().kind,
                "listening"
            );
            listeners.insert(listener.fd(), listener);
        }

        let resolver = ThreadedResolver::spawn(config.resolver.workers, poller.waker())?;

        Ok(Self {
            timers: IdleTimers::new(config.reactor.idle_timeout()),
            config: config.reactor,
            poller,
            listeners,
            conns: HashMap::new(),
            by_fd: HashMap::new(),
            exchanges: HashMap::new(),
            relays: HashMap::new(),
            dispatcher: Dispatcher::new(Box::new(Unavailable::default())),
            resolver: Box::new(resolver),
            local: Box::new(BuiltinPages),
            stats: Stats::default(),
            next_id: 1,
            stop: Arc::new(AtomicBool::new(false)),
            broken: Vec::new(),
            paused: Vec::new(),
            accept_resume: None,
            decided: Vec::new(),
            resolved: Vec::new(),
        })
    }

    pub fn with_decision_provider(mut self, provider: Box<dyn DecisionProvider>) -> Self {
        self.dispatcher = Dispatcher::new(provider);
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_local_content(mut self, local: Box<dyn LocalContent>) -> Self {
        self.local = local;
        self
    }

    /// Handle collaborators use to interrupt a blocking poll.
    pub fn waker(&self) -> Arc<Waker> {
        self.poller.waker()
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            stop: self.stop.clone(),
            waker: self.poller.waker(),
        }
    }

    /// Bound address of every listener, with its protocol.
    pub fn listener_addrs(&self) -> Vec<(SourceKind, SocketAddr)> {
        let mut addrs: Vec<_> = self
            .listeners
            .values()
            .map(|l| (l.config().kind, l.local_addr()))
            .collect();
        addrs.sort_by_key(|&(_, addr)| addr);
        addrs
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Runs until [`ReactorHandle::shutdown`] is called.
    pub fn run(&mut self) -> Result<()> {
        info!(listeners = self.listeners.len(), "reactor started");

        while !self.stop.load(Ordering::Acquire) {
            self.turn(None)?;
        }

        self.shutdown_all();
        Ok(())
    }

    /// One poll and the dispatch of everything it reported.
    ///
    /// Waits at most `max_wait` (forever when `None`), shortened to the
    /// next idle deadline.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let timeout = [self.timers.next_deadline(), self.accept_resume]
            .into_iter()
            .flatten()
            .map(|deadline| deadline.saturating_duration_since(now))
            .chain(max_wait)
            .min();

        let ready = self.poller.poll(timeout)?;

        for fault in ready.faults() {
            error!(%fault, "poller fault");
        }

        for &fd in ready.get(OPENING_DOWNLOAD) {
            if let Some(id) = self.still_ready(OPENING_DOWNLOAD, fd) {
                self.on_connected(id);
            }
        }
        for &fd in ready.get(READ_CLIENT) {
            if let Some(id) = self.still_ready(READ_CLIENT, fd) {
                self.on_readable(id);
            }
        }
        for &fd in ready.get(READ_DOWNLOAD) {
            if let Some(id) = self.still_ready(READ_DOWNLOAD, fd) {
                self.on_readable(id);
            }
        }
        for &fd in ready.get(WRITE_CLIENT) {
            if let Some(id) = self.still_ready(WRITE_CLIENT, fd) {
                self.write_to(id, &[]);
            }
        }
        for &fd in ready.get(WRITE_DOWNLOAD) {
            if let Some(id) = self.still_ready(WRITE_DOWNLOAD, fd) {
                self.write_to(id, &[]);
            }
        }

        // New sockets are only created after every reported descriptor has
        // been dispatched, so a reused descriptor never sees a stale event.
        for &fd in ready.get(ACCEPT) {
            self.on_accept(fd);
        }
        self.resume_accept();

        // Routing a decision can start a resolution and a resolution can
        // release the next pipelined message; settle both before polling.
        while self.process_decisions() | self.process_resolutions() {}
        self.reap_idle();
        self.drop_broken();

        Ok(())
    }

    /// The connection behind `fd`, if an earlier handler in this batch did
    /// not close it or take it out of `set`.
    fn still_ready(&self, set: SetName, fd: RawFd) -> Option<ConnId> {
        if !self.poller.is_watched(set, fd) || self.poller.is_corked(set, fd) {
            return None;
        }
        self.by_fd.get(&fd).copied()
    }

    fn on_accept(&mut self, fd: RawFd) {
        loop {
            let Some(listener) = self.listeners.get(&fd) else {
                return;
            };

            let (client, peer) = match listener.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    // The pending connection stays queued, so the listener
                    // would report ready again straight away.
                    warn!(error = %e, "accept failed, pausing listener");
                    self.pause_accept(fd);
                    return;
                }
            };

            let local = listener.local_addr();
            let config = listener.config();
            let decoder = Decoder::new(
                config.kind,
                config.proxy_protocol,
                self.config.max_header_size,
            );
            let exchange = Exchange::new(config);

            let id = self.allocate_id();
            let conn = Connection::front(id, client, peer, local, decoder);
            debug!(conn = id, %peer, kind = ?conn.kind(), "accepted");

            self.stats.accepted += 1;
            self.stats.active += 1;
            self.timers.schedule(id, conn.last_active());
            self.by_fd.insert(client, id);
            self.conns.insert(id, conn);
            self.exchanges.insert(id, exchange);

            self.watch(READ_CLIENT, id);

            // Passthrough listeners announce the connection without
            // waiting for bytes.
            self.advance(id);
        }
    }

    pub(super) fn pause_accept(&mut self, fd: RawFd) {
        if let Err(e) = self.poller.cork(ACCEPT, fd) {
            error!(error = %e, "failed to pause listener");
            return;
        }
        if !self.paused.contains(&fd) {
            self.paused.push(fd);
        }
        self.accept_resume
            .get_or_insert_with(|| Instant::now() + ACCEPT_BACKOFF);
    }

    fn resume_accept(&mut self) {
        match self.accept_resume {
            Some(deadline) if deadline <= Instant::now() => {}
            _ => return,
        }
        self.accept_resume = None;

        for fd in std::mem::take(&mut self.paused) {
            if let Err(e) = self.poller.uncork(ACCEPT, fd) {
                error!(error = %e, "failed to resume listener");
            }
        }
    }

    pub(super) fn allocate_id(&mut self) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn on_readable(&mut self, id: ConnId) {
        let read_chunk = self.config.read_chunk;
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let role = conn.role();

        match conn.fill(read_chunk) {
            Fill::Read(_) if role == Role::Front => self.advance(id),
            Fill::Read(_) => {
                let bytes = conn.take_input();
                self.relay_downstream(id, bytes);
            }
            Fill::WouldBlock => {}
            Fill::Eof => {
                debug!(conn = id, ?role, "peer closed");
                self.wind_down(id);
            }
            Fill::Failed(e) => {
                debug!(conn = id, ?role, error = %e, "read failed");
                self.wind_down(id);
            }
        }
    }

    /// Drives the front-end decoder over everything buffered.
    pub(super) fn advance(&mut self, id: ConnId) {
        loop {
            if self.conns.get(&id).is_none_or(Connection::is_finishing) {
                return;
            }
            if self.awaiting_response(id) {
                break;
            }

            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            match conn.decode() {
                Ok(Decoded::NeedMore) => break,
                Ok(Decoded::ProxyHeader(header)) => {
                    debug!(conn = id, source = ?header.source, "PROXY header");
                }
                Ok(Decoded::Message(message)) => self.on_message(id, message),
                Ok(Decoded::Body(bytes)) => self.forward_body(id, bytes),
                Ok(Decoded::Complete) => {
                    if let Some(exchange) = self.exchanges.get_mut(&id) {
                        exchange.stage = Stage::AwaitingHeader;
                    }
                }
                Err(e) => {
                    self.on_violation(id, e);
                    return;
                }
            }
        }

        self.sync_read_cork(id);
    }

    fn forward_body(&mut self, front: ConnId, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }

        // Encapsulated ICAP bodies are consumed, never forwarded.
        let Some(conn) = self.conns.get(&front) else {
            return;
        };
        if conn.kind() == SourceKind::Icap {
            return;
        }

        let Some(relay) = self.relays.get_mut(&front) else {
            return;
        };
        relay.count(Direction::Upstream, bytes.len());
        self.stats
            .count_bytes(relay.family(), Direction::Upstream, bytes.len());

        let upstream = relay.upstream();
        self.write_to(upstream, &bytes);
    }

    fn relay_downstream(&mut self, upstream: ConnId, bytes: Vec<u8>) {
        let Some(front) = self.conns.get(&upstream).and_then(Connection::link) else {
            self.close(upstream);
            return;
        };

        let mut answered = false;
        if let Some(relay) = self.relays.get_mut(&front) {
            relay.count(Direction::Downstream, bytes.len());
            self.stats
                .count_bytes(relay.family(), Direction::Downstream, bytes.len());
            answered = relay.observe_response(&bytes);
        }

        self.write_to(front, &bytes);

        // The next pipelined request was left undecoded until now.
        if answered {
            self.advance(front);
        }
    }

    /// A new request head is not decoded while the previous request's
    /// response is still arriving from the upstream.
    pub(super) fn awaiting_response(&self, front: ConnId) -> bool {
        self.conns
            .get(&front)
            .and_then(Connection::decoder)
            .is_some_and(Decoder::is_idle)
            && self
                .relays
                .get(&front)
                .is_some_and(Relay::response_in_flight)
    }

    /// Write step plus the cork bookkeeping it implies.
    pub(super) fn write_to(&mut self, id: ConnId, data: &[u8]) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let role = conn.role();
        let link = conn.link();

        let (write_set, relay_key, direction) = match role {
            Role::Front => (WRITE_CLIENT, Some(id), Direction::Downstream),
            Role::Upstream => (WRITE_DOWNLOAD, link, Direction::Upstream),
        };

        match conn.write_step(data) {
            WriteOutcome::Progress {
                had_buffer,
                now_buffered,
            } => {
                if now_buffered {
                    self.watch(write_set, id);
                } else {
                    self.unwatch(write_set, id);
                }

                let change = relay_key
                    .and_then(|key| self.relays.get_mut(&key))
                    .filter(|relay| relay.front() == id || relay.upstream() == id)
                    .and_then(|relay| {
                        let change = relay.note(direction, had_buffer, now_buffered)?;
                        Some((change, relay.front(), relay.upstream()))
                    });

                match change {
                    Some((_, front, _)) if direction == Direction::Upstream => {
                        self.sync_read_cork(front);
                    }
                    Some((CorkChange::Cork, _, upstream)) => self.cork(READ_DOWNLOAD, upstream),
                    Some((CorkChange::Uncork, _, upstream)) => {
                        self.uncork(READ_DOWNLOAD, upstream)
                    }
                    None => {}
                }
            }
            WriteOutcome::Finished => {
                debug!(conn = id, ?role, "drained, closing");
                self.close(id);
            }
            WriteOutcome::Failed(e) => {
                debug!(conn = id, ?role, error = %e, "write failed");
                self.close(id);
            }
        }
    }

    /// Corks the front-end read side while its message awaits a decision,
    /// its upstream has unsent bytes or the previous response is still
    /// arriving; uncorks it otherwise.
    pub(super) fn sync_read_cork(&mut self, front: ConnId) {
        let Some(conn) = self.conns.get(&front) else {
            return;
        };
        if conn.is_finishing() {
            return;
        }

        let held = conn.decoder().is_some_and(Decoder::is_held);
        let backpressure = self
            .relays
            .get(&front)
            .is_some_and(|relay| relay.is_corked(Direction::Upstream));

        if held || backpressure || self.awaiting_response(front) {
            self.cork(READ_CLIENT, front);
        } else {
            self.uncork(READ_CLIENT, front);
        }
    }

    fn on_connected(&mut self, upstream: ConnId) {
        self.unwatch(OPENING_DOWNLOAD, upstream);

        let Some(conn) = self.conns.get(&upstream) else {
            return;
        };
        let fd = conn.fd();
        let Some(front) = conn.link() else {
            self.close(upstream);
            return;
        };

        match sys_take_error(fd) {
            Ok(()) => self.start_relay(front, upstream),
            Err(e) => {
                warn!(conn = front, upstream = %conn.peer(), error = %e, "upstream connect failed");
                self.upstream_failed(front);
            }
        }
    }

    /// Ends the relay around `id`: neither side reads any more, and each
    /// closes once its buffered output is delivered.
    pub(super) fn wind_down(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.is_finishing() {
            return;
        }

        conn.finish();
        let role = conn.role();
        let link = conn.link();

        match role {
            Role::Front => {
                self.unwatch(READ_CLIENT, id);
                self.dispatcher.cancel(id);
            }
            Role::Upstream => {
                self.unwatch(READ_DOWNLOAD, id);
                self.unwatch(OPENING_DOWNLOAD, id);
            }
        }

        if let Some(peer) = link {
            self.wind_down(peer);
        }

        self.write_to(id, &[]);
    }

    /// Closes `id` now, winding down its relay partner.
    ///
    /// Idempotent: the socket leaves every interest set and is closed
    /// exactly once.
    pub(super) fn close(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };

        let fd = conn.fd();
        self.poller.forget(fd);
        self.by_fd.remove(&fd);

        let relay_key = match conn.role() {
            Role::Front => {
                self.stats.active = self.stats.active.saturating_sub(1);
                self.dispatcher.cancel(id);
                self.exchanges.remove(&id);
                Some(id)
            }
            Role::Upstream => conn.link(),
        };

        if let Some(key) = relay_key
            && self
                .relays
                .get(&key)
                .is_some_and(|relay| relay.front() == id || relay.upstream() == id)
            && let Some(relay) = self.relays.remove(&key)
        {
            debug!(
                front = relay.front(),
                upstream = relay.upstream(),
                sent = relay.bytes(Direction::Upstream),
                received = relay.bytes(Direction::Downstream),
                exchanges = relay.exchanges(),
                "relay closed"
            );
        }

        debug!(conn = id, role = ?conn.role(), "closed");
        let partner = conn.link();
        drop(conn);

        if let Some(partner) = partner {
            self.wind_down(partner);
        }
    }

    /// Hard-closes a connection and its partner.
    pub(super) fn terminate(&mut self, id: ConnId) {
        let partner = self.conns.get(&id).and_then(Connection::link);
        self.close(id);
        if let Some(partner) = partner {
            self.close(partner);
        }
    }

    /// Routes every decision that is ready. Returns whether there was any.
    fn process_decisions(&mut self) -> bool {
        let mut decided = std::mem::take(&mut self.decided);
        let mut progressed = false;

        while self.dispatcher.collect(&mut decided) {
            progressed = true;
            for (conn, decision) in decided.drain(..) {
                self.on_decision(conn, decision);
            }
        }

        self.decided = decided;
        progressed
    }

    fn process_resolutions(&mut self) -> bool {
        let mut resolved = std::mem::take(&mut self.resolved);
        self.resolver.poll_resolved(&mut resolved);
        let progressed = !resolved.is_empty();

        for resolution in resolved.drain(..) {
            self.on_resolved(resolution);
        }

        self.resolved = resolved;
        progressed
    }

    fn reap_idle(&mut self) {
        let Some(timeout) = self.timers.timeout() else {
            return;
        };

        let now = Instant::now();
        for id in self.timers.expired(now) {
            let Some(conn) = self.conns.get(&id) else {
                continue;
            };

            let last_active = conn.last_active();
            if now.saturating_duration_since(last_active) < timeout {
                self.timers.schedule(id, last_active);
                continue;
            }

            // A relay is only idle when both of its sides are.
            if let Some(partner) = conn.link().and_then(|p| self.conns.get(&p))
                && now.saturating_duration_since(partner.last_active()) < timeout
            {
                self.timers.schedule(id, partner.last_active());
                continue;
            }

            debug!(conn = id, idle = ?timeout, "idle timeout");
            self.stats.idle_reaped += 1;
            self.terminate(id);
        }
    }

    fn drop_broken(&mut self) {
        for id in std::mem::take(&mut self.broken) {
            self.terminate(id);
        }
    }

    fn shutdown_all(&mut self) {
        info!(
            connections = self.conns.len(),
            "reactor stopping, closing everything"
        );

        for (name, _) in SETS {
            if let Err(e) = self.poller.clear(name) {
                error!(set = name, error = %e, "failed to clear interest set");
            }
        }

        for (_, conn) in self.conns.drain() {
            self.poller.forget(conn.fd());
        }
        for (fd, _) in self.listeners.drain() {
            self.poller.forget(fd);
        }

        self.by_fd.clear();
        self.exchanges.clear();
        self.relays.clear();
        self.timers.clear();
        self.stats.active = 0;
    }

    pub(super) fn watch(&mut self, set: SetName, id: ConnId) {
        self.update_interest(set, id, Poller::watch);
    }

    pub(super) fn unwatch(&mut self, set: SetName, id: ConnId) {
        self.update_interest(set, id, Poller::unwatch);
    }

    fn cork(&mut self, set: SetName, id: ConnId) {
        self.update_interest(set, id, Poller::cork);
    }

    fn uncork(&mut self, set: SetName, id: ConnId) {
        self.update_interest(set, id, Poller::uncork);
    }

    /// Applies a poller operation to a connection's socket. A failure is
    /// fatal to that connection only; it is closed at the end of the turn.
    fn update_interest(
        &mut self,
        set: SetName,
        id: ConnId,
        op: fn(&mut Poller, SetName, RawFd) -> std::result::Result<(), crate::error::PollerError>,
    ) {
        let Some(fd) = self.conns.get(&id).map(Connection::fd) else {
            return;
        };

        if let Err(e) = op(&mut self.poller, set, fd) {
            error!(conn = id, set, error = %e, "poller update failed");
            self.broken.push(id);
        }
    }
}
