//! Decision routing: what the reactor does with an adjudicated message.

use super::core::{OPENING_DOWNLOAD, READ_DOWNLOAD, Reactor};
use crate::config::ListenerConfig;
use crate::connection::{ConnId, Connection};
use crate::decision::{Decision, DecisionRequest};
use crate::error::ParseError;
use crate::net;
use crate::protocol::framing::Expect;
use crate::protocol::http::{self, RequestHead};
use crate::protocol::icap::{self, IcapHead, IcapMethod};
use crate::protocol::{Continuation, Message, Meta, SourceKind};
use crate::reactor::poller::unix::sys_sockname;
use crate::relay::{Family, Relay};
use crate::resolve::Resolution;
use crate::response::{CONNECT_ESTABLISHED, Response};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    AwaitingHeader,
    AwaitingDecision,
    Resolving,
    Opening,
    Relaying,
}

/// State of the message a front-end connection is currently carrying.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) stage: Stage,
    message: Option<Message>,

    target: Option<(String, u16)>,

    /// Sent upstream once the connection is up.
    forward: Vec<u8>,

    /// Sent to the client once the connection is up.
    reply: Vec<u8>,
    continuation: Continuation,
    expect: Expect,

    default_port: u16,
    fixed_upstream: Option<String>,
}

impl Exchange {
    pub(crate) fn new(listener: &ListenerConfig) -> Self {
        Self {
            stage: Stage::AwaitingHeader,
            message: None,
            target: None,
            forward: Vec::new(),
            reply: Vec::new(),
            continuation: Continuation::Body,
            expect: Expect::Opaque,
            default_port: listener.effective_default_port(),
            fixed_upstream: listener.upstream.clone(),
        }
    }
}

impl Reactor {
    pub(super) fn on_message(&mut self, front: ConnId, message: Message) {
        let Some(conn) = self.conns.get_mut(&front) else {
            return;
        };

        // OPTIONS describes the service itself; no adjudication needed.
        if let Meta::Icap(head) = &message.meta
            && head.method == IcapMethod::Options
        {
            debug!(conn = front, service = %head.service, "ICAP OPTIONS");
            if let Some(decoder) = conn.decoder_mut() {
                decoder.release(Continuation::Body);
            }
            self.write_to(front, &icap::options_response());
            return;
        }

        debug!(conn = front, kind = ?conn.kind(), "message held for decision");

        let request = DecisionRequest {
            conn: front,
            accept: conn.local(),
            peer: conn.peer(),
            header: message.header.clone(),
            sub_header: message.sub_header.clone(),
            source: conn.kind(),
            round: 0,
            avoid: None,
        };

        if let Some(exchange) = self.exchanges.get_mut(&front) {
            exchange.stage = Stage::AwaitingDecision;
            exchange.message = Some(message);
        }

        self.dispatcher.submit(request);
    }

    pub(super) fn on_decision(&mut self, front: ConnId, decision: Decision) {
        let Some(exchange) = self.exchanges.get_mut(&front) else {
            return;
        };
        if exchange.stage != Stage::AwaitingDecision {
            return;
        }
        let Some(message) = exchange.message.take() else {
            return;
        };
        let Some(kind) = self.conns.get(&front).map(Connection::kind) else {
            return;
        };

        debug!(conn = front, decision = decision.name(), "decided");
        self.stats.count_decision(decision.name());

        match message.meta {
            Meta::Http(head) => self.route_http(front, kind, &message.header, &head, decision),
            Meta::Icap(head) => self.route_icap(front, &head, &message.sub_header, decision),
            Meta::Tls(hello) => self.route_tunnel(front, hello.sni, decision),
            Meta::Raw => self.route_tunnel(front, None, decision),
        }
    }

    fn route_http(
        &mut self,
        front: ConnId,
        kind: SourceKind,
        raw: &[u8],
        head: &RequestHead,
        decision: Decision,
    ) {
        let default_port = self.default_port(front);

        match decision {
            Decision::Permit { .. } if kind == SourceKind::Web => {
                let body = self.stats.to_json();
                self.respond(front, Response::json(body));
            }
            Decision::Permit {
                host,
                port,
                upgrade_length,
            } => {
                let requested = head.destination(default_port);
                match fill_target(host, port, requested, default_port) {
                    Some((host, port)) => {
                        self.forward_http(front, raw, head, (host, port), None, upgrade_length)
                    }
                    None => self.respond(front, Response::error(400, "no destination")),
                }
            }
            Decision::Intercept { host, port } => {
                let requested = head.destination(default_port);
                match fill_target(host, port, requested, default_port) {
                    Some(target) => self.forward_http(front, raw, head, target, None, 0),
                    None => self.respond(front, Response::error(400, "no destination")),
                }
            }
            Decision::Rewrite { .. } if head.is_connect() => {
                self.respond(front, Response::error(403, "tunnel cannot be rewritten"));
            }
            Decision::Rewrite { path, args } => match head.destination(default_port) {
                Some(target) => {
                    let path = http::rewritten_path(&path, &args);
                    self.forward_http(front, raw, head, target, Some(path), 0);
                }
                None => self.respond(front, Response::error(400, "no destination")),
            },
            Decision::Redirect { url } => self.respond(front, Response::redirect(&url)),
            Decision::ServeLocal { code, resource } => {
                let response = self.local.render(code, &resource, "");
                self.respond(front, response);
            }
            Decision::ServeInline { code, body } => {
                self.respond(front, Response::inline(code, &body))
            }
            Decision::Close => self.terminate(front),
            Decision::Requeue | Decision::Defer => {
                self.respond(front, Response::error(500, "no decision reached"))
            }
        }
    }

    fn forward_http(
        &mut self,
        front: ConnId,
        raw: &[u8],
        head: &RequestHead,
        target: (String, u16),
        path: Option<String>,
        upgrade_length: u64,
    ) {
        if head.is_connect() {
            self.connect_upstream(
                front,
                target,
                Vec::new(),
                CONNECT_ESTABLISHED.to_vec(),
                Continuation::Tunnel,
                Expect::Opaque,
            );
            return;
        }

        let forward = http::forward_head(raw, head, path.as_deref());
        let (continuation, expect) = if upgrade_length > 0 {
            (Continuation::LengthThenTunnel(upgrade_length), Expect::Opaque)
        } else if head.upgrade {
            (Continuation::BodyThenTunnel, Expect::Opaque)
        } else {
            let bodiless = head.method.eq_ignore_ascii_case("HEAD");
            (Continuation::Body, Expect::Response { bodiless })
        };

        self.connect_upstream(front, target, forward, Vec::new(), continuation, expect);
    }

    /// ICAP answers at decision time; the encapsulated body that follows
    /// is consumed and dropped.
    fn route_icap(
        &mut self,
        front: ConnId,
        head: &IcapHead,
        sub_header: &[u8],
        decision: Decision,
    ) {
        let unchanged = || {
            if head.allow_204 {
                return icap::no_modification();
            }
            match icap::request_section(head, sub_header) {
                Some(section) => icap::with_request(section),
                None => icap::no_modification(),
            }
        };

        let reply = match decision {
            Decision::Permit { .. } | Decision::Intercept { .. } => unchanged(),
            Decision::Redirect { url } => {
                let response = Response::redirect(&url);
                icap::with_response(&response.head_bytes(), &response.body)
            }
            Decision::Rewrite { path, args } => {
                let inner = icap::request_section(head, sub_header)
                    .and_then(|section| Some((section, http::parse_request(section).ok()?)));
                match inner {
                    Some((section, inner)) => {
                        let path = http::rewritten_path(&path, &args);
                        icap::with_request(&http::forward_head(section, &inner, Some(&path)))
                    }
                    None => unchanged(),
                }
            }
            Decision::ServeLocal { code, resource } => {
                let response = self.local.render(code, &resource, "");
                icap::with_response(&response.head_bytes(), &response.body)
            }
            Decision::ServeInline { code, body } => {
                let response = Response::inline(code, &body);
                icap::with_response(&response.head_bytes(), &response.body)
            }
            Decision::Close => {
                self.terminate(front);
                return;
            }
            Decision::Requeue | Decision::Defer => icap::error_response(500),
        };

        if let Some(exchange) = self.exchanges.get_mut(&front) {
            exchange.stage = Stage::Relaying;
        }
        self.write_to(front, &reply);
        self.release(front, Continuation::Body);
    }

    /// TLS and passthrough connections cannot be answered in-protocol: a
    /// connection is either relayed or dropped.
    fn route_tunnel(&mut self, front: ConnId, sni: Option<String>, decision: Decision) {
        let (host, port) = match decision {
            Decision::Permit { host, port, .. } | Decision::Intercept { host, port } => {
                (host, port)
            }
            other => {
                debug!(conn = front, decision = other.name(), "dropping tunnel");
                self.terminate(front);
                return;
            }
        };

        let default_port = self.default_port(front);
        let fallback = match sni {
            Some(sni) => Some((sni, default_port)),
            None => self
                .exchanges
                .get(&front)
                .and_then(|exchange| exchange.fixed_upstream.as_deref())
                .and_then(|upstream| http::split_authority(upstream, default_port).ok()),
        };

        match fill_target(host, port, fallback, default_port) {
            Some(target) => self.connect_upstream(
                front,
                target,
                Vec::new(),
                Vec::new(),
                Continuation::Body,
                Expect::Opaque,
            ),
            None => {
                warn!(conn = front, "permitted tunnel has no destination");
                self.terminate(front);
            }
        }
    }

    fn default_port(&self, front: ConnId) -> u16 {
        self.exchanges
            .get(&front)
            .map_or(80, |exchange| exchange.default_port)
    }

    /// Reuses the current upstream when it already serves `target`, opens
    /// a new one otherwise.
    fn connect_upstream(
        &mut self,
        front: ConnId,
        target: (String, u16),
        forward: Vec<u8>,
        reply: Vec<u8>,
        continuation: Continuation,
        expect: Expect,
    ) {
        let reusable = self.relays.get(&front).and_then(|relay| {
            let (host, port) = relay.target();
            let upstream = relay.upstream();
            let alive = self
                .conns
                .get(&upstream)
                .is_some_and(|conn| !conn.is_finishing());
            (alive && host == target.0 && port == target.1).then_some(upstream)
        });

        if let Some(upstream) = reusable {
            debug!(conn = front, upstream, host = %target.0, port = target.1, "reusing upstream");
            if let Some(relay) = self.relays.get_mut(&front) {
                relay.reuse();
                relay.expect(expect);
            }
            if let Some(exchange) = self.exchanges.get_mut(&front) {
                exchange.stage = Stage::Relaying;
            }
            if !reply.is_empty() {
                self.write_to(front, &reply);
            }
            if !forward.is_empty() {
                self.write_to(upstream, &forward);
            }
            self.release(front, continuation);
            return;
        }

        self.drop_upstream(front);

        let literal = target
            .0
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();

        let Some(exchange) = self.exchanges.get_mut(&front) else {
            return;
        };
        exchange.target = Some(target.clone());
        exchange.forward = forward;
        exchange.reply = reply;
        exchange.continuation = continuation;
        exchange.expect = expect;

        match literal {
            Some(ip) => self.open_upstream(front, SocketAddr::new(ip, target.1)),
            None => {
                debug!(conn = front, host = %target.0, "resolving");
                exchange.stage = Stage::Resolving;
                self.resolver.submit(front, target.0);
            }
        }
    }

    pub(super) fn on_resolved(&mut self, resolution: Resolution) {
        let Some(exchange) = self.exchanges.get(&resolution.conn) else {
            return;
        };
        if exchange.stage != Stage::Resolving {
            return;
        }
        let port = exchange.target.as_ref().map_or(0, |(_, port)| *port);

        match resolution.result {
            Ok(ip) => self.open_upstream(resolution.conn, SocketAddr::new(ip, port)),
            Err(e) => {
                warn!(conn = resolution.conn, host = %resolution.host, error = %e, "resolution failed");
                self.upstream_failed(resolution.conn);
            }
        }
    }

    fn open_upstream(&mut self, front: ConnId, addr: SocketAddr) {
        let Some(kind) = self.conns.get(&front).map(Connection::kind) else {
            return;
        };

        let (fd, connected) = match net::connect(&addr) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(conn = front, upstream = %addr, error = %e, "upstream connect failed");
                self.upstream_failed(front);
                return;
            }
        };

        let local = sys_sockname(fd)
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let id = self.allocate_id();
        let conn = Connection::upstream(id, fd, kind, addr, local, front);
        debug!(conn = front, upstream = id, %addr, "opening upstream");

        let target = self
            .exchanges
            .get_mut(&front)
            .and_then(|exchange| {
                exchange.stage = Stage::Opening;
                exchange.target.clone()
            })
            .unwrap_or_else(|| (addr.ip().to_string(), addr.port()));

        self.timers.schedule(id, conn.last_active());
        self.by_fd.insert(fd, id);
        self.conns.insert(id, conn);
        if let Some(front_conn) = self.conns.get_mut(&front) {
            front_conn.set_link(Some(id));
        }
        let relay = Relay::new(
            front,
            id,
            target,
            Family::of(&addr),
            self.config.max_header_size,
        );
        self.relays.insert(front, relay);

        if connected {
            self.start_relay(front, id);
        } else {
            self.watch(OPENING_DOWNLOAD, id);
        }
    }

    pub(super) fn start_relay(&mut self, front: ConnId, upstream: ConnId) {
        let Some(exchange) = self.exchanges.get_mut(&front) else {
            self.close(upstream);
            return;
        };

        exchange.stage = Stage::Relaying;
        let forward = std::mem::take(&mut exchange.forward);
        let reply = std::mem::take(&mut exchange.reply);
        let continuation = exchange.continuation;
        if let Some(relay) = self.relays.get_mut(&front) {
            relay.expect(exchange.expect);
        }

        self.stats.relays += 1;
        debug!(conn = front, upstream, "relay established");

        self.watch(READ_DOWNLOAD, upstream);
        if !reply.is_empty() {
            self.write_to(front, &reply);
        }
        if !forward.is_empty() {
            self.write_to(upstream, &forward);
        }
        self.release(front, continuation);
    }

    /// Lets the decoder continue past the held message and drains what is
    /// already buffered.
    fn release(&mut self, front: ConnId, continuation: Continuation) {
        if let Some(decoder) = self.conns.get_mut(&front).and_then(Connection::decoder_mut) {
            decoder.release(continuation);
        }
        self.advance(front);
    }

    /// Detaches and closes the upstream of `front` without touching the
    /// front-end connection itself.
    pub(super) fn drop_upstream(&mut self, front: ConnId) {
        let Some(relay) = self.relays.remove(&front) else {
            return;
        };
        let upstream = relay.upstream();

        if let Some(conn) = self.conns.get_mut(&upstream) {
            conn.set_link(None);
        }
        if let Some(conn) = self.conns.get_mut(&front) {
            conn.set_link(None);
        }

        self.close(upstream);
        self.sync_read_cork(front);
    }

    pub(super) fn upstream_failed(&mut self, front: ConnId) {
        self.stats.upstream_failures += 1;
        self.drop_upstream(front);

        match self.conns.get(&front).map(Connection::kind) {
            Some(kind) if kind.speaks_http() => {
                self.respond(front, Response::error(502, "upstream unreachable"))
            }
            Some(_) => self.terminate(front),
            None => {}
        }
    }

    /// Sends a synthesized response and closes the front-end once it is
    /// delivered.
    pub(super) fn respond(&mut self, front: ConnId, response: Response) {
        debug!(conn = front, status = response.status, "responding locally");
        self.write_to(front, &response.into_bytes());
        self.wind_down(front);
    }

    pub(super) fn on_violation(&mut self, front: ConnId, error: ParseError) {
        self.stats.violations += 1;

        let Some(kind) = self.conns.get(&front).map(Connection::kind) else {
            return;
        };
        warn!(conn = front, ?kind, %error, "protocol violation");

        // Mid-relay the client may already have part of an upstream
        // response; nothing can be appended to it.
        let mid_relay = self.relays.contains_key(&front)
            && (self.awaiting_response(front)
                || self
                    .exchanges
                    .get(&front)
                    .is_some_and(|exchange| exchange.stage != Stage::AwaitingHeader));
        if mid_relay {
            self.terminate(front);
            return;
        }
        self.drop_upstream(front);

        match kind {
            SourceKind::Proxy | SourceKind::Web => {
                self.respond(front, Response::error(error.status(), &error.to_string()))
            }
            SourceKind::Icap => {
                self.write_to(front, &icap::error_response(error.status()));
                self.wind_down(front);
            }
            SourceKind::Tls | SourceKind::Passthrough => self.terminate(front),
        }
    }
}

/// Completes a decided target from what the message itself asked for.
fn fill_target(
    host: String,
    port: u16,
    requested: Option<(String, u16)>,
    default_port: u16,
) -> Option<(String, u16)> {
    let host = if host.is_empty() {
        requested.as_ref().map(|(host, _)| host.clone())?
    } else {
        host
    };

    let port = match (port, requested) {
        (0, Some((_, requested))) if requested != 0 => requested,
        (0, _) => default_port,
        (port, _) => port,
    };

    (!host.is_empty()).then_some((host, port))
}

#[cfg(test)]
mod tests {
    use super::fill_target;

    #[test]
    fn test_fill_target() {
        let requested = Some(("origin.test".to_string(), 8080));

        assert_eq!(
            fill_target(String::new(), 0, requested.clone(), 80),
            Some(("origin.test".into(), 8080))
        );
        assert_eq!(
            fill_target("other.test".into(), 0, requested.clone(), 80),
            Some(("other.test".into(), 8080))
        );
        assert_eq!(
            fill_target("other.test".into(), 9000, requested, 80),
            Some(("other.test".into(), 9000))
        );
        assert_eq!(
            fill_target("other.test".into(), 0, None, 443),
            Some(("other.test".into(), 443))
        );
        assert_eq!(fill_target(String::new(), 0, None, 80), None);
    }
}
