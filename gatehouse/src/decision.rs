//! Adjudication requests and the decisions that come back.
//!
//! The reactor never blocks on a [`DecisionProvider`]. Requests are
//! submitted through a [`Dispatcher`], which queues them while the
//! provider is saturated, retries a failed request once on a different
//! worker, and resolves `requeue`/`defer` rounds before anything reaches
//! the reactor.

use crate::connection::ConnId;
use crate::protocol::SourceKind;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Index of a worker inside a provider.
pub type WorkerId = usize;

/// Extra `defer` round-trips allowed per message.
pub const MAX_DEFER_ROUNDS: u8 = 2;

/// `requeue` answers tolerated per message.
pub const MAX_REQUEUES: u8 = 3;

/// Disposition of one front-end message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward to `host:port`. A non-zero `upgrade_length` switches the
    /// exchange to raw relaying after that many body bytes.
    Permit {
        host: String,
        port: u16,
        upgrade_length: u64,
    },
    Redirect {
        url: String,
    },
    /// Forward to the requested origin with a replaced path.
    Rewrite {
        path: String,
        args: String,
    },
    /// Forward unchanged to an alternative target.
    Intercept {
        host: String,
        port: u16,
    },
    ServeLocal {
        code: u16,
        resource: String,
    },
    ServeInline {
        code: u16,
        body: String,
    },
    Close,
    Requeue,
    Defer,
}

impl Decision {
    pub fn server_error(reason: &str) -> Self {
        Decision::ServeInline {
            code: 500,
            body: reason.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Decision::Permit { .. } => "permit",
            Decision::Redirect { .. } => "redirect",
            Decision::Rewrite { .. } => "rewrite",
            Decision::Intercept { .. } => "intercept",
            Decision::ServeLocal { .. } => "serve-local",
            Decision::ServeInline { .. } => "serve-inline",
            Decision::Close => "close",
            Decision::Requeue => "requeue",
            Decision::Defer => "defer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub conn: ConnId,
    pub accept: SocketAddr,
    pub peer: SocketAddr,
    pub header: Vec<u8>,
    pub sub_header: Vec<u8>,
    pub source: SourceKind,

    /// `0` for the first ask, incremented on every `defer`.
    pub round: u8,

    /// Worker that already failed this request.
    pub avoid: Option<WorkerId>,
}

#[derive(Debug, Clone)]
pub struct DecisionReply {
    pub conn: ConnId,
    pub worker: WorkerId,

    /// `None` means no classifier could answer.
    pub decision: Option<Decision>,
}

/// An asynchronous adjudicator.
///
/// Implementations run their logic elsewhere (threads, processes) and
/// must wake the reactor's poller when a reply becomes available.
pub trait DecisionProvider: Send {
    /// Hands a request over, or gives it back when saturated.
    fn submit(&mut self, request: DecisionRequest) -> Result<(), DecisionRequest>;

    /// Moves every reply that arrived since the last call into `out`.
    fn poll_replies(&mut self, out: &mut Vec<DecisionReply>);
}

/// Provider used when none is configured: every request fails.
#[derive(Debug, Default)]
pub struct Unavailable {
    replies: Vec<DecisionReply>,
}

impl DecisionProvider for Unavailable {
    fn submit(&mut self, request: DecisionRequest) -> Result<(), DecisionRequest> {
        self.replies.push(DecisionReply {
            conn: request.conn,
            worker: request.avoid.map_or(0, |w| w + 1),
            decision: None,
        });
        Ok(())
    }

    fn poll_replies(&mut self, out: &mut Vec<DecisionReply>) {
        out.append(&mut self.replies);
    }
}

#[derive(Debug)]
struct Inflight {
    request: DecisionRequest,
    retried: bool,
    requeues: u8,
}

pub struct Dispatcher {
    provider: Box<dyn DecisionProvider>,
    backlog: VecDeque<DecisionRequest>,
    inflight: HashMap<ConnId, Inflight>,
    replies: Vec<DecisionReply>,
}

impl Dispatcher {
    pub fn new(provider: Box<dyn DecisionProvider>) -> Self {
        Self {
            provider,
            backlog: VecDeque::new(),
            inflight: HashMap::new(),
            replies: Vec::new(),
        }
    }

    /// Starts adjudicating a message. Replaces any request still
    /// outstanding for the same connection.
    pub fn submit(&mut self, request: DecisionRequest) {
        self.cancel(request.conn);
        self.inflight.insert(
            request.conn,
            Inflight {
                request: request.clone(),
                retried: false,
                requeues: 0,
            },
        );
        self.send(request);
    }

    /// Forgets a connection; a late reply for it is dropped.
    pub fn cancel(&mut self, conn: ConnId) {
        self.inflight.remove(&conn);
        self.backlog.retain(|request| request.conn != conn);
    }

    pub fn is_pending(&self, conn: ConnId) -> bool {
        self.inflight.contains_key(&conn)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Retries queued requests while the provider accepts them.
    pub fn flush(&mut self) {
        while let Some(request) = self.backlog.pop_front() {
            if let Err(request) = self.provider.submit(request) {
                self.backlog.push_front(request);
                break;
            }
        }
    }

    /// Collects final decisions into `out`.
    ///
    /// Intermediate answers (`requeue`, `defer`, a failed worker) are
    /// resubmitted here and never surface. Returns whether any reply was
    /// consumed, final or not.
    pub fn collect(&mut self, out: &mut Vec<(ConnId, Decision)>) -> bool {
        self.flush();
        self.provider.poll_replies(&mut self.replies);
        let progressed = !self.replies.is_empty();

        for reply in std::mem::take(&mut self.replies) {
            let Some(entry) = self.inflight.get_mut(&reply.conn) else {
                debug!(conn = reply.conn, "dropping reply for a closed connection");
                continue;
            };

            let retry = match reply.decision {
                None if !entry.retried => {
                    entry.retried = true;
                    entry.request.avoid = Some(reply.worker);
                    warn!(conn = reply.conn, worker = reply.worker, "classifier failed, retrying");
                    true
                }
                None => {
                    self.finish(reply.conn, Decision::server_error("no classifier available"), out);
                    false
                }
                Some(Decision::Requeue) if entry.requeues < MAX_REQUEUES => {
                    entry.requeues += 1;
                    true
                }
                Some(Decision::Defer) if entry.request.round < MAX_DEFER_ROUNDS => {
                    entry.request.round += 1;
                    true
                }
                Some(Decision::Requeue | Decision::Defer) => {
                    self.finish(reply.conn, Decision::server_error("decision did not settle"), out);
                    false
                }
                Some(decision) => {
                    self.finish(reply.conn, decision, out);
                    false
                }
            };

            if retry && let Some(entry) = self.inflight.get(&reply.conn) {
                let request = entry.request.clone();
                self.send(request);
            }
        }

        self.flush();
        progressed
    }

    fn send(&mut self, request: DecisionRequest) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(request);
            return;
        }

        if let Err(request) = self.provider.submit(request) {
            debug!(conn = request.conn, "decision provider saturated, queueing");
            self.backlog.push_back(request);
        }
    }

    fn finish(&mut self, conn: ConnId, decision: Decision, out: &mut Vec<(ConnId, Decision)>) {
        self.inflight.remove(&conn);
        out.push((conn, decision));
    }
}
