//! A rule-driven decision provider.
//!
//! The classifier proper is an external service; this provider covers the
//! common case of allow/deny lists by host suffix and gives the binary
//! something to run out of the box. Rules are evaluated on worker threads
//! so the reactor only ever sees asynchronous replies.

use crate::config::{DefaultAction, PolicyConfig, RuleAction, RuleConfig};
use crate::decision::{Decision, DecisionProvider, DecisionReply, DecisionRequest, WorkerId};
use crate::protocol::{SourceKind, http, icap, tls};
use crate::reactor::poller::Waker;

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError, channel, sync_channel};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Resource served for blocked HTTP requests.
const BLOCKED_PAGE: &str = "blocked";

#[derive(Debug, Clone)]
pub struct RulePolicy {
    rules: Vec<RuleConfig>,
    default: DefaultAction,
}

impl RulePolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            rules: config
                .rules
                .iter()
                .cloned()
                .map(|mut rule| {
                    rule.suffix = rule.suffix.trim_start_matches('.').to_ascii_lowercase();
                    rule
                })
                .collect(),
            default: config.default,
        }
    }

    /// Decides one request.
    ///
    /// A permit leaves the host empty or the port at `0` when the message
    /// does not say; the reactor fills those in from the listener.
    pub fn decide(&self, request: &DecisionRequest) -> Decision {
        let (host, port) = match target_of(request) {
            Ok(target) => target,
            Err(reason) => {
                return Decision::ServeInline {
                    code: 400,
                    body: reason,
                };
            }
        };

        if request.source == SourceKind::Web {
            return permit(host, port);
        }

        let action = self
            .rules
            .iter()
            .find(|rule| matches_suffix(&host, &rule.suffix))
            .map(|rule| (rule.action, rule.target.as_str()));

        let http_capable = matches!(
            request.source,
            SourceKind::Proxy | SourceKind::Icap | SourceKind::Web
        );

        match action {
            Some((RuleAction::Permit, _)) => permit(host, port),
            Some((RuleAction::Block, _)) if http_capable => Decision::ServeLocal {
                code: 403,
                resource: BLOCKED_PAGE.to_string(),
            },
            Some((RuleAction::Redirect, url)) if http_capable => Decision::Redirect {
                url: url.to_string(),
            },
            Some(_) => Decision::Close,
            None => match self.default {
                DefaultAction::Permit => permit(host, port),
                DefaultAction::Close => Decision::Close,
            },
        }
    }
}

fn permit(host: String, port: u16) -> Decision {
    Decision::Permit {
        host,
        port,
        upgrade_length: 0,
    }
}

fn matches_suffix(host: &str, suffix: &str) -> bool {
    host == suffix
        || host
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.'))
}

/// Host and port the message is addressed to, as far as it tells.
fn target_of(request: &DecisionRequest) -> Result<(String, u16), String> {
    match request.source {
        SourceKind::Proxy | SourceKind::Web => {
            let head = http::parse_request(&request.header).map_err(|e| e.to_string())?;
            if request.source == SourceKind::Web {
                return Ok((String::new(), 0));
            }
            head.destination(0)
                .ok_or_else(|| "request names no destination".to_string())
        }
        SourceKind::Icap => {
            let head = icap::parse_request(&request.header).map_err(|e| e.to_string())?;
            let Some(section) = icap::request_section(&head, &request.sub_header) else {
                return Ok((String::new(), 0));
            };
            let inner = http::parse_request(section).map_err(|e| e.to_string())?;
            Ok(inner.destination(0).unwrap_or_default())
        }
        SourceKind::Tls => {
            let sni = tls::parse_client_hello(&request.header)
                .ok()
                .flatten()
                .and_then(|hello| hello.sni);
            Ok((sni.unwrap_or_default(), 0))
        }
        SourceKind::Passthrough => Ok((String::new(), 0)),
    }
}

/// Runs a [`RulePolicy`] on a fixed set of worker threads.
pub struct PolicyPool {
    workers: Vec<SyncSender<DecisionRequest>>,
    handles: Vec<JoinHandle<()>>,
    replies: Receiver<DecisionReply>,
    next: usize,
}

impl PolicyPool {
    pub fn spawn(config: &PolicyConfig, waker: Arc<Waker>) -> io::Result<Self> {
        let policy = Arc::new(RulePolicy::new(config));
        let (reply_tx, replies) = channel();

        let mut workers = Vec::new();
        let mut handles = Vec::new();

        for id in 0..config.workers.max(1) {
            let (tx, rx) = sync_channel(config.queue.max(1));
            let policy = policy.clone();
            let reply_tx = reply_tx.clone();
            let waker = waker.clone();

            let handle = thread::Builder::new()
                .name(format!("gatehouse-policy-{id}"))
                .spawn(move || worker_loop(id, policy, rx, reply_tx, waker))?;

            workers.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            workers,
            handles,
            replies,
            next: 0,
        })
    }
}

fn worker_loop(
    id: WorkerId,
    policy: Arc<RulePolicy>,
    requests: Receiver<DecisionRequest>,
    replies: Sender<DecisionReply>,
    waker: Arc<Waker>,
) {
    for request in requests {
        let decision = policy.decide(&request);
        debug!(conn = request.conn, worker = id, decision = decision.name(), "decided");

        let reply = DecisionReply {
            conn: request.conn,
            worker: id,
            decision: Some(decision),
        };
        if replies.send(reply).is_err() {
            return;
        }
        waker.wake();
    }
}

impl DecisionProvider for PolicyPool {
    fn submit(&mut self, mut request: DecisionRequest) -> Result<(), DecisionRequest> {
        let count = self.workers.len();

        for step in 0..count {
            let id = (self.next + step) % count;
            if count > 1 && request.avoid == Some(id) {
                continue;
            }

            match self.workers[id].try_send(request) {
                Ok(()) => {
                    self.next = (id + 1) % count;
                    return Ok(());
                }
                Err(TrySendError::Full(back) | TrySendError::Disconnected(back)) => {
                    request = back;
                }
            }
        }

        Err(request)
    }

    fn poll_replies(&mut self, out: &mut Vec<DecisionReply>) {
        out.extend(self.replies.try_iter());
    }
}

impl Drop for PolicyPool {
    fn drop(&mut self) {
        self.workers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn config() -> PolicyConfig {
        let rule = |suffix: &str, action, target: &str| RuleConfig {
            suffix: suffix.into(),
            action,
            target: target.into(),
        };

        PolicyConfig {
            workers: 2,
            queue: 4,
            default: DefaultAction::Permit,
            rules: vec![
                rule(".ads.example", RuleAction::Block, ""),
                rule("old.example", RuleAction::Redirect, "http://new.example/"),
                rule("bad.example", RuleAction::Close, ""),
            ],
        }
    }

    fn request(source: SourceKind, header: &[u8]) -> DecisionRequest {
        DecisionRequest {
            conn: 7,
            accept: "127.0.0.1:3128".parse().unwrap(),
            peer: "127.0.0.1:40000".parse().unwrap(),
            header: header.to_vec(),
            sub_header: Vec::new(),
            source,
            round: 0,
            avoid: None,
        }
    }

    #[test]
    fn test_suffix_matching() {
        assert!(matches_suffix("ads.example", "ads.example"));
        assert!(matches_suffix("x.ads.example", "ads.example"));
        assert!(!matches_suffix("badads.example", "ads.example"));
    }

    #[test]
    fn test_http_rules() {
        let policy = RulePolicy::new(&config());

        let get = |host: &str| {
            let header = format!("GET http://{host}/ HTTP/1.1\r\n\r\n");
            policy.decide(&request(SourceKind::Proxy, header.as_bytes()))
        };

        assert_eq!(
            get("www.ads.example"),
            Decision::ServeLocal {
                code: 403,
                resource: "blocked".into()
            }
        );
        assert_eq!(
            get("old.example"),
            Decision::Redirect {
                url: "http://new.example/".into()
            }
        );
        assert_eq!(get("bad.example"), Decision::Close);
        assert_eq!(
            get("fine.example:8080"),
            Decision::Permit {
                host: "fine.example".into(),
                port: 8080,
                upgrade_length: 0
            }
        );
    }

    #[test]
    fn test_tls_block_closes() {
        let policy = RulePolicy::new(&config());
        let hello = tls::sample_hello(Some("tracker.ads.example"));
        assert_eq!(
            policy.decide(&request(SourceKind::Tls, &hello)),
            Decision::Close
        );

        let hello = tls::sample_hello(Some("fine.example"));
        assert_eq!(
            policy.decide(&request(SourceKind::Tls, &hello)),
            Decision::Permit {
                host: "fine.example".into(),
                port: 0,
                upgrade_length: 0
            }
        );
    }

    #[test]
    fn test_unroutable_request_gets_400() {
        let policy = RulePolicy::new(&config());
        let decision = policy.decide(&request(SourceKind::Proxy, b"GET / HTTP/1.0\r\n\r\n"));
        assert!(matches!(decision, Decision::ServeInline { code: 400, .. }));
    }

    #[test]
    fn test_pool_replies_and_wakes() {
        let waker = Arc::new(Waker::new().unwrap());
        let mut pool = PolicyPool::spawn(&config(), waker).unwrap();

        pool.submit(request(SourceKind::Proxy, b"GET http://a.test/ HTTP/1.1\r\n\r\n"))
            .unwrap();

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.is_empty() && Instant::now() < deadline {
            pool.poll_replies(&mut out);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].conn, 7);
        assert!(matches!(out[0].decision, Some(Decision::Permit { .. })));
    }

    #[test]
    fn test_pool_avoids_failed_worker() {
        let waker = Arc::new(Waker::new().unwrap());
        let mut pool = PolicyPool::spawn(&config(), waker).unwrap();

        let mut req = request(SourceKind::Proxy, b"GET http://a.test/ HTTP/1.1\r\n\r\n");
        req.avoid = Some(0);
        pool.submit(req).unwrap();

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.is_empty() && Instant::now() < deadline {
            pool.poll_replies(&mut out);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(out[0].worker, 1);
    }
}
