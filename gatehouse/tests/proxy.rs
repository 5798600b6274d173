#[cfg(test)]
mod tests {
    use gatehouse::config::{Config, ListenerConfig};
    use gatehouse::decision::{Decision, DecisionProvider, DecisionReply, DecisionRequest};
    use gatehouse::protocol::SourceKind;
    use gatehouse::resolve::{Resolution, Resolver};
    use gatehouse::{Reactor, ReactorHandle};

    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    type Rule = Box<dyn Fn(&DecisionRequest) -> Decision + Send>;

    /// Decides synchronously and records every request it saw.
    struct Scripted {
        rule: Rule,
        seen: Arc<Mutex<Vec<DecisionRequest>>>,
        replies: Vec<DecisionReply>,
    }

    impl DecisionProvider for Scripted {
        fn submit(&mut self, request: DecisionRequest) -> Result<(), DecisionRequest> {
            self.replies.push(DecisionReply {
                conn: request.conn,
                worker: 0,
                decision: Some((self.rule)(&request)),
            });
            self.seen.lock().expect("poisoned").push(request);
            Ok(())
        }

        fn poll_replies(&mut self, out: &mut Vec<DecisionReply>) {
            out.append(&mut self.replies);
        }
    }

    /// Resolves every name to the loopback address.
    #[derive(Default)]
    struct Loopback {
        done: Vec<Resolution>,
    }

    impl Resolver for Loopback {
        fn submit(&mut self, conn: u64, host: String) {
            self.done.push(Resolution {
                conn,
                host,
                result: Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            });
        }

        fn poll_resolved(&mut self, out: &mut Vec<Resolution>) {
            out.append(&mut self.done);
        }
    }

    struct Running {
        addrs: Vec<(SourceKind, SocketAddr)>,
        seen: Arc<Mutex<Vec<DecisionRequest>>>,
        handle: ReactorHandle,
        thread: Option<JoinHandle<()>>,
    }

    impl Running {
        fn addr(&self, kind: SourceKind) -> SocketAddr {
            self.addrs
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, addr)| *addr)
                .expect("no listener of that kind")
        }

        fn connect(&self, kind: SourceKind) -> TcpStream {
            let stream = TcpStream::connect(self.addr(kind)).expect("Failed to connect to proxy");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("Failed to set timeout");
            stream
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(thread) = self.thread.take() {
                thread.join().expect("Reactor thread panicked");
            }
        }
    }

    fn start(listeners: Vec<ListenerConfig>, rule: Option<Rule>) -> Running {
        let mut config = Config::default();
        config.reactor.idle_timeout_secs = 0;
        config.listeners = listeners;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reactor = Reactor::new(config)
            .expect("Failed to start reactor")
            .with_resolver(Box::new(Loopback::default()));

        if let Some(rule) = rule {
            reactor = reactor.with_decision_provider(Box::new(Scripted {
                rule,
                seen: seen.clone(),
                replies: Vec::new(),
            }));
        }

        let addrs = reactor.listener_addrs();
        let handle = reactor.handle();
        let thread = thread::spawn(move || reactor.run().expect("Reactor failed"));

        Running {
            addrs,
            seen,
            handle,
            thread: Some(thread),
        }
    }

    fn rule(f: impl Fn(&DecisionRequest) -> Decision + Send + 'static) -> Option<Rule> {
        Some(Box::new(f))
    }

    fn listener(kind: SourceKind) -> ListenerConfig {
        ListenerConfig::new("127.0.0.1:0".parse().expect("valid address"), kind)
    }

    fn permit(host: &str, port: u16) -> Decision {
        Decision::Permit {
            host: host.to_string(),
            port,
            upgrade_length: 0,
        }
    }

    fn read_head(stream: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).expect("Failed to read head");
            head.push(byte[0]);
        }
        head
    }

    fn read_all(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).expect("Failed to read response");
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_permitted_request_streams_response() {
        let origin = TcpListener::bind("127.0.0.1:0").expect("Failed to bind origin");
        let port = origin.local_addr().expect("no address").port();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let server = thread::spawn(move || {
            let (mut stream, _) = origin.accept().expect("Failed to accept");
            let head = read_head(&mut stream);
            assert_eq!(
                head,
                b"GET / HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\n\r\n"
            );

            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello")
                .expect("Failed to write");
            release_rx.recv().expect("client gone");
            stream.write_all(b"world").expect("Failed to write");
        });

        let proxy = start(
            vec![listener(SourceKind::Proxy)],
            rule(move |_| permit("example.com", port)),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\n\r\n",
            )
            .expect("Failed to send request");

        let head = read_head(&mut client);
        assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));

        // The partial body arrives before the origin finished its response.
        let mut partial = [0; 5];
        client.read_exact(&mut partial).expect("Failed to read body");
        assert_eq!(&partial, b"hello");

        release_tx.send(()).expect("server gone");
        let mut rest = [0; 5];
        client.read_exact(&mut rest).expect("Failed to read body");
        assert_eq!(&rest, b"world");

        server.join().expect("Origin panicked");

        let seen = proxy.seen.lock().expect("poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].source, SourceKind::Proxy);
        assert!(seen[0].header.starts_with(b"GET http://example.com/ "));
    }

    #[test]
    fn test_connect_tunnel() {
        let origin = TcpListener::bind("127.0.0.1:0").expect("Failed to bind origin");
        let target = origin.local_addr().expect("no address");

        let server = thread::spawn(move || {
            let (mut stream, _) = origin.accept().expect("Failed to accept");
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).expect("Failed to read");
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").expect("Failed to write");
        });

        let proxy = start(
            vec![listener(SourceKind::Proxy)],
            rule(|_| permit("", 0)),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        write!(client, "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n")
            .expect("Failed to send CONNECT");

        let head = read_head(&mut client);
        assert_eq!(head, b"HTTP/1.1 200 Connection established\r\n\r\n");

        client.write_all(b"ping").expect("Failed to write");
        let mut buf = [0; 4];
        client.read_exact(&mut buf).expect("Failed to read");
        assert_eq!(&buf, b"pong");

        server.join().expect("Origin panicked");
    }

    #[test]
    fn test_keep_alive_reuses_upstream() {
        let origin = TcpListener::bind("127.0.0.1:0").expect("Failed to bind origin");
        let port = origin.local_addr().expect("no address").port();

        let server = thread::spawn(move || {
            let (mut stream, _) = origin.accept().expect("Failed to accept");
            for path in ["/one", "/two"] {
                let head = read_head(&mut stream);
                let expected = format!("GET {path} HTTP/1.1\r\n");
                assert!(head.starts_with(expected.as_bytes()));
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .expect("Failed to write");
            }
        });

        let proxy = start(
            vec![listener(SourceKind::Proxy)],
            rule(move |_| permit("127.0.0.1", port)),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        for path in ["/one", "/two"] {
            write!(client, "GET http://origin.test{path} HTTP/1.1\r\nHost: origin.test\r\n\r\n")
                .expect("Failed to send");
            let head = read_head(&mut client);
            assert!(head.starts_with(b"HTTP/1.1 200 OK"));
            let mut body = [0; 2];
            client.read_exact(&mut body).expect("Failed to read body");
        }

        server.join().expect("Origin panicked");
    }

    /// Answers one request with a one-byte body after `delay`.
    fn serve_once(body: &'static [u8], delay: Duration) -> (u16, JoinHandle<()>) {
        let origin = TcpListener::bind("127.0.0.1:0").expect("Failed to bind origin");
        let port = origin.local_addr().expect("no address").port();

        let server = thread::spawn(move || {
            let (mut stream, _) = origin.accept().expect("Failed to accept");
            read_head(&mut stream);
            thread::sleep(delay);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\n")
                .expect("Failed to write");
            stream.write_all(body).expect("Failed to write");
        });

        (port, server)
    }

    #[test]
    fn test_pipelined_requests_to_different_origins_stay_ordered() {
        let (slow, slow_server) = serve_once(b"A", Duration::from_millis(300));
        let (fast, fast_server) = serve_once(b"B", Duration::ZERO);

        let proxy = start(
            vec![listener(SourceKind::Proxy)],
            rule(move |request| {
                let head = String::from_utf8_lossy(&request.header);
                if head.contains("a.test") {
                    permit("127.0.0.1", slow)
                } else {
                    permit("127.0.0.1", fast)
                }
            }),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(
                b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n\
                  GET http://b.test/ HTTP/1.1\r\nHost: b.test\r\n\r\n",
            )
            .expect("Failed to send requests");

        for expected in [b"A", b"B"] {
            let head = read_head(&mut client);
            assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
            let mut body = [0; 1];
            client.read_exact(&mut body).expect("Failed to read body");
            assert_eq!(&body, expected);
        }

        slow_server.join().expect("Origin panicked");
        fast_server.join().expect("Origin panicked");
        assert_eq!(proxy.seen.lock().expect("poisoned").len(), 2);
    }

    #[test]
    fn test_redirect_and_local_pages() {
        let proxy = start(
            vec![listener(SourceKind::Proxy)],
            rule(|request: &DecisionRequest| {
                if request.header.windows(7).any(|w| w == b"ads.net") {
                    Decision::ServeLocal {
                        code: 403,
                        resource: "blocked".into(),
                    }
                } else {
                    Decision::Redirect {
                        url: "http://portal.test/".into(),
                    }
                }
            }),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(b"GET http://somewhere.test/ HTTP/1.1\r\n\r\n")
            .expect("Failed to send");
        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains("Location: http://portal.test/\r\n"));

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(b"GET http://ads.net/banner HTTP/1.1\r\n\r\n")
            .expect("Failed to send");
        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(response.contains("blocked by policy"));
    }

    #[test]
    fn test_without_provider_answers_500() {
        let proxy = start(vec![listener(SourceKind::Proxy)], None);

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(b"GET http://origin.test/ HTTP/1.1\r\n\r\n")
            .expect("Failed to send");
        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 500 "));
    }

    #[test]
    fn test_unreachable_upstream_answers_502() {
        // Bound then dropped: nothing listens on this port any more.
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("Failed to reserve port")
            .port();

        let proxy = start(
            vec![listener(SourceKind::Proxy)],
            rule(move |_| permit("127.0.0.1", port)),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(b"GET http://origin.test/ HTTP/1.1\r\n\r\n")
            .expect("Failed to send");
        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 502 "));
    }

    #[test]
    fn test_icap_options_and_204() {
        let proxy = start(
            vec![listener(SourceKind::Icap)],
            rule(|_| permit("", 0)),
        );

        let mut client = proxy.connect(SourceKind::Icap);
        client
            .write_all(b"OPTIONS icap://127.0.0.1/filter ICAP/1.0\r\nHost: 127.0.0.1\r\n\r\n")
            .expect("Failed to send");
        let head = read_head(&mut client);
        assert!(head.starts_with(b"ICAP/1.0 200 OK\r\n"));

        let http = b"GET http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\n\r\n";
        let request = format!(
            "REQMOD icap://127.0.0.1/filter ICAP/1.0\r\nHost: 127.0.0.1\r\nAllow: 204\r\n\
             Encapsulated: req-hdr=0, null-body={}\r\n\r\n",
            http.len()
        );
        client.write_all(request.as_bytes()).expect("Failed to send");
        client.write_all(http).expect("Failed to send");

        let head = read_head(&mut client);
        assert!(head.starts_with(b"ICAP/1.0 204 "));

        let seen = proxy.seen.lock().expect("poisoned");
        assert_eq!(seen.len(), 1, "OPTIONS is answered without a decision");
        assert_eq!(seen[0].sub_header, http);
    }

    #[test]
    fn test_tls_relayed_to_sni_host() {
        let origin = TcpListener::bind("127.0.0.1:0").expect("Failed to bind origin");
        let port = origin.local_addr().expect("no address").port();
        let hello = client_hello("secure.example");
        let expected = hello.clone();

        let server = thread::spawn(move || {
            let (mut stream, _) = origin.accept().expect("Failed to accept");
            let mut received = vec![0; expected.len()];
            stream.read_exact(&mut received).expect("Failed to read");
            assert_eq!(received, expected);
            stream.write_all(b"server hello").expect("Failed to write");
        });

        let mut tls = listener(SourceKind::Tls);
        tls.default_port = port;
        let proxy = start(vec![tls], rule(|_| permit("", 0)));

        let mut client = proxy.connect(SourceKind::Tls);
        client.write_all(&hello).expect("Failed to send hello");

        let mut reply = [0; 12];
        client.read_exact(&mut reply).expect("Failed to read");
        assert_eq!(&reply, b"server hello");
        server.join().expect("Origin panicked");

        let seen = proxy.seen.lock().expect("poisoned");
        assert_eq!(seen[0].source, SourceKind::Tls);
    }

    #[test]
    fn test_proxy_protocol_source_reaches_provider() {
        let mut front = listener(SourceKind::Proxy);
        front.proxy_protocol = true;
        let proxy = start(
            vec![front],
            rule(|_| Decision::ServeInline {
                code: 200,
                body: "hi".into(),
            }),
        );

        let mut client = proxy.connect(SourceKind::Proxy);
        client
            .write_all(b"PROXY TCP4 203.0.113.7 192.0.2.1 51000 3128\r\nGET http://a.test/ HTTP/1.1\r\n\r\n")
            .expect("Failed to send");
        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("hi"));

        let seen = proxy.seen.lock().expect("poisoned");
        assert_eq!(seen[0].peer, "203.0.113.7:51000".parse().expect("valid"));
    }

    #[test]
    fn test_admin_endpoint_serves_stats() {
        let proxy = start(
            vec![listener(SourceKind::Web)],
            rule(|_| permit("", 0)),
        );

        let mut client = proxy.connect(SourceKind::Web);
        client
            .write_all(b"GET /stats HTTP/1.1\r\nHost: admin\r\n\r\n")
            .expect("Failed to send");
        let response = read_all(&mut client);
        let (head, body) = response.split_once("\r\n\r\n").expect("no body");

        assert!(head.contains("Content-Type: application/json"));
        let stats: serde_json::Value = serde_json::from_str(body).expect("invalid JSON");
        assert_eq!(stats["accepted"], 1);
    }

    fn client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();

        let mut sni = vec![0x00];
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);
        let mut list = (sni.len() as u16).to_be_bytes().to_vec();
        list.extend_from_slice(&sni);

        let mut extensions = vec![0x00, 0x00];
        extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&list);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0x11; 32]);
        body.extend_from_slice(&[0x00, 0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }
}
