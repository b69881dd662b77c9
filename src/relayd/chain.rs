//! Node / Hop / Chain / Route.
//!
//! A `Chain` is an ordered list of `Hop`s, each `Hop` a `Selector` over a
//! pool of `Node`s. `Route::dial` walks the selected nodes hop-by-hop,
//! CONNECT-ing through each intermediate node to reach the next, and
//! finally to the real target.

use std::sync::Arc;

use crate::relayd::bypass::{Bypass, NoBypass};
use crate::relayd::connector::{Auth, Connector};
use crate::relayd::dialer::{Dialed, NetDialer, NetDialerOptions, Network};
use crate::relayd::error::RouterError;
use crate::relayd::selector::{Candidate, Marker, Selector, SelectorOptions};
use crate::relayd::stream::BoxedStream;

/// A Dialer+Connector pairing plus whatever options each needs. `route` is
/// populated only for multiplexed transports: the node up to and including
/// a multiplexed hop forms a Route, and `route` holds the nested
/// continuation over that session.
///
/// No connector registered in this build multiplexes (`HttpConnector::
/// is_multiplex()` is always `false`), so `route` is always `None` in
/// practice today; the field exists so a future multiplexed connector (e.g.
/// a yamux/QUIC transport) can populate it without reshaping `Node`.
pub struct Transport {
    pub dialer_opts: NetDialerOptions,
    pub connector: Arc<dyn Connector>,
    pub route: Option<Arc<Route>>,
}

pub struct Node {
    pub name: String,
    pub addr: String,
    pub host: String,
    pub protocol: String,
    pub transport: Transport,
    pub auth: Option<Auth>,
    pub is_backup: bool,
    marker: Marker,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            host: String::new(),
            protocol: String::new(),
            transport,
            auth: None,
            is_backup: false,
            marker: Marker::new(),
        }
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }
}

impl Candidate for Arc<Node> {
    fn marker(&self) -> &Marker {
        &self.marker
    }

    fn is_backup(&self) -> bool {
        self.is_backup
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

pub struct Hop {
    nodes: Vec<Arc<Node>>,
    selector: Selector,
    bypass: Arc<dyn Bypass>,
}

impl Hop {
    pub fn new(nodes: Vec<Arc<Node>>, selector_opts: SelectorOptions) -> Self {
        Self {
            nodes,
            selector: Selector::new(selector_opts),
            bypass: Arc::new(NoBypass),
        }
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = bypass;
        self
    }

    /// Selects one live Node for `addr_hint`. A Hop whose Bypass matches the
    /// target host is skipped entirely by the caller, not consulted here —
    /// `select` only runs the Selector's FailFilter/BackupFilter/Strategy
    /// pipeline.
    pub fn select(&self, addr_hint: &str) -> Option<Arc<Node>> {
        self.selector.select(&self.nodes, addr_hint).cloned()
    }

    pub fn bypasses(&self, host: &str) -> bool {
        self.bypass.contains(host)
    }
}

/// An ordered sequence of Hops.
pub struct Chain {
    hops: Vec<Hop>,
}

impl Chain {
    pub fn new(hops: Vec<Hop>) -> Self {
        Self { hops }
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Walks the hops in order, selecting one live Node per Hop (skipping
    /// hops whose Bypass excludes `addr_hint`'s host), and returns the
    /// resulting Route. Stops early (returning whatever was collected so
    /// far) if a Hop produces no candidate — an exhausted chain still
    /// yields a best-effort partial Route rather than failing outright;
    /// `Route::dial` reports `EmptyRoute` only when nothing was selected.
    pub fn route(&self, host_hint: &str, addr_hint: &str) -> Route {
        let mut nodes = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            if hop.bypasses(host_hint) {
                continue;
            }
            match hop.select(addr_hint) {
                Some(node) => nodes.push(node),
                None => break,
            }
        }
        Route::new(nodes)
    }
}

/// A concrete, already-selected path through zero or more Nodes. An empty
/// Route means "dial directly" — the Router substitutes
/// `DirectRoute` for it rather than calling `dial` on an empty one.
pub struct Route {
    nodes: Vec<Arc<Node>>,
}

impl Route {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dials hop 0 directly, then CONNECTs through each subsequent hop to
    /// reach the next, and finally to `target`.
    pub async fn dial(&self, network: &str, target: &str) -> Result<BoxedStream, RouterError> {
        let Some(first) = self.nodes.first() else {
            return Err(RouterError::EmptyRoute);
        };

        let dialer = NetDialer::new(first.transport.dialer_opts.clone());
        let dialed = dialer.dial(Network::Tcp, &first.addr).await;
        let dialed = match dialed {
            Ok(d) => {
                first.marker().on_success();
                d
            }
            Err(err) => {
                first.marker().on_failure();
                metrics::counter!("relayd_dial_failures_total", "node" => first.name.clone())
                    .increment(1);
                return Err(RouterError::Dial(err));
            }
        };
        let mut conn: BoxedStream = match dialed {
            Dialed::Tcp(stream) => Box::new(stream),
            Dialed::Udp(_) => {
                return Err(RouterError::InvalidAddr(
                    first.addr.clone(),
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "UDP cannot be dialed through a proxy chain",
                    ),
                ));
            }
        };

        let last = self.nodes.len() - 1;
        for (i, node) in self.nodes.iter().enumerate() {
            let (hop_network, hop_target): (&str, &str) = if i == last {
                (network, target)
            } else {
                ("tcp", self.nodes[i + 1].addr.as_str())
            };

            if i == last && node.transport.connector.passthrough(hop_target) {
                drop(conn);
                let direct_dialer = NetDialer::new(node.transport.dialer_opts.clone());
                match direct_dialer.dial(Network::Tcp, hop_target).await {
                    Ok(Dialed::Tcp(stream)) => {
                        node.marker().on_success();
                        conn = Box::new(stream);
                    }
                    Ok(Dialed::Udp(_)) => unreachable!("Network::Tcp never yields Dialed::Udp"),
                    Err(err) => {
                        node.marker().on_failure();
                        metrics::counter!("relayd_dial_failures_total", "node" => node.name.clone())
                            .increment(1);
                        return Err(RouterError::Dial(err));
                    }
                }
                continue;
            }

            match node
                .transport
                .connector
                .connect(conn, hop_network, hop_target, node.auth.as_ref())
                .await
            {
                Ok(next) => {
                    node.marker().on_success();
                    conn = next;
                }
                Err(err) => {
                    node.marker().on_failure();
                    metrics::counter!("relayd_dial_failures_total", "node" => node.name.clone())
                        .increment(1);
                    return Err(RouterError::Connect(err));
                }
            }
        }

        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayd::connector::HttpConnectorOptions;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn node_with_connector(name: &str, addr: &str, connector: Arc<dyn Connector>) -> Arc<Node> {
        Arc::new(Node::new(
            name,
            addr,
            Transport {
                dialer_opts: NetDialerOptions {
                    timeout: Duration::from_secs(2),
                    ..Default::default()
                },
                connector,
                route: None,
            },
        ))
    }

    #[test]
    fn hop_select_prefers_primary_over_backup() {
        use crate::relayd::connector::HttpConnector;

        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(HttpConnectorOptions::default()));
        let mut primary = Node::new(
            "primary",
            "127.0.0.1:1",
            Transport {
                dialer_opts: NetDialerOptions::default(),
                connector: connector.clone(),
                route: None,
            },
        );
        primary.is_backup = false;
        let mut backup = Node::new(
            "backup",
            "127.0.0.1:2",
            Transport {
                dialer_opts: NetDialerOptions::default(),
                connector,
                route: None,
            },
        );
        backup.is_backup = true;

        let hop = Hop::new(
            vec![Arc::new(primary), Arc::new(backup)],
            SelectorOptions {
                strategy: crate::relayd::selector::Strategy::Fifo,
                ..Default::default()
            },
        );
        let picked = hop.select("x").unwrap();
        assert_eq!(picked.name, "primary");
    }

    #[tokio::test]
    async fn route_dial_connects_through_hop_to_final_target() {
        use crate::relayd::connector::HttpConnector;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hop_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            req
        });

        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(HttpConnectorOptions::default()));
        let node = node_with_connector("hop0", &hop_addr.to_string(), connector);
        let route = Route::new(vec![node]);

        let result = route.dial("tcp", "example.com:443").await;
        assert!(result.is_ok());

        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    }

    /// A `Connector` whose `passthrough` is controlled by the test and that
    /// records whether `connect` was ever called, used to check that
    /// `Route::dial` actually skips the handshake rather than merely
    /// advertising that it would.
    struct RecordingConnector {
        called: Arc<std::sync::atomic::AtomicBool>,
        passthrough_target: String,
    }

    #[async_trait::async_trait]
    impl Connector for RecordingConnector {
        fn passthrough(&self, target: &str) -> bool {
            target == self.passthrough_target
        }

        async fn connect(
            &self,
            conn: BoxedStream,
            _network: &str,
            _target: &str,
            _auth: Option<&Auth>,
        ) -> Result<BoxedStream, crate::relayd::error::ConnectError> {
            self.called.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(conn)
        }
    }

    #[tokio::test]
    async fn route_dial_passthrough_bypasses_connect_and_dials_target_directly() {
        let target_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        let target_accept = tokio::spawn(async move { target_listener.accept().await });

        // A hop listener that the fake connector never gets a chance to
        // CONNECT over; whether it ever accepts is irrelevant to the
        // assertion, only that `connect()` is not invoked.
        let hop_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hop_addr = hop_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = hop_listener.accept().await;
        });

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let target = target_addr.to_string();
        let connector: Arc<dyn Connector> = Arc::new(RecordingConnector {
            called: called.clone(),
            passthrough_target: target.clone(),
        });
        let node = node_with_connector("hop0", &hop_addr.to_string(), connector);
        let route = Route::new(vec![node]);

        let result = route.dial("tcp", &target).await;
        assert!(result.is_ok());
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));

        target_accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn route_dial_reports_empty_route() {
        let route = Route::new(vec![]);
        let err = route.dial("tcp", "example.com:443").await.unwrap_err();
        assert!(matches!(err, RouterError::EmptyRoute));
    }

    #[test]
    fn chain_route_respects_hop_bypass() {
        use crate::relayd::bypass::{Mode, StaticBypass};
        use crate::relayd::connector::HttpConnector;

        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(HttpConnectorOptions::default()));
        let node = node_with_connector("hop0", "127.0.0.1:1", connector);
        let hop = Hop::new(vec![node], SelectorOptions::default())
            .with_bypass(Arc::new(StaticBypass::new(Mode::Blacklist, vec!["blocked.example".into()])));
        let chain = Chain::new(vec![hop]);

        let route = chain.route("blocked.example", "blocked.example:443");
        assert!(route.is_empty());

        let route = chain.route("allowed.example", "allowed.example:443");
        assert!(!route.is_empty());
    }
}
