//! Router: ties a Chain, a Resolver, and a HostMapper together behind the
//! `Dial`/`Bind` entry points the handlers call.
//!
//! `dial` retries `retries + 1` times, re-resolving the address and
//! re-selecting a Route on every attempt so a failed Node's Marker is fresh
//! for the next try.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::relayd::chain::{Chain, Route};
use crate::relayd::dialer::{Dialed, NetDialer, NetDialerOptions, Network};
use crate::relayd::error::RouterError;
use crate::relayd::resolver::{HostMapper, ResolveError, Resolver};
use crate::relayd::stream::BoxedStream;

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub retries: u32,
    pub dialer: NetDialerOptions,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            dialer: NetDialerOptions::default(),
        }
    }
}

pub struct Router {
    chain: Option<Arc<Chain>>,
    resolver: Option<Arc<dyn Resolver>>,
    host_mapper: Option<Arc<dyn HostMapper>>,
    opts: RouterOptions,
}

impl Router {
    pub fn new(opts: RouterOptions) -> Self {
        Self {
            chain: None,
            resolver: None,
            host_mapper: None,
            opts,
        }
    }

    pub fn with_chain(mut self, chain: Arc<Chain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_host_mapper(mut self, mapper: Arc<dyn HostMapper>) -> Self {
        self.host_mapper = Some(mapper);
        self
    }

    /// `network` is one of `tcp`/`tcp4`/`tcp6`/`udp`/`udp4`/`udp6`; `addr`
    /// is `host:port` (host may already be an IP literal).
    pub async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, RouterError> {
        let attempts = self.opts.retries + 1;
        let mut last_err: Option<RouterError> = None;

        for attempt in 0..attempts {
            let resolved = match self.resolve(addr).await {
                Ok(a) => a,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };

            let route = match &self.chain {
                Some(chain) if !chain.is_empty() => {
                    let host = resolved.split(':').next().unwrap_or(&resolved);
                    chain.route(host, &resolved)
                }
                _ => Route::new(Vec::new()),
            };

            let result = if route.is_empty() {
                self.dial_direct(network, &resolved).await
            } else {
                route.dial(network, &resolved).await
            };

            match result {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    debug!(attempt, %addr, error = %err, "dial attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(RouterError::EmptyRoute))
    }

    /// Binds a local socket. When a chain is configured, a Route must
    /// actually be selectable for `addr` (fails with `EmptyRoute`
    /// otherwise); a chain-less Router always binds locally.
    pub async fn bind(&self, network: &str, addr: &str) -> Result<Dialed, RouterError> {
        if let Some(chain) = self.chain.as_ref() {
            if !chain.is_empty() {
                let host = split_host_port(addr).map(|(h, _)| h).unwrap_or(addr);
                if chain.route(host, addr).is_empty() {
                    return Err(RouterError::EmptyRoute);
                }
            }
        }
        let net = Network::parse(network)
            .ok_or_else(|| RouterError::InvalidAddr(addr.to_string(), invalid_network_error(network)))?;
        let dialer = NetDialer::new(self.opts.dialer.clone());
        dialer.dial(net, addr).await.map_err(RouterError::Dial)
    }

    async fn dial_direct(&self, network: &str, addr: &str) -> Result<BoxedStream, RouterError> {
        let net = Network::parse(network)
            .ok_or_else(|| RouterError::InvalidAddr(addr.to_string(), invalid_network_error(network)))?;
        let dialer = NetDialer::new(self.opts.dialer.clone());
        match dialer.dial(net, addr).await {
            Ok(Dialed::Tcp(stream)) => Ok(Box::new(stream)),
            Ok(Dialed::Udp(sock)) => Ok(Box::new(UdpAsStream(sock))),
            Err(err) => Err(RouterError::Dial(err)),
        }
    }

    /// Consults the host-mapper first, then the resolver; `Invalid` means
    /// "leave the address alone".
    async fn resolve(&self, addr: &str) -> Result<String, RouterError> {
        let Some((host, port)) = split_host_port(addr) else {
            return Ok(addr.to_string());
        };
        if host.is_empty() {
            return Ok(addr.to_string());
        }

        if let Some(mapper) = &self.host_mapper {
            let ips = mapper.lookup("ip", host).await;
            if let Some(ip) = ips.first() {
                return Ok(format!("{ip}:{port}"));
            }
        }

        if let Some(resolver) = &self.resolver {
            match resolver.resolve("ip", host).await {
                Ok(ips) if !ips.is_empty() => return Ok(format!("{}:{port}", ips[0])),
                Ok(_) => return Err(RouterError::NxDomain(host.to_string())),
                Err(ResolveError::Invalid) => return Ok(addr.to_string()),
                Err(ResolveError::Other(err)) => {
                    debug!(%host, error = %err, "resolver error, leaving address unchanged");
                    return Ok(addr.to_string());
                }
            }
        }

        Ok(addr.to_string())
    }
}

fn invalid_network_error(network: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("unsupported network {network}"),
    )
}

fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let idx = addr.rfind(':')?;
    Some((&addr[..idx], &addr[idx + 1..]))
}

/// Adapts a `tokio::net::UdpSocket` to `AsyncRead + AsyncWrite` for the rare
/// direct-dial-UDP path (`Router::dial_direct` with `network="udp"`), used
/// only outside the TPROXY datagram fast path in `handler_udp`.
struct UdpAsStream(tokio::net::UdpSocket);

impl tokio::io::AsyncRead for UdpAsStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}

impl tokio::io::AsyncWrite for UdpAsStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// A name -> Router map behind an atomic snapshot swap: new connections
/// capture the current snapshot at accept time. Listener accept loops and
/// UDP session
/// creation both look up their service's Router through this on every new
/// connection/session rather than holding one fixed at listener-spawn time,
/// so a reload takes effect for work that starts after it without
/// restarting the listener.
pub struct RouterTable {
    inner: ArcSwap<HashMap<String, Arc<Router>>>,
}

impl RouterTable {
    pub fn new(routers: HashMap<String, Arc<Router>>) -> Self {
        Self { inner: ArcSwap::new(Arc::new(routers)) }
    }

    pub fn get(&self, service: &str) -> Option<Arc<Router>> {
        self.inner.load().get(service).cloned()
    }

    pub fn swap(&self, routers: HashMap<String, Arc<Router>>) {
        self.inner.store(Arc::new(routers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayd::resolver::StaticHostMapper;
    use std::collections::HashMap;
    use std::net::IpAddr;

    #[test]
    fn router_table_swap_replaces_snapshot() {
        let mut initial = HashMap::new();
        initial.insert("svc".to_string(), Arc::new(Router::new(RouterOptions::default())));
        let table = RouterTable::new(initial);
        assert!(table.get("svc").is_some());
        assert!(table.get("missing").is_none());

        table.swap(HashMap::new());
        assert!(table.get("svc").is_none());
    }

    #[tokio::test]
    async fn resolve_prefers_host_mapper_hit() {
        let mut table = HashMap::new();
        table.insert(
            "example.com".to_string(),
            vec!["93.184.216.34".parse::<IpAddr>().unwrap()],
        );
        let router = Router::new(RouterOptions::default())
            .with_host_mapper(Arc::new(StaticHostMapper::new(table)));

        let resolved = router.resolve("example.com:443").await.unwrap();
        assert_eq!(resolved, "93.184.216.34:443");
    }

    #[tokio::test]
    async fn resolve_leaves_ip_literal_unchanged_without_mapper() {
        let router = Router::new(RouterOptions::default());
        let resolved = router.resolve("127.0.0.1:22").await.unwrap();
        assert_eq!(resolved, "127.0.0.1:22");
    }

    #[tokio::test]
    async fn dial_direct_connects_without_chain() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let router = Router::new(RouterOptions {
            dialer: NetDialerOptions {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
            ..Default::default()
        });
        let result = router.dial("tcp", &addr.to_string()).await;
        assert!(result.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_succeeds_locally_without_chain() {
        let router = Router::new(RouterOptions::default());
        let result = router.bind("udp", "127.0.0.1:0").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bind_fails_empty_route_when_chain_exhausts_every_hop() {
        use crate::relayd::bypass::{Mode, StaticBypass};
        use crate::relayd::chain::{Chain, Hop, Node, Transport};
        use crate::relayd::connector::{Connector, HttpConnector, HttpConnectorOptions};
        use crate::relayd::selector::SelectorOptions;

        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(HttpConnectorOptions::default()));
        let node = Arc::new(Node::new(
            "hop0",
            "127.0.0.1:1",
            Transport { dialer_opts: NetDialerOptions::default(), connector, route: None },
        ));
        let hop = Hop::new(vec![node], SelectorOptions::default())
            .with_bypass(Arc::new(StaticBypass::new(Mode::Blacklist, vec!["blocked.example".into()])));
        let chain = Arc::new(Chain::new(vec![hop]));

        let router = Router::new(RouterOptions::default()).with_chain(chain);
        let err = router.bind("tcp", "blocked.example:443").await.unwrap_err();
        assert!(matches!(err, RouterError::EmptyRoute));
    }

    #[tokio::test]
    async fn bind_routes_through_chain_when_not_bypassed() {
        use crate::relayd::chain::{Chain, Hop, Node, Transport};
        use crate::relayd::connector::{Connector, HttpConnector, HttpConnectorOptions};
        use crate::relayd::selector::SelectorOptions;

        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(HttpConnectorOptions::default()));
        let node = Arc::new(Node::new(
            "hop0",
            "127.0.0.1:1",
            Transport { dialer_opts: NetDialerOptions::default(), connector, route: None },
        ));
        let hop = Hop::new(vec![node], SelectorOptions::default());
        let chain = Arc::new(Chain::new(vec![hop]));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let router = Router::new(RouterOptions {
            dialer: NetDialerOptions { timeout: Duration::from_secs(2), ..Default::default() },
            ..Default::default()
        })
        .with_chain(chain);
        let result = router.bind("tcp", &addr.to_string()).await;
        assert!(result.is_ok());
        accept.await.unwrap().unwrap();
    }
}
