//! TCP Handler: accept, recover the original destination, optionally sniff
//! the first bytes, and stream to the upstream picked by the Router.
//!
//! The bidirectional pump uses `tokio::time::timeout` around each direction
//! of the copy loop independently, rather than one timeout around
//! `copy_bidirectional` as a whole, so each half can idle out and half-close
//! on its own schedule.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use std::sync::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::relayd::original_dst;
use crate::relayd::router::RouterTable;
use crate::relayd::sniff::{self, SniffResult};
use crate::relayd::stream::BoxedStream;
use crate::relayd::telemetry::{self, ConnInfo, SharedConns};

#[derive(Debug, Clone)]
pub struct TcpHandlerOptions {
    pub tproxy: bool,
    pub sniffing: bool,
    pub sniffing_timeout: Duration,
    pub idle_timeout: Duration,
    /// Per-source-IP token bucket capacity; `0` disables rate limiting.
    pub rate_limit_per_sec: u32,
}

impl Default for TcpHandlerOptions {
    fn default() -> Self {
        Self {
            tproxy: false,
            sniffing: true,
            sniffing_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(300),
            rate_limit_per_sec: 0,
        }
    }
}

pub struct TcpHandler {
    routers: Arc<RouterTable>,
    service: String,
    opts: TcpHandlerOptions,
    limiter: Option<RateLimiter>,
    conns: SharedConns,
}

impl TcpHandler {
    pub fn new(routers: Arc<RouterTable>, service: impl Into<String>, opts: TcpHandlerOptions, conns: SharedConns) -> Self {
        let limiter = (opts.rate_limit_per_sec > 0).then(|| RateLimiter::new(opts.rate_limit_per_sec));
        Self { routers, service: service.into(), opts, limiter, conns }
    }

    /// Looks up this handler's Router in the current config snapshot: each
    /// new connection sees whatever reload last installed.
    fn router(&self) -> anyhow::Result<Arc<crate::relayd::router::Router>> {
        self.routers
            .get(&self.service)
            .with_context(|| format!("tcp: no router registered for service {:?}", self.service))
    }

    pub async fn handle(&self, mut conn: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        if let Some(limiter) = &self.limiter {
            if !limiter.allow(peer.ip()) {
                debug!(%peer, "tcp: rate limit denied");
                return Ok(());
            }
        }

        let router = self.router()?;
        let dst = original_dst::recover(&conn, self.opts.tproxy).context("recover original destination")?;

        metrics::counter!("relayd_tcp_connections_total").increment(1);
        let _registration = ConnRegistration::new(&self.conns, "tcp", peer, dst);

        if !self.opts.sniffing {
            let up = router.dial("tcp", &dst.to_string()).await?;
            return transport_pump(conn, up, self.opts.idle_timeout).await;
        }

        let sniffed = match sniff::sniff(&mut conn, self.opts.sniffing_timeout).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%peer, error = %err, "tcp: sniff failed, treating as opaque");
                sniff::Sniffed {
                    result: SniffResult::Opaque,
                    prefix: Vec::new(),
                }
            }
        };

        match sniffed.result {
            SniffResult::Tls { sni } => {
                metrics::counter!("relayd_sniff_outcomes_total", "outcome" => "tls").increment(1);
                let host = sni.filter(|s| !s.is_empty()).unwrap_or_else(|| dst.ip().to_string());
                let port = if dst.port() == 0 { 443 } else { dst.port() };
                let target = format!("{host}:{port}");
                let up = router.dial("tcp", &target).await?;
                let prefixed = Prefixed::new(sniffed.prefix, conn);
                transport_pump(prefixed, up, self.opts.idle_timeout).await
            }
            SniffResult::Http { host, request_line, headers_raw } => {
                metrics::counter!("relayd_sniff_outcomes_total", "outcome" => "http").increment(1);
                let host = host.unwrap_or_else(|| dst.ip().to_string());
                let target = format!("{host}:80");
                let mut up = router.dial("tcp", &target).await?;
                let rewritten = rewrite_http_request(&headers_raw, &request_line, &host);
                up.write_all(&rewritten).await?;
                transport_pump(conn, up, self.opts.idle_timeout).await
            }
            SniffResult::Opaque => {
                metrics::counter!("relayd_sniff_outcomes_total", "outcome" => "opaque").increment(1);
                let up = router.dial("tcp", &dst.to_string()).await?;
                let prefixed = Prefixed::new(sniffed.prefix, conn);
                transport_pump(prefixed, up, self.opts.idle_timeout).await
            }
        }
    }
}

/// Registers a connection in the admin `/conns` snapshot for its lifetime.
/// Handlers only touch the registry to add/remove themselves, never on the
/// data path itself.
struct ConnRegistration {
    conns: SharedConns,
    id: String,
}

impl ConnRegistration {
    fn new(conns: &SharedConns, protocol: &str, client: SocketAddr, dst: SocketAddr) -> Self {
        let id = telemetry::new_conn_id();
        conns.add(ConnInfo {
            id: id.clone(),
            protocol: protocol.to_string(),
            client: client.to_string(),
            dst: dst.to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });
        Self { conns: conns.clone(), id }
    }
}

impl Drop for ConnRegistration {
    fn drop(&mut self) {
        self.conns.remove(&self.id);
    }
}

/// Rewrites `METHOD path HTTP/version` into `METHOD http://host path HTTP/
/// version`, leaving every other header line untouched.
fn rewrite_http_request(headers_raw: &[u8], request_line: &str, host: &str) -> Vec<u8> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET");
    let path = parts.next().unwrap_or("/");
    let version = parts.next().unwrap_or("HTTP/1.1");

    let new_line = format!("{method} http://{host}{path} {version}\r\n");
    let rest = match find_subslice(headers_raw, b"\r\n") {
        Some(idx) if headers_raw.len() >= idx + 2 => &headers_raw[idx + 2..],
        _ => &[][..],
    };

    let mut out = Vec::with_capacity(new_line.len() + rest.len());
    out.extend_from_slice(new_line.as_bytes());
    out.extend_from_slice(rest);
    out
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Replays `prefix` before reading from `inner`; used to splice sniffed
/// bytes back onto the stream the handler forwards.
struct Prefixed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Two independent copy loops, each idle-timeout-bounded and half-closing
/// its destination on completion.
async fn transport_pump<A, B>(a: A, b: B, idle_timeout: Duration) -> anyhow::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = async {
        let res = copy_with_idle_timeout(&mut ar, &mut bw, idle_timeout).await;
        let _ = bw.shutdown().await;
        res
    };
    let b_to_a = async {
        let res = copy_with_idle_timeout(&mut br, &mut aw, idle_timeout).await;
        let _ = aw.shutdown().await;
        res
    };

    let (sent, received) = tokio::join!(a_to_b, b_to_a);
    sent?;
    received?;
    Ok(())
}

async fn copy_with_idle_timeout<R, W>(r: &mut R, w: &mut W, idle_timeout: Duration) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = if idle_timeout.is_zero() {
            r.read(&mut buf).await?
        } else {
            match tokio::time::timeout(idle_timeout, r.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => break,
            }
        };
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

/// Per-source-IP token bucket, refilled continuously at `rate` tokens/sec up
/// to a burst of `rate`, checked once at accept time (`Allow(1)`).
struct RateLimiter {
    rate: f64,
    buckets: DashMap<IpAddr, Mutex<Bucket>>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        Self {
            rate: rate_per_sec as f64,
            buckets: DashMap::new(),
        }
    }

    fn allow(&self, ip: IpAddr) -> bool {
        let entry = self.buckets.entry(ip).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.rate,
                last: Instant::now(),
            })
        });
        let mut bucket = entry.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[test]
    fn rewrite_http_request_builds_absolute_url() {
        let headers = b"GET /x HTTP/1.1\r\nHost: api.example.com\r\nUser-Agent: t\r\n\r\n";
        let out = rewrite_http_request(headers, "GET /x HTTP/1.1", "api.example.com");
        assert_eq!(
            out,
            b"GET http://api.example.com/x HTTP/1.1\r\nHost: api.example.com\r\nUser-Agent: t\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn transport_pump_relays_both_directions() {
        let (a, mut a_remote) = duplex(1024);
        let (b, mut b_remote) = duplex(1024);

        let pump = tokio::spawn(transport_pump(a, b, Duration::from_secs(5)));

        a_remote.write_all(b"hello-from-client").await.unwrap();
        let mut buf = vec![0u8; 32];
        let n = b_remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-from-client");

        b_remote.write_all(b"hello-from-upstream").await.unwrap();
        let mut buf2 = vec![0u8; 32];
        let n2 = a_remote.read(&mut buf2).await.unwrap();
        assert_eq!(&buf2[..n2], b"hello-from-upstream");

        drop(a_remote);
        drop(b_remote);
        let _ = pump.await;
    }

    #[test]
    fn rate_limiter_denies_after_burst_exhausted() {
        let limiter = RateLimiter::new(1);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }
}
