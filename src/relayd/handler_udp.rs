//! UDP Handler / Listener: a TPROXY UDP listener with a per-5-tuple session
//! table, idle TTL expiry, and a janitor sweep.
//!
//! The session bookkeeping is a `DashMap` keyed by the client tuple, a
//! channel-driven per-session task, and a periodic sweep loop. The TPROXY
//! parts — recovering the original destination from ancillary data, replying
//! with a spoofed source address — sit on top of that.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::relayd::net;
use crate::relayd::router::RouterTable;
use crate::relayd::telemetry::{self, ConnInfo, SharedConns};

#[derive(Debug, Clone)]
pub struct UdpHandlerOptions {
    /// Idle timeout after which a session is torn down (default 30s).
    pub ttl: Duration,
    /// Per-datagram read buffer; oversized datagrams are truncated silently.
    pub read_buffer_size: usize,
}

impl Default for UdpHandlerOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            read_buffer_size: 4096,
        }
    }
}

/// Key identifying a UDP session: the client's address and the original
/// destination it was trying to reach.
type SessionKey = (SocketAddr, SocketAddr);

struct Session {
    tx: mpsc::Sender<Vec<u8>>,
    last_active_unix_ms: AtomicU64,
    task: JoinHandle<()>,
    conns: SharedConns,
    conn_id: String,
}

impl Session {
    fn touch(&self) {
        self.last_active_unix_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_active_unix_ms.load(Ordering::Relaxed);
        let now = now_unix_ms();
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
        self.conns.remove(&self.conn_id);
        metrics::gauge!("relayd_udp_sessions_active").decrement(1.0);
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A non-connected UDP socket bound with `IP_TRANSPARENT` +
/// `IP_RECVORIGDSTADDR`, receiving datagrams addressed to arbitrary
/// destinations.
pub struct TproxyUdpListener {
    sock: Arc<UdpSocket>,
}

impl TproxyUdpListener {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let bind_addr = net::normalize_bind_addr(addr);
        let parsed: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("invalid udp tproxy listen address {addr}"))?;

        let std_sock = net::bind_transparent_udp(parsed)
            .with_context(|| format!("bind tproxy udp {addr}"))?;
        net::set_recv_orig_dst_addr(std_sock.as_raw_fd(), parsed.is_ipv6())
            .with_context(|| "enable IP_RECVORIGDSTADDR")?;

        let sock = UdpSocket::from_std(std_sock)?;
        Ok(Self { sock: Arc::new(sock) })
    }

    fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Receives one datagram, recovering its original destination from the
    /// kernel's ancillary control message.
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
        loop {
            self.sock.readable().await?;
            match self
                .sock
                .try_io(tokio::io::Interest::READABLE, || net::recv_from_with_orig_dst(self.raw_fd(), buf))
            {
                Ok(result) => return Ok(result),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Runs the TPROXY UDP data path until `shutdown` fires: receive loop plus
/// a janitor task sweeping idle sessions.
pub async fn serve(
    listener: TproxyUdpListener,
    routers: Arc<RouterTable>,
    service: String,
    opts: UdpHandlerOptions,
    conns: SharedConns,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sessions: Arc<DashMap<SessionKey, Arc<Session>>> = Arc::new(DashMap::new());

    {
        let sessions = sessions.clone();
        let ttl = opts.ttl;
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            janitor(sessions, ttl, &mut shutdown).await;
        });
    }

    let mut buf = vec![0u8; opts.read_buffer_size];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = listener.recv(&mut buf) => {
                let (n, src, orig_dst) = res.context("udp: recvmsg failed")?;
                let Some(orig_dst) = orig_dst else {
                    tracing::debug!(%src, "udp: datagram missing original destination, dropping");
                    continue;
                };
                let payload = buf[..n].to_vec();
                handle_datagram(&sessions, &routers, &service, &opts, &conns, src, orig_dst, payload).await;
            }
        }
    }

    Ok(())
}

async fn handle_datagram(
    sessions: &Arc<DashMap<SessionKey, Arc<Session>>>,
    routers: &Arc<RouterTable>,
    service: &str,
    opts: &UdpHandlerOptions,
    conns: &SharedConns,
    src: SocketAddr,
    orig_dst: SocketAddr,
    payload: Vec<u8>,
) {
    let key = (src, orig_dst);

    if let Some(session) = sessions.get(&key) {
        session.touch();
        if session.tx.try_send(payload).is_ok() {
            return;
        }
        // Channel full or session task died; fall through and recreate.
    }

    let Some(router) = routers.get(service) else {
        tracing::debug!(%src, %orig_dst, service, "udp: no router registered for service");
        return;
    };

    match new_session(router, opts.read_buffer_size, conns.clone(), src, orig_dst).await {
        Ok(session) => {
            session.touch();
            let _ = session.tx.try_send(payload);
            sessions.insert(key, session);
        }
        Err(err) => {
            tracing::debug!(%src, %orig_dst, error = %err, "udp: failed to establish upstream session");
        }
    }
}

/// Dials the real destination through the Router and spawns the session
/// task: forward client payloads to `up`, relay `up`'s replies back to the
/// client spoofed as coming from `orig_dst`.
async fn new_session(
    router: Arc<crate::relayd::router::Router>,
    read_buffer_size: usize,
    conns: SharedConns,
    client: SocketAddr,
    orig_dst: SocketAddr,
) -> anyhow::Result<Arc<Session>> {
    metrics::counter!("relayd_udp_sessions_total").increment(1);

    let up = router
        .dial("udp", &orig_dst.to_string())
        .await
        .with_context(|| format!("dial udp upstream {orig_dst}"))?;

    let reply_sock = net::bind_transparent_udp(orig_dst).with_context(|| {
        format!("bind transparent reply socket {orig_dst} (requires IP_TRANSPARENT/IP_FREEBIND support)")
    })?;
    let reply_sock = UdpSocket::from_std(reply_sock)?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(128);
    let (mut up_read, mut up_write) = tokio::io::split(up);

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; read_buffer_size];
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(payload) => {
                            if up_write.write_all(&payload).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                res = up_read.read(&mut buf) => {
                    match res {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if reply_sock.send_to(&buf[..n], client).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });

    let conn_id = telemetry::new_conn_id();
    conns.add(ConnInfo {
        id: conn_id.clone(),
        protocol: "udp".to_string(),
        client: client.to_string(),
        dst: orig_dst.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    metrics::gauge!("relayd_udp_sessions_active").increment(1.0);

    Ok(Arc::new(Session {
        tx,
        last_active_unix_ms: AtomicU64::new(now_unix_ms()),
        task,
        conns,
        conn_id,
    }))
}

/// Scans the session table every `ttl/2` and drops sessions idle longer
/// than `ttl`.
async fn janitor(
    sessions: Arc<DashMap<SessionKey, Arc<Session>>>,
    ttl: Duration,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) {
    let interval = (ttl / 2).max(Duration::from_millis(500));
    let mut tick = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let expired: Vec<SessionKey> = sessions
                    .iter()
                    .filter(|entry| entry.value().idle_for() > ttl)
                    .map(|entry| *entry.key())
                    .collect();
                for key in expired {
                    sessions.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_distinguishes_by_both_client_and_dest() {
        let a: SessionKey = ("1.2.3.4:1000".parse().unwrap(), "8.8.8.8:53".parse().unwrap());
        let b: SessionKey = ("1.2.3.4:1000".parse().unwrap(), "8.8.4.4:53".parse().unwrap());
        assert_ne!(a, b);
    }
}
