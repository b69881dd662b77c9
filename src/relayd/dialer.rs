//! NetDialer: opens a raw TCP/UDP socket to a `host:port`, honouring
//! outbound interface binding, `SO_MARK`, and a deadline.
//!
//! Each configured interface is tried in order; within an interface, each
//! resolved local address is tried in order; a trailing `!` on an interface
//! entry makes it "strict" (abort the whole list on any failure other than
//! "no suitable local address").

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::relayd::error::DialError;
use crate::relayd::net as netutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    fn wants_v6(self) -> Option<bool> {
        match self {
            Network::Tcp4 | Network::Udp4 => Some(false),
            Network::Tcp6 | Network::Udp6 => Some(true),
            Network::Tcp | Network::Udp => None,
        }
    }

    pub fn parse(s: &str) -> Option<Network> {
        Some(match s {
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            "udp" => Network::Udp,
            "udp4" => Network::Udp4,
            "udp6" => Network::Udp6,
            _ => return None,
        })
    }
}

pub enum Dialed {
    Tcp(TcpStream),
    /// A UDP socket already `connect()`-ed to the target, or left unconnected
    /// when `addr` was empty (used by handlers that `send_to` per-packet).
    Udp(UdpSocket),
}

#[derive(Debug, Clone, Default)]
pub struct NetDialerOptions {
    /// Comma-separated interface specifiers, each optionally suffixed `!`
    /// for strict mode. Entries may be interface names or literal IPs.
    pub interface: String,
    /// `SO_MARK` value; 0 means "do not set".
    pub mark: u32,
    /// Overall dial deadline budget. Defaults to 10s, matching the source.
    pub timeout: Duration,
}

impl NetDialerOptions {
    pub fn with_timeout_default(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = Duration::from_secs(10);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct NetDialer {
    opts: NetDialerOptions,
}

struct InterfaceSpec<'a> {
    name: &'a str,
    strict: bool,
}

impl NetDialer {
    pub fn new(opts: NetDialerOptions) -> Self {
        Self {
            opts: opts.with_timeout_default(),
        }
    }

    pub async fn dial(&self, network: Network, addr: &str) -> Result<Dialed, DialError> {
        let deadline = Instant::now() + self.opts.timeout;

        if network.is_udp() && addr.is_empty() {
            let local = self.pick_any_local(network)?;
            let sock = bind_udp(local).map_err(DialError::Other)?;
            return Ok(Dialed::Udp(sock));
        }

        let remote: SocketAddr = tokio::net::lookup_host(addr)
            .await
            .map_err(DialError::Other)?
            .next()
            .ok_or_else(|| {
                DialError::Other(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no addresses for {addr}"),
                ))
            })?;

        let specs = parse_interface_list(&self.opts.interface);
        if specs.is_empty() {
            return self
                .dial_once(network, None, remote, deadline)
                .await
                .map_err(classify(deadline));
        }

        let mut last_err: Option<io::Error> = None;
        for spec in specs {
            if Instant::now() >= deadline {
                return Err(DialError::Timeout(self.opts.timeout));
            }

            let local_addrs = match resolve_interface_addrs(spec.name, network.wants_v6()) {
                Ok(addrs) if !addrs.is_empty() => addrs,
                Ok(_) => {
                    let err = io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no suitable address found on interface {}", spec.name),
                    );
                    if spec.strict && !is_no_suitable_address(&err) {
                        return Err(DialError::Other(err));
                    }
                    last_err = Some(err);
                    continue;
                }
                Err(err) => {
                    if spec.strict && !is_no_suitable_address(&err) {
                        return Err(DialError::Other(err));
                    }
                    last_err = Some(err);
                    continue;
                }
            };

            for local in local_addrs {
                let local_sa = SocketAddr::new(local, 0);
                match self
                    .dial_once(network, Some(local_sa), remote, deadline)
                    .await
                {
                    Ok(dialed) => return Ok(dialed),
                    Err(err) => {
                        let abort = spec.strict && !is_no_suitable_address(&err);
                        last_err = Some(err);
                        if abort {
                            return Err(classify(deadline)(last_err.unwrap()));
                        }
                    }
                }
            }
        }

        Err(classify(deadline)(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no interface produced a usable address")
        })))
    }

    async fn dial_once(
        &self,
        network: Network,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        deadline: Instant,
    ) -> io::Result<Dialed> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "dial deadline exceeded"));
        }

        if network.is_udp() {
            let sock = bind_udp(local.unwrap_or_else(|| any_addr_for(remote)))?;
            self.apply_sockopts(sock.as_raw_fd())?;
            tokio::time::timeout(remaining, sock.connect(remote))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial deadline exceeded"))??;
            return Ok(Dialed::Udp(sock));
        }

        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(local) = local {
            socket.bind(local)?;
        }
        self.apply_sockopts(socket.as_raw_fd())?;

        let stream = tokio::time::timeout(remaining, socket.connect(remote))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial deadline exceeded"))??;
        Ok(Dialed::Tcp(stream))
    }

    fn apply_sockopts(&self, fd: std::os::fd::RawFd) -> io::Result<()> {
        netutil::set_mark(fd, self.opts.mark)?;
        let ifaces = parse_interface_list(&self.opts.interface);
        if let Some(first) = ifaces.first() {
            // Only a literal single-interface bind-to-device is meaningful at
            // the socket-option level; multi-candidate interface lists are
            // already expressed as local-address selection above.
            if ifaces.len() == 1 {
                let _ = netutil::bind_to_device(fd, first.name);
            }
        }
        Ok(())
    }

    fn pick_any_local(&self, network: Network) -> Result<SocketAddr, DialError> {
        let v6 = network.wants_v6().unwrap_or(false);
        Ok(if v6 {
            SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        })
    }
}

fn any_addr_for(remote: SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn bind_udp(local: SocketAddr) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(local)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn classify(deadline: Instant) -> impl Fn(io::Error) -> DialError {
    move |err| {
        if Instant::now() >= deadline {
            return DialError::Timeout(Duration::from_secs(0));
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused(err),
            io::ErrorKind::TimedOut => DialError::Timeout(Duration::from_secs(0)),
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                DialError::Unreachable(err)
            }
            _ => DialError::Other(err),
        }
    }
}

fn is_no_suitable_address(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput
    )
}

fn parse_interface_list(spec: &str) -> Vec<InterfaceSpec<'_>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_suffix('!') {
            Some(name) => InterfaceSpec {
                name: name.trim(),
                strict: true,
            },
            None => InterfaceSpec {
                name: s,
                strict: false,
            },
        })
        .collect()
}

/// Resolves an interface specifier to local addresses compatible with
/// `want_v6` (`None` = either family). A specifier that parses as a literal
/// IP address is returned as-is; otherwise it is looked up as an interface
/// name via `getifaddrs(3)`.
fn resolve_interface_addrs(spec: &str, want_v6: Option<bool>) -> io::Result<Vec<IpAddr>> {
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    #[cfg(unix)]
    {
        unix_if_addrs::addrs_for_interface(spec, want_v6)
    }

    #[cfg(not(unix))]
    {
        let _ = want_v6;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot resolve interface {spec} on this platform"),
        ))
    }
}

#[cfg(unix)]
mod unix_if_addrs {
    use std::ffi::CStr;
    use std::io;
    use std::net::IpAddr;

    pub fn addrs_for_interface(name: &str, want_v6: Option<bool>) -> io::Result<Vec<IpAddr>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut out = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            let ifa = unsafe { &*cur };
            cur = ifa.ifa_next;

            if ifa.ifa_name.is_null() || ifa.ifa_addr.is_null() {
                continue;
            }
            let ifname = unsafe { CStr::from_ptr(ifa.ifa_name) }.to_string_lossy();
            if ifname != name {
                continue;
            }

            let family = unsafe { (*ifa.ifa_addr).sa_family as i32 };
            if family == libc::AF_INET {
                if want_v6 == Some(true) {
                    continue;
                }
                let sa = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                out.push(IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(
                    sa.sin_addr.s_addr,
                ))));
            } else if family == libc::AF_INET6 {
                if want_v6 == Some(false) {
                    continue;
                }
                let sa = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
                out.push(IpAddr::V6(std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr)));
            }
        }
        unsafe { libc::freeifaddrs(head) };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_suffix() {
        let specs = parse_interface_list("eth0, eth1! , 10.0.0.5!");
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].name, "eth0");
        assert!(!specs[0].strict);
        assert_eq!(specs[1].name, "eth1");
        assert!(specs[1].strict);
        assert_eq!(specs[2].name, "10.0.0.5");
        assert!(specs[2].strict);
    }

    #[test]
    fn network_parse() {
        assert_eq!(Network::parse("tcp"), Some(Network::Tcp));
        assert_eq!(Network::parse("udp6"), Some(Network::Udp6));
        assert_eq!(Network::parse("sctp"), None);
    }

    #[tokio::test]
    async fn dials_without_interface_list() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let dialer = NetDialer::new(NetDialerOptions {
            timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let dialed = dialer.dial(Network::Tcp, &addr.to_string()).await.unwrap();
        assert!(matches!(dialed, Dialed::Tcp(_)));
        accept.await.unwrap().unwrap();
    }
}
