use std::borrow::Cow;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::SockRef;

/// Normalize a bind/listen address.
///
/// Config commonly uses the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio's bind APIs do not
/// accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Applies `SO_MARK` to a socket, if `mark` is non-zero. Linux-only; the
/// firewall mark has no meaning elsewhere.
pub fn set_mark(fd: RawFd, mark: u32) -> io::Result<()> {
    if mark == 0 {
        return Ok(());
    }
    let sock = SockRef::from(&Fd(fd));
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
    {
        sock.set_mark(mark)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
    {
        let _ = sock;
        Ok(())
    }
}

/// Binds a socket to an outbound network interface by name (`SO_BINDTODEVICE`
/// on Linux).
pub fn bind_to_device(fd: RawFd, name: &str) -> io::Result<()> {
    if name.is_empty() {
        return Ok(());
    }
    let sock = SockRef::from(&Fd(fd));
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
    {
        sock.bind_device(Some(name.as_bytes()))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
    {
        let _ = (sock, name);
        Ok(())
    }
}

/// Marks a listening socket as transparent (`IP_TRANSPARENT` /
/// `IPV6_TRANSPARENT`), required for TPROXY to accept connections/datagrams
/// addressed to non-local IPs.
#[cfg(target_os = "linux")]
pub fn set_ip_transparent(fd: RawFd, v6: bool) -> io::Result<()> {
    let optname = if v6 {
        linux_consts::IPV6_TRANSPARENT
    } else {
        linux_consts::IP_TRANSPARENT
    };
    let level = if v6 { libc::SOL_IPV6 } else { libc::SOL_IP };
    setsockopt_bool(fd, level, optname, true)
}

#[cfg(not(target_os = "linux"))]
pub fn set_ip_transparent(_fd: RawFd, _v6: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_TRANSPARENT is only supported on Linux",
    ))
}

/// Enables receipt of the original destination address ancillary message on
/// a TPROXY UDP socket (`IP_RECVORIGDSTADDR` / `IPV6_RECVORIGDSTADDR`).
#[cfg(target_os = "linux")]
pub fn set_recv_orig_dst_addr(fd: RawFd, v6: bool) -> io::Result<()> {
    let optname = if v6 {
        linux_consts::IPV6_RECVORIGDSTADDR
    } else {
        linux_consts::IP_RECVORIGDSTADDR
    };
    let level = if v6 { libc::SOL_IPV6 } else { libc::SOL_IP };
    setsockopt_bool(fd, level, optname, true)
}

#[cfg(not(target_os = "linux"))]
pub fn set_recv_orig_dst_addr(_fd: RawFd, _v6: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_RECVORIGDSTADDR is only supported on Linux",
    ))
}

/// Binds a UDP socket with `IP_TRANSPARENT` + `IP_FREEBIND`, so it can bind
/// to `addr` even when `addr` is not assigned to a local interface. Used for
/// the TPROXY listener itself and for the per-session reply socket that
/// spoofs its source as the original destination.
pub fn bind_transparent_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    set_ip_transparent(sock.as_raw_fd(), addr.is_ipv6())?;
    set_ip_freebind(sock.as_raw_fd(), addr.is_ipv6())?;
    sock.bind(&addr.into())?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

/// Binds and listens a TCP socket, optionally marking it `IP_TRANSPARENT`
/// for TPROXY-mode services: a transparent listener accepts
/// connections addressed to any destination, which `original_dst::recover`
/// then reads back off `local_addr()`.
pub fn bind_tcp_listener(addr: SocketAddr, transparent: bool, mark: u32) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
    let sock = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    if transparent {
        set_ip_transparent(sock.as_raw_fd(), addr.is_ipv6())?;
        set_ip_freebind(sock.as_raw_fd(), addr.is_ipv6())?;
    }
    set_mark(sock.as_raw_fd(), mark)?;
    sock.bind(&addr.into())?;
    sock.listen(1024)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

/// Recovers the pre-NAT destination of a socket redirected by a netfilter
/// `REDIRECT` target, via the `SO_ORIGINAL_DST` socket option.
#[cfg(target_os = "linux")]
pub fn original_dst(fd: RawFd, peer_is_v6: bool) -> io::Result<SocketAddr> {
    if peer_is_v6 {
        original_dst_v6(fd)
    } else {
        original_dst_v4(fd)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_fd: RawFd, _peer_is_v6: bool) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
fn original_dst_v4(fd: RawFd) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, SocketAddrV4};

    let mut addr: MaybeUninit<libc::sockaddr_in> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            linux_consts::SO_ORIGINAL_DST,
            addr.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let addr = unsafe { addr.assume_init() };
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

#[cfg(target_os = "linux")]
fn original_dst_v6(fd: RawFd) -> io::Result<SocketAddr> {
    use std::net::{Ipv6Addr, SocketAddrV6};

    let mut addr: MaybeUninit<libc::sockaddr_in6> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            linux_consts::SO_ORIGINAL_DST,
            addr.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let addr = unsafe { addr.assume_init() };
    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
    let port = u16::from_be(addr.sin6_port);
    Ok(SocketAddr::V6(SocketAddrV6::new(
        ip,
        port,
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )))
}

#[cfg(target_os = "linux")]
fn setsockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Marks a socket `IP_FREEBIND` (Linux), allowing it to bind to a
/// non-local address. Needed for the UDP reply socket that spoofs its
/// source as the original destination address — this crate uses one
/// `IP_TRANSPARENT` socket per destination rather than a shared socket with
/// per-packet source override.
#[cfg(target_os = "linux")]
pub fn set_ip_freebind(fd: RawFd, v6: bool) -> io::Result<()> {
    let level = if v6 { libc::SOL_IPV6 } else { libc::SOL_IP };
    setsockopt_bool(fd, level, linux_consts::IP_FREEBIND, true)
}

#[cfg(not(target_os = "linux"))]
pub fn set_ip_freebind(_fd: RawFd, _v6: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_FREEBIND is only supported on Linux",
    ))
}

/// Receives one datagram on a TPROXY UDP socket, returning the payload
/// length, the client's source address, and the packet's original
/// destination recovered from the `IP_RECVORIGDSTADDR` /
/// `IPV6_RECVORIGDSTADDR` ancillary message. `None` for the
/// destination means the kernel did not attach the control message (the
/// socket option was not set, or this isn't actually a TPROXY socket).
#[cfg(target_os = "linux")]
pub fn recv_from_with_orig_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
    let mut src_storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // Large enough for either a `cmsghdr` + `sockaddr_in` or `sockaddr_in6`.
    let mut cmsg_buf = [0u8; 128];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = src_storage.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let src_storage = unsafe { src_storage.assume_init() };
    let src = sockaddr_storage_to_socketaddr(&src_storage)?;
    let orig_dst = unsafe { parse_orig_dst_cmsg(&msg) };

    Ok((n as usize, src, orig_dst))
}

#[cfg(not(target_os = "linux"))]
pub fn recv_from_with_orig_dst(
    _fd: RawFd,
    _buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_RECVORIGDSTADDR is only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
unsafe fn parse_orig_dst_cmsg(msg: &libc::msghdr) -> Option<SocketAddr> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        let is_v4 = hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == linux_consts::IP_RECVORIGDSTADDR;
        let is_v6 =
            hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == linux_consts::IPV6_RECVORIGDSTADDR;

        if is_v4 {
            let sa = &*(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            return Some(SocketAddr::new(std::net::IpAddr::V4(ip), port));
        }
        if is_v6 {
            let sa = &*(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            return Some(SocketAddr::new(std::net::IpAddr::V6(ip), port));
        }

        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    None
}

#[cfg(target_os = "linux")]
fn sockaddr_storage_to_socketaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Ok(SocketAddr::new(std::net::IpAddr::V4(ip), port))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Ok(SocketAddr::new(std::net::IpAddr::V6(ip), port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported sockaddr family {family}"),
        )),
    }
}

/// These option numbers are not part of POSIX and are not exposed by the
/// `libc` crate; they come from `linux/in.h` and `linux/netfilter_ipv4.h` and
/// are stable across kernel versions.
#[cfg(target_os = "linux")]
mod linux_consts {
    pub const SO_ORIGINAL_DST: libc::c_int = 80;
    pub const IP_TRANSPARENT: libc::c_int = 19;
    pub const IP_RECVORIGDSTADDR: libc::c_int = 20;
    pub const IPV6_TRANSPARENT: libc::c_int = 75;
    pub const IPV6_RECVORIGDSTADDR: libc::c_int = 74;
    /// `IP_FREEBIND` has no IPv6-specific counterpart; the same option
    /// number applies at `SOL_IP` and `SOL_IPV6` on Linux.
    pub const IP_FREEBIND: libc::c_int = 15;
}

/// Thin `AsRawFd` wrapper so we can construct a borrowed `SockRef` from a
/// bare fd without taking ownership of it.
struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }
}
