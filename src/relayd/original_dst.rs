//! OriginalDst: recovers the pre-NAT destination of a transparently-
//! redirected socket.
//!
//! REDIRECT mode reads `SO_ORIGINAL_DST` off the accepted socket; TPROXY
//! mode simply reports the listener's own local address, since the kernel
//! delivered the connection there without rewriting it.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use tokio::net::TcpStream;

use crate::relayd::error::OriginalDstError;
use crate::relayd::net;

/// Recovers the destination a client originally tried to reach.
pub fn recover(conn: &TcpStream, tproxy: bool) -> Result<SocketAddr, OriginalDstError> {
    if tproxy {
        return conn
            .local_addr()
            .map_err(OriginalDstError::Unavailable);
    }

    let peer = conn.peer_addr().map_err(OriginalDstError::Unavailable)?;
    net::original_dst(conn.as_raw_fd(), peer.is_ipv6()).map_err(OriginalDstError::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tproxy_mode_returns_local_addr() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { tokio::net::TcpStream::connect(addr).await });
        let (server_side, _) = listener.accept().await.unwrap();
        client.await.unwrap().unwrap();

        let dst = recover(&server_side, true).unwrap();
        assert_eq!(dst, addr);
    }
}
