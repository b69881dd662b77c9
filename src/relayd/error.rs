use std::time::Duration;

use thiserror::Error;

/// Errors raised while dialing an upstream socket.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial timeout after {0:?}")]
    Timeout(Duration),
    #[error("dial refused: {0}")]
    Refused(#[source] std::io::Error),
    #[error("dial unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("dial failed: {0}")]
    Other(#[source] std::io::Error),
}

/// Errors raised by the HTTP-CONNECT connector.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream proxy denied the connection")]
    UpstreamDenied,
    #[error("upstream proxy connection failed with status {0}")]
    UpstreamFailed(u16),
    #[error("malformed CONNECT response")]
    MalformedResponse,
}

/// Errors raised by `Router::dial`/`Router::bind`.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("resolver: domain {0} does not exist")]
    NxDomain(String),
    #[error("route is empty")]
    EmptyRoute,
    #[error("invalid address {0}: {1}")]
    InvalidAddr(String, #[source] std::io::Error),
}

/// Errors raised by the original-destination recovery path.
#[derive(Debug, Error)]
pub enum OriginalDstError {
    #[error("original destination unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
}

/// Errors raised while sniffing the first bytes of a TCP stream.
///
/// These never abort the handler: the caller downgrades to `Opaque` and
/// continues.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("sniff timed out")]
    Timeout,
    #[error("sniff parse error: {0}")]
    Parse(String),
    #[error("sniff io error: {0}")]
    Io(#[from] std::io::Error),
}
