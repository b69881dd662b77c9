//! A boxable byte stream, the common currency passed between Dialer, Route,
//! and Connector. Modeled on the `AsyncStream`/`BoxedStream` pair from the
//! tunnel transport registry this workspace already uses for its other
//! pluggable-transport surface.

use tokio::io::{AsyncRead, AsyncWrite};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
