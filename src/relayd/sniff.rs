//! Sniffer: a bounded-read classifier distinguishing TLS 1.0+ ClientHello
//! records, HTTP/1.x request lines, and opaque bytes.
//!
//! Reads a 5-byte TLS record header under a read deadline, branches on
//! `hdr[0]==Handshake && version==TLS1.0`, and otherwise prefix-matches an
//! HTTP method token. The ClientHello `server_name` extension is parsed
//! per RFC 8446 §5.1 / RFC 6066.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::relayd::error::SniffError;

const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const TLS_VERSION_1_0: u16 = 0x0301;
const MAX_HTTP_HEADER_BYTES: usize = 16 * 1024;

/// Method tokens recognised for HTTP sniffing. Longest-first
/// so that `"CONNECT"` is not shadowed by some other token sharing a prefix
/// (none currently do, but the ordering keeps the contract explicit).
const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    Tls { sni: Option<String> },
    Http { host: Option<String>, request_line: String, headers_raw: Vec<u8> },
    Opaque,
}

#[derive(Debug)]
pub struct Sniffed {
    pub result: SniffResult,
    /// The exact bytes consumed from the stream; must be replayed verbatim
    /// ahead of the remainder.
    pub prefix: Vec<u8>,
}

/// Runs the sniff algorithm over `reader`, bounded by `timeout`.
///
/// Never returns a hard failure for "couldn't classify"; only genuine I/O
/// errors (other than timeout-with-partial-data, which degrades to
/// `Opaque`) propagate.
pub async fn sniff<R>(reader: &mut R, timeout: Duration) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = Vec::with_capacity(TLS_RECORD_HEADER_LEN);
    let got = read_some(reader, TLS_RECORD_HEADER_LEN, timeout, &mut prefix).await?;

    if got < TLS_RECORD_HEADER_LEN {
        return Ok(Sniffed {
            result: SniffResult::Opaque,
            prefix,
        });
    }

    if prefix[0] == TLS_HANDSHAKE_CONTENT_TYPE
        && u16::from_be_bytes([prefix[1], prefix[2]]) == TLS_VERSION_1_0
    {
        let record_len = u16::from_be_bytes([prefix[3], prefix[4]]) as usize;
        let mut body = vec![0u8; record_len];
        match tokio::time::timeout(timeout, reader.read_exact(&mut body)).await {
            Ok(Ok(())) => {
                prefix.extend_from_slice(&body);
                let sni = parse_client_hello_sni(&body);
                return Ok(Sniffed {
                    result: SniffResult::Tls { sni },
                    prefix,
                });
            }
            Ok(Err(_)) | Err(_) => {
                // Couldn't read the full record in time; still classify as
                // TLS (the header matched) with no SNI, preserving whatever
                // partial body we did manage to read.
                return Ok(Sniffed {
                    result: SniffResult::Tls { sni: None },
                    prefix,
                });
            }
        }
    }

    if is_http_method_prefix(&prefix) {
        let mut rest = Vec::new();
        read_until_double_crlf(reader, timeout, &mut rest).await?;
        prefix.extend_from_slice(&rest);

        let headers_raw = prefix.clone();
        let (request_line, host) = parse_http_request_head(&prefix);
        return Ok(Sniffed {
            result: SniffResult::Http {
                host,
                request_line,
                headers_raw,
            },
            prefix,
        });
    }

    Ok(Sniffed {
        result: SniffResult::Opaque,
        prefix,
    })
}

/// Reads up to `want` bytes within `timeout`, appending whatever was read to
/// `out` and returning the number of bytes read (which may be less than
/// `want` on EOF).
async fn read_some<R>(
    reader: &mut R,
    want: usize,
    timeout: Duration,
    out: &mut Vec<u8>,
) -> Result<usize, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    let deadline = tokio::time::Instant::now() + timeout;
    while filled < want {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let n = match tokio::time::timeout(remaining, reader.read(&mut buf[filled..])).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(SniffError::Io(err)),
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        filled += n;
    }
    out.extend_from_slice(&buf[..filled]);
    Ok(filled)
}

async fn read_until_double_crlf<R>(
    reader: &mut R,
    timeout: Duration,
    out: &mut Vec<u8>,
) -> Result<(), SniffError>
where
    R: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut byte = [0u8; 1];
    while out.len() < MAX_HTTP_HEADER_BYTES {
        if ends_with_double_crlf(out) {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        let n = match tokio::time::timeout(remaining, reader.read(&mut byte)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(SniffError::Io(err)),
            Err(_) => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        out.push(byte[0]);
    }
    Ok(())
}

fn ends_with_double_crlf(buf: &[u8]) -> bool {
    buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n"
}

/// `prefix` is only the first `TLS_RECORD_HEADER_LEN` bytes read off the
/// wire, shorter than methods like `DELETE`/`OPTIONS`/`CONNECT`. Match
/// either direction: `prefix` is a prefix of the method (method fits within
/// what was read) or the method is a prefix of `prefix` (method is longer
/// than what was read, but agrees on every byte read so far).
fn is_http_method_prefix(prefix: &[u8]) -> bool {
    HTTP_METHODS
        .iter()
        .any(|m| prefix.starts_with(m.as_bytes()) || m.as_bytes().starts_with(prefix))
}

/// Parses the request line and `Host:` header out of a raw HTTP header
/// block. Tolerant of a missing trailing blank line (partial read).
fn parse_http_request_head(buf: &[u8]) -> (String, Option<String>) {
    let text = String::from_utf8_lossy(buf);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("").to_string();

    let mut host = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                host = Some(value.trim().to_string());
            }
        }
    }
    (request_line, host)
}

/// Parses the `server_name` extension (RFC 6066) out of a ClientHello
/// handshake message body (the bytes following the 5-byte record header).
fn parse_client_hello_sni(body: &[u8]) -> Option<String> {
    let mut p = Cursor::new(body);

    let handshake_type = p.u8()?;
    if handshake_type != 1 {
        return None; // not a ClientHello
    }
    let _len = p.u24()?;
    let _client_version = p.u16()?;
    p.skip(32)?; // random

    let session_id_len = p.u8()? as usize;
    p.skip(session_id_len)?;

    let cipher_suites_len = p.u16()? as usize;
    p.skip(cipher_suites_len)?;

    let compression_len = p.u8()? as usize;
    p.skip(compression_len)?;

    if p.remaining() == 0 {
        return None; // no extensions present
    }
    let extensions_len = p.u16()? as usize;
    let ext_end = p.pos + extensions_len;

    while p.pos < ext_end && p.pos < body.len() {
        let ext_type = p.u16()?;
        let ext_len = p.u16()? as usize;
        let ext_start = p.pos;
        if ext_type == 0x0000 {
            // server_name extension
            let mut e = Cursor::new(&body[ext_start..ext_start + ext_len.min(body.len() - ext_start)]);
            let _list_len = e.u16()?;
            let name_type = e.u8()?;
            if name_type == 0 {
                let name_len = e.u16()? as usize;
                let name = e.take(name_len)?;
                return std::str::from_utf8(name).ok().map(|s| s.to_string());
            }
        }
        p.skip(ext_len)?;
    }
    None
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Some(v)
    }

    fn u24(&mut self) -> Option<u32> {
        if self.remaining() < 3 {
            return None;
        }
        let v = u32::from_be_bytes([0, self.buf[self.pos], self.buf[self.pos + 1], self.buf[self.pos + 2]]);
        self.pos += 3;
        Some(v)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Feeds `data` into a duplex pipe and returns the sniff-readable end.
    /// The writer half is spawned so a sniff that reads less than the full
    /// buffer (e.g. the opaque 5-byte case) doesn't deadlock on a full pipe.
    async fn reader_for(data: Vec<u8>) -> tokio::io::DuplexStream {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = tx.write_all(&data).await;
        });
        rx
    }

    fn client_hello_with_sni(sni: &str) -> Vec<u8> {
        let mut hs = Vec::new();
        hs.push(1u8); // ClientHello
        // placeholder for 3-byte length, patched below
        hs.extend_from_slice(&[0, 0, 0]);
        hs.extend_from_slice(&[3, 3]); // client_version
        hs.extend_from_slice(&[0u8; 32]); // random
        hs.push(0); // session_id_len
        hs.extend_from_slice(&[0, 2]); // cipher_suites_len
        hs.extend_from_slice(&[0x13, 0x01]);
        hs.push(1); // compression_len
        hs.push(0);

        let mut ext = Vec::new();
        ext.extend_from_slice(&[0x00, 0x00]); // server_name ext type
        let mut sni_block = Vec::new();
        sni_block.push(0u8); // name_type = host_name
        sni_block.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_block.extend_from_slice(sni.as_bytes());
        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&(sni_block.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(&sni_block);
        ext.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        ext.extend_from_slice(&server_name_list);

        hs.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        hs.extend_from_slice(&ext);

        let body_len = (hs.len() - 4) as u32;
        hs[1] = ((body_len >> 16) & 0xff) as u8;
        hs[2] = ((body_len >> 8) & 0xff) as u8;
        hs[3] = (body_len & 0xff) as u8;

        let mut record = Vec::new();
        record.push(TLS_HANDSHAKE_CONTENT_TYPE);
        record.extend_from_slice(&TLS_VERSION_1_0.to_be_bytes());
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    #[tokio::test]
    async fn sniffs_tls_sni() {
        let data = client_hello_with_sni("example.com");
        let mut reader = reader_for(data.clone()).await;
        let sniffed = sniff(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sniffed.prefix, data);
        match sniffed.result {
            SniffResult::Tls { sni } => assert_eq!(sni.as_deref(), Some("example.com")),
            other => panic!("expected Tls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sniffs_http_host() {
        let data = b"GET /x HTTP/1.1\r\nHost: api.example.com\r\nUser-Agent: t\r\n\r\n".to_vec();
        let mut reader = reader_for(data.clone()).await;
        let sniffed = sniff(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sniffed.prefix, data);
        match sniffed.result {
            SniffResult::Http { host, request_line, .. } => {
                assert_eq!(host.as_deref(), Some("api.example.com"));
                assert_eq!(request_line, "GET /x HTTP/1.1");
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sniffs_http_host_for_method_longer_than_read_prefix() {
        // "DELETE" is 6 bytes, longer than the 5-byte header peek; must
        // still classify as HTTP rather than falling through to Opaque.
        let data = b"DELETE /x HTTP/1.1\r\nHost: api.example.com\r\n\r\n".to_vec();
        let mut reader = reader_for(data.clone()).await;
        let sniffed = sniff(&mut reader, Duration::from_secs(1)).await.unwrap();
        match sniffed.result {
            SniffResult::Http { host, request_line, .. } => {
                assert_eq!(host.as_deref(), Some("api.example.com"));
                assert_eq!(request_line, "DELETE /x HTTP/1.1");
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn opaque_for_unrecognised_bytes() {
        let data = b"\x00\x01\x02\x03\x04\x05".to_vec();
        let mut reader = reader_for(data.clone()).await;
        let sniffed = sniff(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sniffed.result, SniffResult::Opaque);
        assert_eq!(sniffed.prefix, data[..5]);
    }
}
