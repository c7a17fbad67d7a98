//! PROXY protocol v1/v2 support.
//!
//! An L4 load balancer in front of the gatekeeper prepends a PROXY
//! header to each connection carrying the original client address. The
//! listener wrapper parses the header (v1 text or v2 binary) before the
//! HTTP request is read and hands the parsed result to the HTTP layer as
//! connection info. Connections without a header still work: the sniffed
//! bytes are replayed into the HTTP parser.
//!
//! The same wire format is spoken on the upstream side when PROXY
//! forwarding is enabled; see [`encode_header`].

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// v2 signature bytes.
const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Longest legal v1 line, including CRLF.
const V1_MAX_LEN: usize = 107;

/// A parsed PROXY header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: u8,
    /// Original client address; None for UNKNOWN/LOCAL connections.
    pub source: Option<SocketAddr>,
    pub dest: Option<SocketAddr>,
}

/// Per-connection info handed to the HTTP layer.
#[derive(Debug, Clone)]
pub struct ClientConn {
    /// Immediate TCP peer (the load balancer when proxied)
    pub peer: SocketAddr,
    /// Parsed PROXY header, when one was present
    pub proxy: Option<ProxyHeader>,
}

impl ClientConn {
    /// The best-known real client address: PROXY source if present,
    /// otherwise the TCP peer.
    pub fn client_addr(&self) -> SocketAddr {
        self.proxy
            .as_ref()
            .and_then(|h| h.source)
            .unwrap_or(self.peer)
    }
}

/// Read a PROXY header off the front of a connection. Returns the parsed
/// header and any bytes that were sniffed but belong to the application
/// stream (only when no header was present).
pub async fn read_proxy_header<R>(
    stream: &mut R,
) -> io::Result<(Option<ProxyHeader>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut sig = [0u8; 12];
    stream.read_exact(&mut sig).await?;

    if sig == V2_SIGNATURE {
        let header = read_v2_body(stream).await?;
        return Ok((Some(header), Vec::new()));
    }

    if &sig[..6] == b"PROXY " {
        let header = read_v1_rest(stream, &sig[6..]).await?;
        return Ok((Some(header), Vec::new()));
    }

    // Not a PROXY connection; replay the sniffed bytes.
    Ok((None, sig.to_vec()))
}

async fn read_v2_body<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<ProxyHeader> {
    let mut meta = [0u8; 4];
    stream.read_exact(&mut meta).await?;

    let ver_cmd = meta[0];
    let fam_proto = meta[1];
    let len = u16::from_be_bytes([meta[2], meta[3]]) as usize;

    if ver_cmd >> 4 != 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported PROXY v2 version nibble {:#x}", ver_cmd >> 4),
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    // LOCAL command: health checks from the balancer itself.
    if ver_cmd & 0x0f == 0 {
        return Ok(ProxyHeader {
            version: 2,
            source: None,
            dest: None,
        });
    }

    match fam_proto >> 4 {
        // AF_INET
        1 => {
            if body.len() < 12 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "short PROXY v2 IPv4 address block",
                ));
            }
            let src_ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let dst_ip = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
            let src_port = u16::from_be_bytes([body[8], body[9]]);
            let dst_port = u16::from_be_bytes([body[10], body[11]]);
            Ok(ProxyHeader {
                version: 2,
                source: Some(SocketAddr::new(IpAddr::V4(src_ip), src_port)),
                dest: Some(SocketAddr::new(IpAddr::V4(dst_ip), dst_port)),
            })
        }
        // AF_INET6
        2 => {
            if body.len() < 36 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "short PROXY v2 IPv6 address block",
                ));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&body[0..16]);
            dst.copy_from_slice(&body[16..32]);
            let src_port = u16::from_be_bytes([body[32], body[33]]);
            let dst_port = u16::from_be_bytes([body[34], body[35]]);
            Ok(ProxyHeader {
                version: 2,
                source: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port)),
                dest: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port)),
            })
        }
        // AF_UNSPEC / AF_UNIX: nothing useful to extract.
        _ => Ok(ProxyHeader {
            version: 2,
            source: None,
            dest: None,
        }),
    }
}

async fn read_v1_rest<R: AsyncRead + Unpin>(
    stream: &mut R,
    already: &[u8],
) -> io::Result<ProxyHeader> {
    let mut line = already.to_vec();

    while !line.ends_with(b"\r\n") {
        if line.len() + 6 > V1_MAX_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "PROXY v1 line too long",
            ));
        }
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
    }

    let line = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "PROXY v1 line is not ASCII"))?;

    parse_v1_fields(line)
}

fn parse_v1_fields(line: &str) -> io::Result<ProxyHeader> {
    let mut fields = line.split(' ');
    let family = fields
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty PROXY v1 line"))?;

    if family == "UNKNOWN" {
        return Ok(ProxyHeader {
            version: 1,
            source: None,
            dest: None,
        });
    }

    if family != "TCP4" && family != "TCP6" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown PROXY v1 family {family:?}"),
        ));
    }

    let parse_ip = |s: Option<&str>| -> io::Result<IpAddr> {
        s.and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad PROXY v1 address"))
    };
    let parse_port = |s: Option<&str>| -> io::Result<u16> {
        s.and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad PROXY v1 port"))
    };

    let src_ip = parse_ip(fields.next())?;
    let dst_ip = parse_ip(fields.next())?;
    let src_port = parse_port(fields.next())?;
    let dst_port = parse_port(fields.next())?;

    Ok(ProxyHeader {
        version: 1,
        source: Some(SocketAddr::new(src_ip, src_port)),
        dest: Some(SocketAddr::new(dst_ip, dst_port)),
    })
}

/// Encode a PROXY header for an upstream dial. The original destination
/// is unknown at this point, so the destination address is all zeroes in
/// the same family as the source.
pub fn encode_header(version: u8, source: SocketAddr) -> Vec<u8> {
    match version {
        2 => {
            let mut out = Vec::with_capacity(16 + 36);
            out.extend_from_slice(&V2_SIGNATURE);
            // version 2, PROXY command
            out.push(0x21);
            match source {
                SocketAddr::V4(addr) => {
                    // AF_INET, STREAM
                    out.push(0x11);
                    out.extend_from_slice(&12u16.to_be_bytes());
                    out.extend_from_slice(&addr.ip().octets());
                    out.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
                    out.extend_from_slice(&addr.port().to_be_bytes());
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
                SocketAddr::V6(addr) => {
                    // AF_INET6, STREAM
                    out.push(0x21);
                    out.extend_from_slice(&36u16.to_be_bytes());
                    out.extend_from_slice(&addr.ip().octets());
                    out.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
                    out.extend_from_slice(&addr.port().to_be_bytes());
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
            }
            out
        }
        _ => match source {
            SocketAddr::V4(addr) => {
                format!("PROXY TCP4 {} 0.0.0.0 {} 0\r\n", addr.ip(), addr.port()).into_bytes()
            }
            SocketAddr::V6(addr) => {
                format!("PROXY TCP6 {} :: {} 0\r\n", addr.ip(), addr.port()).into_bytes()
            }
        },
    }
}

/// A stream with some already-read bytes stitched back onto the front.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// TCP listener that optionally strips PROXY headers off new
/// connections before axum sees them.
pub struct ProxyProtoListener {
    inner: TcpListener,
    enabled: bool,
    header_timeout: Duration,
}

impl ProxyProtoListener {
    pub fn new(inner: TcpListener, enabled: bool, header_timeout: Duration) -> Self {
        Self {
            inner,
            enabled,
            header_timeout,
        }
    }
}

impl axum::serve::Listener for ProxyProtoListener {
    type Io = PrefixedStream<TcpStream>;
    type Addr = ClientConn;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (mut stream, peer) = match self.inner.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            if !self.enabled {
                return (
                    PrefixedStream::new(Vec::new(), stream),
                    ClientConn { peer, proxy: None },
                );
            }

            match tokio::time::timeout(self.header_timeout, read_proxy_header(&mut stream)).await
            {
                Ok(Ok((proxy, leftover))) => {
                    if let Some(header) = &proxy {
                        debug!(peer = %peer, source = ?header.source, "parsed PROXY header");
                    }
                    return (
                        PrefixedStream::new(leftover, stream),
                        ClientConn { peer, proxy },
                    );
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "bad PROXY header; dropping connection");
                }
                Err(_) => {
                    warn!(peer = %peer, "timed out reading PROXY header; dropping connection");
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(ClientConn {
            peer: self.inner.local_addr()?,
            proxy: None,
        })
    }
}

impl Connected<IncomingStream<'_, ProxyProtoListener>> for ClientConn {
    fn connect_info(stream: IncomingStream<'_, ProxyProtoListener>) -> Self {
        stream.remote_addr().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> io::Result<(Option<ProxyHeader>, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(bytes.to_vec());
        read_proxy_header(&mut cursor).await
    }

    #[tokio::test]
    async fn test_v1_tcp4() {
        let (header, leftover) = parse(b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nGET /")
            .await
            .unwrap();
        let header = header.unwrap();

        assert_eq!(header.version, 1);
        assert_eq!(
            header.source,
            Some("192.168.0.1:56324".parse().unwrap())
        );
        assert_eq!(header.dest, Some("192.168.0.11:443".parse().unwrap()));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_v1_tcp6() {
        let (header, _) = parse(b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 443\r\n")
            .await
            .unwrap();
        let header = header.unwrap();
        assert_eq!(header.source, Some("[2001:db8::1]:4000".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_v1_unknown() {
        let (header, _) = parse(b"PROXY UNKNOWN\r\n").await.unwrap();
        let header = header.unwrap();
        assert_eq!(header.version, 1);
        assert!(header.source.is_none());
    }

    #[tokio::test]
    async fn test_v1_garbage_rejected() {
        assert!(parse(b"PROXY TCP4 not-an-ip x y z\r\n").await.is_err());
    }

    #[tokio::test]
    async fn test_v2_ipv4_roundtrip() {
        let source: SocketAddr = "10.1.2.3:9999".parse().unwrap();
        let encoded = encode_header(2, source);

        let (header, leftover) = parse(&encoded).await.unwrap();
        let header = header.unwrap();

        assert_eq!(header.version, 2);
        assert_eq!(header.source, Some(source));
        assert_eq!(header.dest, Some("0.0.0.0:0".parse().unwrap()));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_v2_ipv6_roundtrip() {
        let source: SocketAddr = "[2001:db8::7]:443".parse().unwrap();
        let encoded = encode_header(2, source);

        let (header, _) = parse(&encoded).await.unwrap();
        assert_eq!(header.unwrap().source, Some(source));
    }

    #[tokio::test]
    async fn test_v1_encode_zero_dest() {
        let source: SocketAddr = "10.1.2.3:9999".parse().unwrap();
        let encoded = encode_header(1, source);
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            "PROXY TCP4 10.1.2.3 0.0.0.0 9999 0\r\n"
        );
    }

    #[tokio::test]
    async fn test_plain_http_passes_through() {
        let (header, leftover) = parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        assert!(header.is_none());
        // The sniffed bytes must be replayed to the HTTP parser intact.
        assert_eq!(&leftover, b"GET / HTTP/1");
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_prefix() {
        use tokio::io::AsyncReadExt;

        let inner = std::io::Cursor::new(b" world".to_vec());
        let mut stream = PrefixedStream::new(b"hello".to_vec(), inner);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_client_conn_prefers_proxy_source() {
        let peer: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let source: SocketAddr = "9.8.7.6:5432".parse().unwrap();

        let conn = ClientConn {
            peer,
            proxy: Some(ProxyHeader {
                version: 2,
                source: Some(source),
                dest: None,
            }),
        };
        assert_eq!(conn.client_addr(), source);

        let plain = ClientConn { peer, proxy: None };
        assert_eq!(plain.client_addr(), peer);
    }
}
