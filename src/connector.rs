//! Outbound connection strategies plugged into the HTTP client.
//!
//! `OutboundConnector` is a `tower_service::Service<Uri>` so the hyper-util
//! legacy client can pool the connections it produces. The same connector
//! opens raw tunnels for CONNECT requests.

use crate::dialer::ResilientDialer;
use crate::error::ProxyError;
use crate::tls::TlsClient;
use crate::upstream::{ConnectorStrategy, ProxyScheme, UpstreamProxySpec};
use fast_socks5::client::{Config as SocksConfig, Socks5Stream};
use fast_socks5::util::target_addr::TargetAddr;
use fast_socks5::{AuthenticationMethod, Socks5Command};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use log::debug;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_CONNECT_RESPONSE_HEAD: usize = 8 * 1024;

/// Any byte stream usable as an outbound (or hijacked inbound) connection.
pub trait OutboundIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OutboundIo for T {}

pub type BoxedIo = Box<dyn OutboundIo>;

/// Connection handed to the HTTP client. `proxied` makes the client send
/// absolute-form request targets.
pub struct OutboundStream {
    io: BoxedIo,
    proxied: bool,
}

impl std::fmt::Debug for OutboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundStream").field("proxied", &self.proxied).finish_non_exhaustive()
    }
}

impl OutboundStream {
    pub fn new(io: BoxedIo, proxied: bool) -> Self {
        Self { io, proxied }
    }

    pub fn into_inner(self) -> BoxedIo {
        self.io
    }
}

impl AsyncRead for OutboundStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}

impl Connection for OutboundStream {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.proxied)
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

struct ConnectorInner {
    dialer: Arc<ResilientDialer>,
    strategy: ConnectorStrategy,
    tls: TlsClient,
}

#[derive(Clone)]
pub struct OutboundConnector {
    inner: Arc<ConnectorInner>,
}

impl OutboundConnector {
    pub fn new(dialer: Arc<ResilientDialer>, strategy: ConnectorStrategy, tls: TlsClient) -> Self {
        Self {
            inner: Arc::new(ConnectorInner { dialer, strategy, tls }),
        }
    }

    pub fn strategy(&self) -> &ConnectorStrategy {
        &self.inner.strategy
    }

    pub fn tls(&self) -> &TlsClient {
        &self.inner.tls
    }

    fn negotiation_timeout(&self) -> Duration {
        self.inner.tls.handshake_timeout()
    }

    /// Raw byte stream to `host:port`, bypassing HTTP. Used for CONNECT
    /// tunnels and as the transport under TLS origins.
    pub async fn open_tunnel(&self, host: &str, port: u16) -> Result<BoxedIo, ProxyError> {
        let target = join_host_port(host, port);
        debug!("Opening tunnel to {} ({})", target, self.inner.strategy);

        match &self.inner.strategy {
            ConnectorStrategy::Direct => {
                let stream = self.inner.dialer.dial(&target).await?;
                Ok(Box::new(stream))
            }
            ConnectorStrategy::ProxyDial(spec) => self.socks_connect(spec, host, port).await,
            ConnectorStrategy::NativeProxy(spec) => {
                let mut io = self.dial_proxy(spec).await?;
                let auth = spec.authorization();
                negotiate(
                    self.negotiation_timeout(),
                    &spec.host_port(),
                    http_connect(&mut io, &target, auth.as_deref()),
                )
                .await?;
                Ok(io)
            }
        }
    }

    /// Connection for the HTTP client to send a request for `uri` over.
    pub async fn connect_uri(&self, uri: Uri) -> Result<OutboundStream, ProxyError> {
        let https = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            other => {
                return Err(ProxyError::Uri(format!(
                    "Unsupported scheme {:?} in {}",
                    other.unwrap_or(""),
                    uri
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::Uri(format!("Missing host in {}", uri)))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        if let ConnectorStrategy::NativeProxy(spec) = &self.inner.strategy {
            if !https {
                // plain HTTP goes to the proxy itself in absolute form
                let io = self.dial_proxy(spec).await?;
                return Ok(OutboundStream::new(io, true));
            }
        }

        let tunnel = self.open_tunnel(host, port).await?;
        if https {
            let tls = self.inner.tls.connect(host, tunnel).await?;
            Ok(OutboundStream::new(Box::new(tls), false))
        } else {
            Ok(OutboundStream::new(tunnel, false))
        }
    }

    async fn dial_proxy(&self, spec: &UpstreamProxySpec) -> Result<BoxedIo, ProxyError> {
        let stream = self
            .inner
            .dialer
            .dial_trusted(&spec.host_port())
            .await
            .map_err(|e| ProxyError::Upstream(format!("Cannot reach upstream proxy {}: {}", spec.host_port(), e)))?;

        if spec.scheme == ProxyScheme::Https {
            let tls = self.inner.tls.connect(&spec.host, stream).await?;
            Ok(Box::new(tls))
        } else {
            Ok(Box::new(stream))
        }
    }

    async fn socks_connect(&self, spec: &UpstreamProxySpec, host: &str, port: u16) -> Result<BoxedIo, ProxyError> {
        let proxy = self
            .inner
            .dialer
            .dial_trusted(&spec.host_port())
            .await
            .map_err(|e| ProxyError::Upstream(format!("Cannot reach SOCKS5 proxy {}: {}", spec.host_port(), e)))?;

        let auth = spec.credentials.as_ref().map(|c| AuthenticationMethod::Password {
            username: c.username.clone(),
            password: c.password.clone(),
        });
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let target = match bare_host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(bare_host.to_string(), port),
        };

        let handshake = async {
            let mut stream = Socks5Stream::use_stream(proxy, auth, SocksConfig::default())
                .await
                .map_err(|e| ProxyError::Upstream(format!("SOCKS5 handshake with {} failed: {}", spec.host_port(), e)))?;
            stream
                .request(Socks5Command::TCPConnect, target)
                .await
                .map_err(|e| {
                    ProxyError::Upstream(format!(
                        "SOCKS5 proxy {} could not connect to {}: {}",
                        spec.host_port(),
                        join_host_port(host, port),
                        e
                    ))
                })?;
            Ok::<_, ProxyError>(stream)
        };

        let stream = negotiate(self.negotiation_timeout(), &spec.host_port(), handshake).await?;
        Ok(Box::new(stream))
    }
}

async fn negotiate<T, F>(limit: Duration, proxy: &str, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProxyError::Upstream(format!("Negotiation with upstream proxy {} timed out", proxy)))?
}

/// Ask an HTTP proxy to open a tunnel to `target`.
///
/// The response head is consumed byte by byte so nothing past the blank line
/// is taken from the tunnel.
pub async fn http_connect<IO>(io: &mut IO, target: &str, authorization: Option<&str>) -> Result<(), ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = match authorization {
        Some(auth) => format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\n\r\n",
            target, target, auth
        ),
        None => format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target),
    };
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE_HEAD {
            return Err(ProxyError::Upstream(format!(
                "CONNECT response for {} exceeds {} bytes",
                target, MAX_CONNECT_RESPONSE_HEAD
            )));
        }
        if io.read(&mut byte).await? == 0 {
            return Err(ProxyError::Upstream(format!(
                "Upstream proxy closed the connection during CONNECT to {}",
                target
            )));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse::<u16>().ok());

    match code {
        Some(code) if version.starts_with("HTTP/1.") && (200..300).contains(&code) => {
            debug!("Upstream proxy established tunnel to {}", target);
            Ok(())
        }
        _ => Err(ProxyError::Upstream(format!(
            "Upstream proxy rejected CONNECT to {}: {}",
            target, status_line
        ))),
    }
}

impl tower_service::Service<Uri> for OutboundConnector {
    type Response = TokioIo<OutboundStream>;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move { connector.connect_uri(uri).await.map(TokioIo::new) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DialerConfig, TlsClientConfig};
    use crate::loopback::LoopbackAddressSet;
    use tokio::net::{TcpListener, TcpStream};

    fn connector(strategy: ConnectorStrategy) -> OutboundConnector {
        let dialer = ResilientDialer::from_config(
            &DialerConfig {
                retry_times: 0,
                ..DialerConfig::default()
            },
            Arc::new(LoopbackAddressSet::empty()),
        );
        let tls = TlsClient::from_config(&TlsClientConfig::default(), Duration::from_secs(2)).unwrap();
        OutboundConnector::new(Arc::new(dialer), strategy, tls)
    }

    async fn read_head(socket: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 443), "example.com:443");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn test_http_connect_accepts_200_and_keeps_tunnel_bytes() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = proxy.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\nVia: stub\r\n\r\nhello")
                .await
                .unwrap();
            request
        });

        http_connect(&mut client, "origin.test:443", Some("Basic dXNlcjpwYXNz")).await.unwrap();
        let mut rest = [0u8; 5];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_rejection() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = proxy.read(&mut buf).await;
            let _ = proxy
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let err = http_connect(&mut client, "origin.test:443", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(ref m) if m.contains("407")));
    }

    #[tokio::test]
    async fn test_native_proxy_plain_http_is_proxied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let spec = UpstreamProxySpec::parse(&format!("http://{}", addr)).unwrap();
        let connector = connector(ConnectorStrategy::NativeProxy(spec));

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connector
            .connect_uri("http://origin.test/index.html".parse().unwrap())
            .await
            .unwrap();
        assert!(stream.connected().is_proxied());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_native_proxy_tunnel_sends_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let spec = UpstreamProxySpec::parse(&format!("http://user:secret@{}", addr)).unwrap();
        let connector = connector(ConnectorStrategy::NativeProxy(spec));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_head(&mut socket).await;
            socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
            head
        });

        connector.open_tunnel("origin.test", 8443).await.unwrap();
        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT origin.test:8443 HTTP/1.1"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ="));
    }

    #[tokio::test]
    async fn test_direct_connect_is_not_proxied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = connector(ConnectorStrategy::Direct);

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let uri: Uri = format!("http://{}/", addr).parse().unwrap();
        let stream = connector.connect_uri(uri).await.unwrap();
        assert!(!stream.connected().is_proxied());
        accept.await.unwrap();

        let err = connector
            .connect_uri("ftp://origin.test/".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Uri(_)));
    }
}
