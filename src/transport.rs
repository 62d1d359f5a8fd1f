use crate::config::{Config, TransportConfig};
use crate::connector::{BoxedIo, OutboundConnector};
use crate::dialer::{ResilientDialer, split_host_port};
use crate::error::ProxyError;
use crate::filter::{BoxError, ProxyBody};
use crate::loopback::LoopbackAddressSet;
use crate::tls::TlsClient;
use crate::upstream::{ConnectorStrategy, UpstreamRouter};
use bytes::Bytes;
use flate2::write::MultiGzDecoder;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HeaderValue, PROXY_AUTHORIZATION,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::debug;
use std::error::Error as StdError;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared client transport: one connector strategy, one TLS configuration
/// and one connection pool for every request this process forwards.
pub struct TransportEndpoint {
    client: Client<OutboundConnector, ProxyBody>,
    connector: OutboundConnector,
    settings: TransportConfig,
}

impl TransportEndpoint {
    pub fn new(connector: OutboundConnector, settings: TransportConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host())
            .build(connector.clone());

        Self {
            client,
            connector,
            settings,
        }
    }

    pub fn from_config(config: &Config, loopback: Arc<LoopbackAddressSet>) -> Result<Self, ProxyError> {
        let strategy = UpstreamRouter::route(&config.proxy)?;
        let dialer = Arc::new(ResilientDialer::from_config(&config.dialer, loopback));
        let tls = TlsClient::from_config(&config.tls, config.transport.tls_handshake_timeout())?;

        debug!(
            "Transport: keep-alive={}, compression={}, max idle per host={}",
            !config.transport.disable_keep_alives,
            !config.transport.disable_compression,
            config.transport.pool_max_idle_per_host()
        );
        Ok(Self::new(
            OutboundConnector::new(dialer, strategy, tls),
            config.transport.clone(),
        ))
    }

    pub fn strategy(&self) -> &ConnectorStrategy {
        self.connector.strategy()
    }

    /// Raw connection to `host:port` for CONNECT tunnelling.
    pub async fn open_raw_connection(&self, host_port: &str) -> Result<BoxedIo, ProxyError> {
        let (host, port) = split_host_port(host_port)?;
        self.connector.open_tunnel(&host, port).await
    }

    /// Send an absolute-form request and return the upstream response.
    pub async fn forward(&self, mut req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        let uri = req.uri().clone();
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(ProxyError::Uri(format!("Request target {} is not absolute", uri)));
        }

        if let ConnectorStrategy::NativeProxy(spec) = self.connector.strategy() {
            if uri.scheme_str() == Some("http") {
                if let Some(auth) = spec.authorization() {
                    let value = HeaderValue::from_str(&auth)
                        .map_err(|e| ProxyError::Config(format!("Invalid proxy credentials: {}", e)))?;
                    req.headers_mut().insert(PROXY_AUTHORIZATION, value);
                }
            }
        }

        if self.settings.disable_keep_alives {
            req.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let decode_gzip = !self.settings.disable_compression
            && req.method() != Method::HEAD
            && !req.headers().contains_key(ACCEPT_ENCODING);
        if decode_gzip {
            req.headers_mut().insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::Transport(format!("{} {}", uri, error_chain(&e))))?;

        if decode_gzip && wants_gzip_decoding(&response) {
            let (mut parts, body) = response.into_parts();
            parts.headers.remove(CONTENT_ENCODING);
            parts.headers.remove(CONTENT_LENGTH);
            return Ok(Response::from_parts(parts, GzipBody::new(body).boxed()));
        }

        Ok(response.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed()))
    }
}

fn wants_gzip_decoding(response: &Response<Incoming>) -> bool {
    let status = response.status();
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return false;
    }
    if response.body().is_end_stream() {
        return false;
    }
    response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Response body decoded frame by frame as it arrives. Every gzip member is
/// decoded, and trailers pass through untouched.
struct GzipBody {
    inner: Incoming,
    decoder: Option<MultiGzDecoder<Vec<u8>>>,
    saw_data: bool,
}

impl GzipBody {
    fn new(inner: Incoming) -> Self {
        Self {
            inner,
            decoder: Some(MultiGzDecoder::new(Vec::new())),
            saw_data: false,
        }
    }
}

fn gzip_error(e: io::Error) -> BoxError {
    Box::new(ProxyError::Transport(format!("Invalid gzip response body: {}", e)))
}

impl Body for GzipBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        loop {
            let Some(decoder) = this.decoder.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let data = match frame.into_data() {
                        Ok(data) => data,
                        Err(trailers) => return Poll::Ready(Some(Ok(trailers))),
                    };
                    if data.is_empty() {
                        continue;
                    }
                    this.saw_data = true;
                    if let Err(e) = decoder.write_all(&data).and_then(|_| decoder.flush()) {
                        this.decoder = None;
                        return Poll::Ready(Some(Err(gzip_error(e))));
                    }
                    let decoded = std::mem::take(decoder.get_mut());
                    if !decoded.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(Bytes::from(decoded)))));
                    }
                }
                Some(Err(e)) => {
                    this.decoder = None;
                    return Poll::Ready(Some(Err(Box::new(e))));
                }
                None => {
                    let Some(decoder) = this.decoder.take() else {
                        return Poll::Ready(None);
                    };
                    if !this.saw_data {
                        return Poll::Ready(None);
                    }
                    return match decoder.finish() {
                        Ok(rest) if rest.is_empty() => Poll::Ready(None),
                        Ok(rest) => Poll::Ready(Some(Ok(Frame::data(Bytes::from(rest))))),
                        Err(e) => Poll::Ready(Some(Err(gzip_error(e)))),
                    };
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.decoder.is_none()
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
