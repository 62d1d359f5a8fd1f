use crate::config::Config;
use crate::error::ProxyError;
use crate::filter::{Filter, FilterResponse, ProxyBody, RequestContext};
use crate::loopback::LoopbackAddressSet;
use crate::relay::{DEFAULT_GRACE_PERIOD, InboundGuard, relay};
use crate::transport::TransportEndpoint;
use async_trait::async_trait;
use hyper::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderMap, HeaderName};
use hyper::{Method, Request, Uri};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const FILTER_NAME: &str = "direct";

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Rewrite an origin-form request target to absolute form using the Host
/// header. Absolute targets are left untouched.
pub fn normalize_request_url<B>(req: &mut Request<B>) -> Result<(), ProxyError> {
    let original = req.uri();
    if original.scheme().is_some() && original.authority().is_some() {
        return Ok(());
    }

    let host = req
        .headers()
        .get(HOST)
        .ok_or_else(|| ProxyError::Uri(format!("Cannot determine target URI for {}", original)))?
        .to_str()
        .map_err(|e| ProxyError::Uri(format!("Invalid Host header: {}", e)))?;

    let path = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = Url::parse(&format!("http://{}{}", host, path))?;
    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::Uri(e.to_string()))?;

    *req.uri_mut() = uri;
    Ok(())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn connect_target<B>(req: &Request<B>) -> Result<String, ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::Uri(format!("Invalid CONNECT target {}", req.uri())))?;

    Ok(match authority.port_u16() {
        Some(_) => authority.as_str().to_string(),
        None => format!("{}:443", authority.host()),
    })
}

/// Outbound leg of the pipeline: tunnels CONNECT requests and forwards
/// everything else, directly or through the configured upstream proxy.
pub struct DirectFilter {
    transport: Arc<TransportEndpoint>,
    grace: Duration,
}

impl DirectFilter {
    pub fn new(config: &Config) -> Result<Self, ProxyError> {
        Self::with_loopback(config, Arc::new(LoopbackAddressSet::detect()))
    }

    pub fn with_loopback(config: &Config, loopback: Arc<LoopbackAddressSet>) -> Result<Self, ProxyError> {
        let transport = TransportEndpoint::from_config(config, loopback)?;
        info!("Direct filter ready ({})", transport.strategy());
        Ok(Self::with_transport(Arc::new(transport)))
    }

    pub fn with_transport(transport: Arc<TransportEndpoint>) -> Self {
        Self {
            transport,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn transport(&self) -> &Arc<TransportEndpoint> {
        &self.transport
    }

    async fn tunnel(
        &self,
        mut ctx: RequestContext,
        req: Request<ProxyBody>,
    ) -> Result<(RequestContext, FilterResponse), ProxyError> {
        let target = connect_target(&req)?;
        let remote = ctx.remote_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        info!("{} \"DIRECT CONNECT {} {:?}\"", remote, target, req.version());

        let mut inbound = ctx.take_inbound()?;
        let upstream = self.transport.open_raw_connection(&target).await?;

        inbound.acknowledge().await?;
        let client = InboundGuard::new(inbound.hijack().await?, target.clone());

        let stats = relay(client, upstream, &target, self.grace, ctx.cancel.clone()).await?;
        debug!(
            "{} tunnel to {} closed: {} bytes sent, {} bytes received",
            remote, target, stats.client_to_upstream, stats.upstream_to_client
        );
        Ok((ctx, FilterResponse::Handled))
    }

    async fn forward(
        &self,
        ctx: RequestContext,
        mut req: Request<ProxyBody>,
    ) -> Result<(RequestContext, FilterResponse), ProxyError> {
        normalize_request_url(&mut req)?;
        strip_hop_by_hop(req.headers_mut());

        let method = req.method().clone();
        let url = req.uri().to_string();
        let version = req.version();

        let mut resp = self.transport.forward(req).await?;
        strip_hop_by_hop(resp.headers_mut());

        if let Some(remote) = ctx.remote_addr {
            let content_length = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            info!(
                "{} \"DIRECT {} {} {:?}\" {} {}",
                remote,
                method,
                url,
                version,
                resp.status().as_u16(),
                content_length
            );
        }
        Ok((ctx, FilterResponse::Forward(resp)))
    }
}

#[async_trait]
impl Filter for DirectFilter {
    fn name(&self) -> &str {
        FILTER_NAME
    }

    async fn round_trip(
        &self,
        ctx: RequestContext,
        req: Request<ProxyBody>,
    ) -> Result<(RequestContext, FilterResponse), ProxyError> {
        if req.method() == Method::CONNECT {
            self.tunnel(ctx, req).await
        } else {
            self.forward(ctx, req).await
        }
    }
}
