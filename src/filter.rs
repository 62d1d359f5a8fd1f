//! Pipeline boundary: what a filter receives, what it returns, and how the
//! host finds it.

use crate::connector::BoxedIo;
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the pipeline in both directions.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Access to the raw client connection behind a request.
///
/// The host implements this for connections that can be taken over after a
/// response head has been written (HTTP/1.1 upgrade).
#[async_trait]
pub trait InboundConnection: Send {
    /// Write `200 OK` with no body to the client. Must be called before `hijack`.
    async fn acknowledge(&mut self) -> Result<(), ProxyError>;

    /// Take ownership of the client byte stream.
    async fn hijack(self: Box<Self>) -> Result<BoxedIo, ProxyError>;
}

/// Per-request state carried through the pipeline.
pub struct RequestContext {
    pub remote_addr: Option<SocketAddr>,
    pub inbound: Option<Box<dyn InboundConnection>>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            inbound: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_inbound(mut self, inbound: Box<dyn InboundConnection>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Remove the inbound capability, failing when the host did not provide one.
    pub fn take_inbound(&mut self) -> Result<Box<dyn InboundConnection>, ProxyError> {
        self.inbound
            .take()
            .ok_or_else(|| ProxyError::Capability("inbound connection cannot be taken over".to_string()))
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("remote_addr", &self.remote_addr)
            .field("inbound", &self.inbound.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

pub enum FilterResponse {
    /// Response for the host to write back to the client.
    Forward(Response<ProxyBody>),
    /// The filter already answered the client on the raw connection.
    Handled,
}

impl std::fmt::Debug for FilterResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterResponse::Forward(resp) => f.debug_tuple("Forward").field(&resp.status()).finish(),
            FilterResponse::Handled => f.write_str("Handled"),
        }
    }
}

#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    async fn round_trip(
        &self,
        ctx: RequestContext,
        req: Request<ProxyBody>,
    ) -> Result<(RequestContext, FilterResponse), ProxyError>;
}

/// Filters by name, built explicitly at startup.
#[derive(Default, Clone)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: Arc<dyn Filter>) -> Result<(), ProxyError> {
        let name = filter.name().to_string();
        if self.filters.contains_key(&name) {
            return Err(ProxyError::Config(format!("Filter {} registered twice", name)));
        }
        self.filters.insert(name, filter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Filter>, ProxyError> {
        self.filters
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::Config(format!("No filter named {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.filters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
