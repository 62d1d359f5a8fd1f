use crate::config::Config;
use crate::connector::BoxedIo;
use crate::error::ProxyError;
use crate::filter::{BoxError, Filter, FilterRegistry, FilterResponse, InboundConnection, ProxyBody, RequestContext, empty, full};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

type FilterResult = Result<(RequestContext, FilterResponse), ProxyError>;

/// Inbound capability backed by a hyper HTTP/1.1 connection.
struct HyperInbound {
    ack: Option<oneshot::Sender<Response<ProxyBody>>>,
    on_upgrade: OnUpgrade,
}

#[async_trait]
impl InboundConnection for HyperInbound {
    async fn acknowledge(&mut self) -> Result<(), ProxyError> {
        let ack = self
            .ack
            .take()
            .ok_or_else(|| ProxyError::Capability("request already acknowledged".to_string()))?;
        ack.send(Response::new(empty()))
            .map_err(|_| ProxyError::Capability("client went away before acknowledgment".to_string()))
    }

    async fn hijack(self: Box<Self>) -> Result<BoxedIo, ProxyError> {
        let this = *self;
        if this.ack.is_some() {
            return Err(ProxyError::Capability("connection must be acknowledged before takeover".to_string()));
        }
        // resolves once hyper has flushed the 200 head
        let upgraded = this
            .on_upgrade
            .await
            .map_err(|e| ProxyError::Http(format!("Failed to upgrade connection: {}", e)))?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

/// Aborts the filter task if the service future is dropped first.
struct AbortGuard(Option<AbortHandle>);

impl AbortGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut resp = Response::new(full(format!("{}\n", err)));
    *resp.status_mut() = err.status_code();
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

fn finish(remote_addr: SocketAddr, joined: Result<FilterResult, JoinError>) -> Response<ProxyBody> {
    match joined {
        Ok(Ok((_, FilterResponse::Forward(resp)))) => resp,
        Ok(Ok((_, FilterResponse::Handled))) => {
            warn!("Filter claimed request from {} without acknowledging it", remote_addr);
            error_response(&ProxyError::Capability("request handled without acknowledgment".to_string()))
        }
        Ok(Err(e)) => {
            warn!("{} request failed: {}", remote_addr, e);
            error_response(&e)
        }
        Err(e) => {
            error!("Filter task for {} failed: {}", remote_addr, e);
            let mut resp = Response::new(empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

async fn watch_tunnel(remote_addr: SocketAddr, task: JoinHandle<FilterResult>) {
    match task.await {
        Ok(Err(e)) => warn!("{} tunnel ended with error: {}", remote_addr, e),
        Err(e) if e.is_panic() => error!("Tunnel task for {} panicked", remote_addr),
        _ => {}
    }
}

async fn handle_request(
    filter: Arc<dyn Filter>,
    remote_addr: SocketAddr,
    shutdown: CancellationToken,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    let on_upgrade = hyper::upgrade::on(&mut req);
    let req = req.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed());

    let (ack_tx, mut ack_rx) = oneshot::channel();
    let inbound = HyperInbound {
        ack: Some(ack_tx),
        on_upgrade,
    };
    let ctx = RequestContext::new(Some(remote_addr))
        .with_inbound(Box::new(inbound))
        .with_cancel(shutdown.child_token());

    let mut task = tokio::spawn(async move { filter.round_trip(ctx, req).await });
    let mut guard = AbortGuard(Some(task.abort_handle()));

    tokio::select! {
        ack = &mut ack_rx => {
            if let Ok(resp) = ack {
                // the filter owns the connection from here on
                guard.disarm();
                tokio::spawn(watch_tunnel(remote_addr, task));
                return Ok(resp);
            }
        }
        joined = &mut task => {
            guard.disarm();
            return Ok(finish(remote_addr, joined));
        }
    }

    // capability dropped without acknowledgment; the filter result decides
    let joined = task.await;
    guard.disarm();
    Ok(finish(remote_addr, joined))
}

/// HTTP/1.1 host that dispatches every inbound request to one filter.
pub struct ProxyServer {
    addr: SocketAddr,
    filter: Arc<dyn Filter>,
}

impl ProxyServer {
    pub fn new(addr: SocketAddr, filter: Arc<dyn Filter>) -> Self {
        Self { addr, filter }
    }

    pub fn from_registry(config: &Config, registry: &FilterRegistry) -> Result<Self, ProxyError> {
        let filter = registry.get(&config.filter)?;
        Ok(Self::new(config.listen_addr, filter))
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!("Binding HTTP listener to: {}", self.addr);
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        info!(
            "Forward proxy listening on: http://{} (filter: {})",
            local_addr,
            self.filter.name()
        );

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener on {} shutting down", local_addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            debug!("Accepted connection from {}", remote_addr);

            let filter = self.filter.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let service =
                    service_fn(move |req| handle_request(filter.clone(), remote_addr, shutdown.clone(), req));
                if let Err(err) = ServerBuilder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TlsClientConfig, TransportConfig};
    use crate::connector::OutboundConnector;
    use crate::dialer::{BaseConnector, ResilientDialer};
    use crate::direct::DirectFilter;
    use crate::dns_cache::AddressCache;
    use crate::loopback::LoopbackAddressSet;
    use crate::tls::TlsClient;
    use crate::transport::TransportEndpoint;
    use crate::upstream::ConnectorStrategy;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Connector whose dial never completes; records when the dial future is dropped.
    struct StalledConnector {
        started: Arc<Notify>,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BaseConnector for StalledConnector {
        async fn connect(&self, _addr: SocketAddr) -> io::Result<TcpStream> {
            let _flag = SetOnDrop(self.dropped.clone());
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"))
        }
    }

    #[tokio::test]
    async fn test_error_response_uses_status_mapping() {
        let err = ProxyError::Dial {
            target: "origin.test:443".to_string(),
            attempts: 2,
            source: io::Error::new(io::ErrorKind::TimedOut, "timed out"),
        };
        let resp = error_response(&err);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("origin.test:443"));
    }

    #[test]
    fn test_from_registry_requires_known_filter() {
        let config = Config {
            filter: "missing".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            ProxyServer::from_registry(&config, &FilterRegistry::new()),
            Err(ProxyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_client_disconnect_aborts_pending_dial() {
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let dialer = ResilientDialer::new(
            Arc::new(AddressCache::new(16, Duration::from_secs(60))),
            Arc::new(LoopbackAddressSet::empty()),
            Arc::new(StalledConnector {
                started: started.clone(),
                dropped: dropped.clone(),
            }),
            false,
            0,
            Duration::from_millis(10),
        );
        let tls = TlsClient::from_config(&TlsClientConfig::default(), Duration::from_secs(5)).unwrap();
        let connector = OutboundConnector::new(Arc::new(dialer), ConnectorStrategy::Direct, tls);
        let transport = TransportEndpoint::new(connector, TransportConfig::default());
        let filter = DirectFilter::with_transport(Arc::new(transport));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(ProxyServer::new(proxy_addr, Arc::new(filter)).serve(listener, shutdown.clone()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"CONNECT 192.0.2.1:443 HTTP/1.1\r\nHost: 192.0.2.1:443\r\n\r\n")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), started.notified())
            .await
            .expect("dial should start");
        assert!(!dropped.load(Ordering::SeqCst));

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("filter task should be aborted once the client disconnects");
        shutdown.cancel();
    }
}
