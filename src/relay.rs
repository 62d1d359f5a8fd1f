use crate::connector::BoxedIo;
use crate::error::ProxyError;
use log::{debug, warn};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Time the surviving direction gets to drain after the other one ends.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Owns a hijacked client connection for the lifetime of a tunnel. On drop
/// the write side gets one non-blocking shutdown attempt before the
/// connection is closed, whichever way the session ends.
pub struct InboundGuard {
    io: BoxedIo,
    label: String,
}

impl InboundGuard {
    pub fn new(io: BoxedIo, label: impl Into<String>) -> Self {
        Self {
            io,
            label: label.into(),
        }
    }
}

impl Drop for InboundGuard {
    fn drop(&mut self) {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        if let Poll::Ready(Err(e)) = Pin::new(&mut *self.io).poll_shutdown(&mut cx) {
            debug!("Shutdown of inbound connection for {} failed: {}", self.label, e);
        }
        debug!("Closing inbound connection for {}", self.label);
    }
}

impl AsyncRead for InboundGuard {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for InboundGuard {
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

fn record(result: io::Result<u64>, slot: &mut u64, direction: &str, label: &str) {
    match result {
        Ok(bytes) => {
            *slot = bytes;
            debug!("{}: {} bytes transferred for {}", direction, bytes, label);
        }
        Err(e) => debug!("{}: tunnel for {} ended with error: {}", direction, label, e),
    }
}

fn relay_task_failed(label: &str, e: tokio::task::JoinError) -> ProxyError {
    warn!("Relay task for {} failed: {}", label, e);
    ProxyError::Relay(format!("Upstream -> Client copy for {} failed: {}", label, e))
}

/// Copy bytes between `client` and `upstream` until both directions finish.
///
/// Upstream-to-client runs on a spawned task, client-to-upstream on the
/// calling task. When one direction ends the write half it fed is shut down
/// and the other direction gets `grace` to finish before it is torn down.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    label: &str,
    grace: Duration,
    cancel: CancellationToken,
) -> Result<RelayStats, ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut upstream_to_client = tokio::spawn(async move {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    });

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };
    tokio::pin!(client_to_upstream);

    let mut stats = RelayStats::default();
    tokio::select! {
        _ = cancel.cancelled() => {
            upstream_to_client.abort();
            let _ = upstream_to_client.await;
            debug!("Tunnel for {} cancelled", label);
            return Err(ProxyError::Cancelled);
        }
        result = &mut client_to_upstream => {
            record(result, &mut stats.client_to_upstream, "Client -> Upstream", label);
            tokio::select! {
                _ = cancel.cancelled() => {
                    upstream_to_client.abort();
                    debug!("Tunnel for {} cancelled while draining", label);
                    return Err(ProxyError::Cancelled);
                }
                joined = tokio::time::timeout(grace, &mut upstream_to_client) => match joined {
                    Ok(Ok(result)) => record(result, &mut stats.upstream_to_client, "Upstream -> Client", label),
                    Ok(Err(e)) => return Err(relay_task_failed(label, e)),
                    Err(_) => {
                        debug!("Upstream -> Client for {} still open after {:?}, closing", label, grace);
                        upstream_to_client.abort();
                    }
                },
            }
        }
        joined = &mut upstream_to_client => {
            match joined {
                Ok(result) => record(result, &mut stats.upstream_to_client, "Upstream -> Client", label),
                Err(e) => return Err(relay_task_failed(label, e)),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Tunnel for {} cancelled while draining", label);
                    return Err(ProxyError::Cancelled);
                }
                result = tokio::time::timeout(grace, &mut client_to_upstream) => match result {
                    Ok(result) => record(result, &mut stats.client_to_upstream, "Client -> Upstream", label),
                    Err(_) => debug!("Client -> Upstream for {} still open after {:?}, closing", label, grace),
                },
            }
        }
    }

    debug!("TCP tunnel closed for {}", label);
    Ok(stats)
}
