use crate::config::DialerConfig;
use crate::dns_cache::AddressCache;
use crate::error::ProxyError;
use crate::loopback::LoopbackAddressSet;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Opens a single TCP connection to a resolved address.
#[async_trait]
pub trait BaseConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP connector applying the dial timeout and keep-alive interval.
pub struct TcpConnector {
    timeout: Duration,
    keep_alive: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration, keep_alive: Duration) -> Self {
        Self { timeout, keep_alive }
    }
}

#[async_trait]
impl BaseConnector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, self.timeout),
                ));
            }
        };

        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(self.keep_alive);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok(stream)
    }
}

/// One pass over the candidate list inside the retry loop.
struct DialAttempt<'a> {
    target: &'a str,
    index: u32,
    outcome: Result<SocketAddr, &'a io::Error>,
    elapsed: Duration,
}

impl fmt::Display for DialAttempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(addr) => write!(
                f,
                "dial {} attempt {} connected to {} in {:?}",
                self.target, self.index, addr, self.elapsed
            ),
            Err(e) => write!(
                f,
                "dial {} attempt {} failed after {:?}: {}",
                self.target, self.index, self.elapsed, e
            ),
        }
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(target: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Uri(format!("missing port in address {}", target)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::Uri(format!("invalid port in address {}", target)))?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .ok_or_else(|| ProxyError::Uri(format!("unterminated IPv6 literal in {}", target)))?
    } else if host.contains(':') {
        return Err(ProxyError::Uri(format!("IPv6 literal must be bracketed in {}", target)));
    } else {
        host
    };

    if host.is_empty() {
        return Err(ProxyError::Uri(format!("missing host in address {}", target)));
    }
    Ok((host.to_string(), port))
}

/// Dialer with cached resolution, loop protection and retry.
pub struct ResilientDialer {
    cache: Arc<AddressCache>,
    loopback: Arc<LoopbackAddressSet>,
    connector: Arc<dyn BaseConnector>,
    dual_stack: bool,
    retry_times: u32,
    retry_delay: Duration,
}

impl ResilientDialer {
    pub fn new(
        cache: Arc<AddressCache>,
        loopback: Arc<LoopbackAddressSet>,
        connector: Arc<dyn BaseConnector>,
        dual_stack: bool,
        retry_times: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            cache,
            loopback,
            connector,
            dual_stack,
            retry_times,
            retry_delay,
        }
    }

    pub fn from_config(config: &DialerConfig, loopback: Arc<LoopbackAddressSet>) -> Self {
        let cache = Arc::new(AddressCache::new(config.dns_cache_capacity(), config.dns_cache_expiry()));
        let connector = Arc::new(TcpConnector::new(config.timeout(), config.keep_alive()));
        Self::new(
            cache,
            loopback,
            connector,
            config.dual_stack,
            config.retry_times,
            config.retry_delay(),
        )
    }

    pub fn address_cache(&self) -> &Arc<AddressCache> {
        &self.cache
    }

    /// Connect to `host:port`, refusing targets that resolve back to this host.
    pub async fn dial(&self, target: &str) -> Result<TcpStream, ProxyError> {
        self.dial_checked(target, true).await
    }

    /// Connect without the loop check. Used for the configured upstream proxy,
    /// which may legitimately run on this host.
    pub async fn dial_trusted(&self, target: &str) -> Result<TcpStream, ProxyError> {
        self.dial_checked(target, false).await
    }

    async fn dial_checked(&self, target: &str, check_loop: bool) -> Result<TcpStream, ProxyError> {
        let (host, port) = split_host_port(target)?;
        let (addrs, from_cache) = self.cache.resolve(&host).await?;
        debug!("Resolved {} to {:?} (cached: {})", host, addrs, from_cache);

        let candidates: Vec<SocketAddr> = addrs
            .iter()
            .filter(|ip| !check_loop || !self.loopback.contains(ip))
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();
        if candidates.is_empty() {
            warn!("Refusing to dial {}: every address belongs to this host", target);
            return Err(ProxyError::LoopDetected(target.to_string()));
        }

        let total = self.retry_times.saturating_add(1);
        let mut last_error = None;
        for index in 1..=total {
            let started = Instant::now();
            match self.connect_candidates(&candidates).await {
                Ok(stream) => {
                    let peer = stream.peer_addr().unwrap_or(candidates[0]);
                    let attempt = DialAttempt {
                        target,
                        index,
                        outcome: Ok(peer),
                        elapsed: started.elapsed(),
                    };
                    debug!("{}", attempt);
                    return Ok(stream);
                }
                Err(e) => {
                    let attempt = DialAttempt {
                        target,
                        index,
                        outcome: Err(&e),
                        elapsed: started.elapsed(),
                    };
                    debug!("{}", attempt);
                    last_error = Some(e);
                }
            }

            if index < total && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(ProxyError::Dial {
            target: target.to_string(),
            attempts: total,
            source: last_error.unwrap_or_else(|| io::Error::other("no connection attempt made")),
        })
    }

    async fn connect_candidates(&self, candidates: &[SocketAddr]) -> io::Result<TcpStream> {
        if self.dual_stack {
            let (v6, v4): (Vec<SocketAddr>, Vec<SocketAddr>) = candidates.iter().copied().partition(|a| a.is_ipv6());
            if !v6.is_empty() && !v4.is_empty() {
                let racers: Vec<BoxFuture<'_, io::Result<TcpStream>>> =
                    vec![self.connect_sequential(v6).boxed(), self.connect_sequential(v4).boxed()];
                return future::select_ok(racers).await.map(|(stream, _)| stream);
            }
        }
        self.connect_sequential(candidates.to_vec()).await
    }

    async fn connect_sequential(&self, addrs: Vec<SocketAddr>) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in addrs {
            match self.connector.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_cache::Resolve;
    use std::net::IpAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct RefusingConnector {
        calls: AtomicUsize,
        seen: Mutex<Vec<SocketAddr>>,
    }

    impl RefusingConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BaseConnector for RefusingConnector {
        async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(addr);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    struct StaticResolver(Vec<IpAddr>);

    #[async_trait]
    impl Resolve for StaticResolver {
        async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    fn dialer_with(
        connector: Arc<dyn BaseConnector>,
        loopback: LoopbackAddressSet,
        resolved: Vec<IpAddr>,
        dual_stack: bool,
        retry_times: u32,
    ) -> ResilientDialer {
        let cache = AddressCache::with_resolver(8, Duration::from_secs(60), Arc::new(StaticResolver(resolved)));
        ResilientDialer::new(
            Arc::new(cache),
            Arc::new(loopback),
            connector,
            dual_stack,
            retry_times,
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com".to_string(), 443));
        assert_eq!(split_host_port("[::1]:8080").unwrap(), ("::1".to_string(), 8080));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port(":80").is_err());
    }

    #[tokio::test]
    async fn test_retry_makes_n_plus_one_attempts() {
        let connector = RefusingConnector::new();
        let dialer = dialer_with(
            connector.clone(),
            LoopbackAddressSet::empty(),
            vec!["192.0.2.7".parse().unwrap()],
            false,
            3,
        );

        let err = dialer.dial("origin.test:80").await.unwrap_err();
        match err {
            ProxyError::Dial { attempts, source, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let connector = RefusingConnector::new();
        let dialer = dialer_with(connector.clone(), LoopbackAddressSet::empty(), vec!["192.0.2.7".parse().unwrap()], false, 0);

        assert!(dialer.dial("origin.test:80").await.is_err());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loopback_only_target_fails_without_attempts() {
        let connector = RefusingConnector::new();
        let local: IpAddr = "10.9.8.7".parse().unwrap();
        let dialer = dialer_with(
            connector.clone(),
            LoopbackAddressSet::from_addrs([local]),
            vec![local],
            true,
            5,
        );

        let err = dialer.dial("myself.test:8087").await.unwrap_err();
        assert!(matches!(err, ProxyError::LoopDetected(ref t) if t == "myself.test:8087"));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);

        // the configured upstream hop skips the check
        assert!(dialer.dial_trusted("myself.test:8087").await.is_err());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_loopback_addresses_are_filtered_from_candidates() {
        let connector = RefusingConnector::new();
        let dialer = dialer_with(
            connector.clone(),
            LoopbackAddressSet::from_addrs(["10.9.8.7".parse().unwrap()]),
            vec!["10.9.8.7".parse().unwrap(), "192.0.2.1".parse().unwrap()],
            false,
            0,
        );

        assert!(dialer.dial("mixed.test:80").await.is_err());
        assert_eq!(*connector.seen.lock().unwrap(), vec!["192.0.2.1:80".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_dual_stack_tries_both_families() {
        let connector = RefusingConnector::new();
        let dialer = dialer_with(
            connector.clone(),
            LoopbackAddressSet::empty(),
            vec!["2001:db8::1".parse().unwrap(), "192.0.2.1".parse().unwrap()],
            true,
            0,
        );

        assert!(dialer.dial("dual.test:443").await.is_err());
        let mut seen = connector.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec!["192.0.2.1:443".parse().unwrap(), "[2001:db8::1]:443".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_dial_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cache = Arc::new(AddressCache::new(8, Duration::from_secs(60)));
        let dialer = ResilientDialer::new(
            cache,
            Arc::new(LoopbackAddressSet::empty()),
            Arc::new(TcpConnector::new(Duration::from_secs(2), Duration::from_secs(30))),
            true,
            0,
            Duration::ZERO,
        );

        let target = addr.to_string();
        let (stream, accepted) = tokio::join!(dialer.dial(&target), listener.accept());
        assert_eq!(stream.unwrap().peer_addr().unwrap(), addr);
        assert!(accepted.is_ok());
    }
}
