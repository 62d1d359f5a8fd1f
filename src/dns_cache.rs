//! Bounded, time-expiring hostname resolution cache.
//!
//! Entries older than the configured TTL are treated as absent. Concurrent
//! misses for the same hostname share a single in-flight lookup.

use crate::error::ProxyError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use lru::LruCache;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Resolved addresses in resolver order.
pub type AddressSet = Arc<[IpAddr]>;

type PendingLookup = Shared<BoxFuture<'static, Result<AddressSet, String>>>;

#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0)).await? {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

#[derive(Debug, Clone)]
pub struct CachedAddressEntry {
    pub addresses: AddressSet,
    pub inserted_at: Instant,
    pub expires_at: Instant,
}

impl CachedAddressEntry {
    fn new(addresses: AddressSet, ttl: Duration) -> Self {
        let inserted_at = Instant::now();
        Self {
            addresses,
            inserted_at,
            expires_at: inserted_at + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct CacheState {
    entries: Mutex<LruCache<String, CachedAddressEntry>>,
    inflight: Mutex<HashMap<String, PendingLookup>>,
    ttl: Duration,
}

impl CacheState {
    fn entries(&self) -> MutexGuard<'_, LruCache<String, CachedAddressEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, PendingLookup>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, host: &str) -> Option<AddressSet> {
        let mut entries = self.entries();
        let expired = match entries.get(host) {
            Some(entry) if !entry.is_expired(Instant::now()) => return Some(entry.addresses.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(host);
            debug!("DNS cache entry for {} expired", host);
        }
        None
    }

    fn store(&self, host: &str, addresses: AddressSet) {
        let mut entries = self.entries();
        if let Some((evicted, _)) = entries.push(host.to_string(), CachedAddressEntry::new(addresses, self.ttl)) {
            if evicted != host {
                debug!("DNS cache full, evicted {}", evicted);
            }
        }
    }
}

pub struct AddressCache {
    state: Arc<CacheState>,
    resolver: Arc<dyn Resolve>,
}

impl AddressCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_resolver(capacity, ttl, Arc::new(SystemResolver))
    }

    pub fn with_resolver(capacity: usize, ttl: Duration, resolver: Arc<dyn Resolve>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(CacheState {
                entries: Mutex::new(LruCache::new(capacity)),
                inflight: Mutex::new(HashMap::new()),
                ttl,
            }),
            resolver,
        }
    }

    /// Resolve `host`, returning the address set and whether it came from the cache.
    ///
    /// Literal IP addresses are returned as-is and never cached.
    pub async fn resolve(&self, host: &str) -> Result<(AddressSet, bool), ProxyError> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok((Arc::from([ip]), false));
        }

        let key = host.to_ascii_lowercase();
        if let Some(addresses) = self.state.lookup(&key) {
            debug!("DNS cache hit for {}", key);
            return Ok((addresses, true));
        }

        let pending = {
            let mut inflight = self.state.inflight();
            inflight
                .entry(key.clone())
                .or_insert_with(|| self.start_lookup(key.clone()))
                .clone()
        };

        pending
            .await
            .map(|addresses| (addresses, false))
            .map_err(|message| ProxyError::Resolve { host: key, message })
    }

    fn start_lookup(&self, host: String) -> PendingLookup {
        debug!("DNS cache miss for {}, resolving", host);
        let resolver = Arc::clone(&self.resolver);
        let state: Weak<CacheState> = Arc::downgrade(&self.state);

        async move {
            let outcome = match resolver.resolve(&host).await {
                Ok(ips) if ips.is_empty() => Err("no addresses returned".to_string()),
                Ok(ips) => Ok(AddressSet::from(ips)),
                Err(e) => Err(e.to_string()),
            };

            if let Some(state) = state.upgrade() {
                if let Ok(addresses) = &outcome {
                    state.store(&host, addresses.clone());
                }
                state.inflight().remove(&host);
            }
            outcome
        }
        .boxed()
        .shared()
    }

    pub fn len(&self) -> usize {
        self.state.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }
}
