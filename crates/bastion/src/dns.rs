//! Cached DNS resolution and forward-confirmed reverse DNS.
//!
//! Forward (hostname → IPs) and reverse (IP → PTR names) lookups go
//! through independent decaying maps with their own TTLs. "Not found"
//! answers are cached as empty lists so repeat offenders don't trigger a
//! lookup per request. PTR names are cached with the trailing dot
//! trimmed.
//!
//! The actual lookup functions are injectable so tests can run without a
//! resolver; the default implementation uses a blocking hickory resolver
//! with a 10 second timeout. Callers are expected to run FCrDNS checks
//! from a blocking context.

use bastion_common::constants::DNS_TIMEOUT_SECS;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::Resolver;
use parking_lot::Mutex;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::decaymap::DecayMap;

pub type LookupAddrFn = Arc<dyn Fn(IpAddr) -> std::io::Result<Vec<String>> + Send + Sync>;
pub type LookupHostFn = Arc<dyn Fn(&str) -> std::io::Result<Vec<IpAddr>> + Send + Sync>;

pub struct DnsCache {
    forward: DecayMap<String, Vec<IpAddr>>,
    reverse: DecayMap<String, Vec<String>>,
    forward_ttl: Duration,
    reverse_ttl: Duration,
    lookup_addr: LookupAddrFn,
    lookup_host: LookupHostFn,
}

impl DnsCache {
    /// Build a cache backed by a system-configured resolver.
    pub fn new(forward_ttl: Duration, reverse_ttl: Duration) -> anyhow::Result<Self> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
        opts.timeout = Duration::from_secs(DNS_TIMEOUT_SECS);

        let resolver = Resolver::new(config, opts)?;
        // The blocking resolver is not shareable across threads by
        // itself; queries serialize behind this mutex. The caches in
        // front keep contention low.
        let resolver = Arc::new(Mutex::new(resolver));

        let reverse_resolver = resolver.clone();
        let lookup_addr: LookupAddrFn = Arc::new(move |addr| {
            let resolver = reverse_resolver.lock();
            match resolver.reverse_lookup(addr) {
                Ok(lookup) => Ok(lookup.iter().map(|name| name.to_string()).collect()),
                Err(e) => match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                    _ => Err(std::io::Error::other(e)),
                },
            }
        });

        let forward_resolver = resolver;
        let lookup_host: LookupHostFn = Arc::new(move |host| {
            let resolver = forward_resolver.lock();
            match resolver.lookup_ip(host) {
                Ok(lookup) => Ok(lookup.iter().collect()),
                Err(e) => match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                    _ => Err(std::io::Error::other(e)),
                },
            }
        });

        Ok(Self::with_lookups(
            forward_ttl,
            reverse_ttl,
            lookup_addr,
            lookup_host,
        ))
    }

    /// Build a cache with caller-supplied lookup functions.
    pub fn with_lookups(
        forward_ttl: Duration,
        reverse_ttl: Duration,
        lookup_addr: LookupAddrFn,
        lookup_host: LookupHostFn,
    ) -> Self {
        Self {
            forward: DecayMap::new(),
            reverse: DecayMap::new(),
            forward_ttl,
            reverse_ttl,
            lookup_addr,
            lookup_host,
        }
    }

    /// Sweep expired cache entries.
    pub fn cleanup(&self) {
        self.forward.cleanup();
        self.reverse.cleanup();
    }

    /// Reverse-resolve an address to its PTR names, trailing dots
    /// trimmed. Failures and empty answers are both cached as empty
    /// lists.
    pub fn reverse_dns(&self, addr: IpAddr) -> Vec<String> {
        let key = addr.to_string();
        if let Some(cached) = self.reverse.get(&key) {
            debug!(addr = %addr, names = ?cached, "reverse cache hit");
            return cached;
        }

        let names = match (self.lookup_addr)(addr) {
            Ok(raw) => raw
                .into_iter()
                .map(|name| name.trim_end_matches('.').to_string())
                .collect(),
            Err(e) => {
                debug!(addr = %addr, error = %e, "reverse lookup failed");
                Vec::new()
            }
        };

        self.reverse.set(key, names.clone(), self.reverse_ttl);
        names
    }

    /// Forward-resolve a hostname. Failures cache as empty lists.
    pub fn lookup_host(&self, host: &str) -> Vec<IpAddr> {
        if let Some(cached) = self.forward.get(&host.to_string()) {
            debug!(host = %host, addrs = ?cached, "forward cache hit");
            return cached;
        }

        let addrs = match (self.lookup_host)(host) {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host = %host, error = %e, "forward lookup failed");
                Vec::new()
            }
        };

        self.forward
            .set(host.to_string(), addrs.clone(), self.forward_ttl);
        addrs
    }

    /// Forward-confirmed reverse DNS: the PTR names of `addr`, forward
    /// resolved, must include `addr` itself. When a pattern is given, at
    /// least one PTR name must match it before the forward confirmation
    /// is attempted, and only matching names are confirmed.
    pub fn verify_fcrdns(&self, addr: IpAddr, pattern: Option<&Regex>) -> bool {
        let names = self.reverse_dns(addr);
        if names.is_empty() {
            return false;
        }

        let candidates: Vec<&String> = match pattern {
            Some(rex) => {
                let matching: Vec<&String> =
                    names.iter().filter(|name| rex.is_match(name)).collect();
                if matching.is_empty() {
                    debug!(addr = %addr, pattern = %rex.as_str(), "no PTR matches the pattern");
                    return false;
                }
                matching
            }
            None => names.iter().collect(),
        };

        for name in candidates {
            if self.lookup_host(name).contains(&addr) {
                debug!(addr = %addr, name = %name, "forward lookup confirmed original IP");
                return true;
            }
        }

        debug!(addr = %addr, "could not confirm original IP in forward lookups");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, DnsCache) {
        let reverse_calls = Arc::new(AtomicUsize::new(0));
        let forward_calls = Arc::new(AtomicUsize::new(0));

        let rc = reverse_calls.clone();
        let lookup_addr: LookupAddrFn = Arc::new(move |addr| {
            rc.fetch_add(1, Ordering::SeqCst);
            match addr {
                IpAddr::V4(v4) if v4.octets() == [1, 2, 3, 4] => {
                    Ok(vec!["crawler.example.com.".to_string()])
                }
                _ => Ok(Vec::new()),
            }
        });

        let fc = forward_calls.clone();
        let lookup_host: LookupHostFn = Arc::new(move |host| {
            fc.fetch_add(1, Ordering::SeqCst);
            match host {
                "crawler.example.com" => Ok(vec!["1.2.3.4".parse().unwrap()]),
                "liar.example.com" => Ok(vec!["9.9.9.9".parse().unwrap()]),
                _ => Ok(Vec::new()),
            }
        });

        let cache = DnsCache::with_lookups(
            Duration::from_secs(60),
            Duration::from_secs(60),
            lookup_addr,
            lookup_host,
        );

        (reverse_calls, forward_calls, cache)
    }

    #[test]
    fn test_reverse_trims_trailing_dot() {
        let (_, _, cache) = fixture();
        let names = cache.reverse_dns("1.2.3.4".parse().unwrap());
        assert_eq!(names, vec!["crawler.example.com".to_string()]);
    }

    #[test]
    fn test_negative_answers_are_cached() {
        let (reverse_calls, _, cache) = fixture();
        let addr: IpAddr = "5.6.7.8".parse().unwrap();

        assert!(cache.reverse_dns(addr).is_empty());
        assert!(cache.reverse_dns(addr).is_empty());
        assert_eq!(reverse_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fcrdns_confirms() {
        let (_, _, cache) = fixture();
        assert!(cache.verify_fcrdns("1.2.3.4".parse().unwrap(), None));
    }

    #[test]
    fn test_fcrdns_rejects_unconfirmed() {
        let (_, _, cache) = fixture();
        // No PTR at all.
        assert!(!cache.verify_fcrdns("5.6.7.8".parse().unwrap(), None));
    }

    #[test]
    fn test_fcrdns_pattern_gate() {
        let (_, forward_calls, cache) = fixture();
        let addr: IpAddr = "1.2.3.4".parse().unwrap();

        let nomatch = Regex::new(r"\.googlebot\.com$").unwrap();
        assert!(!cache.verify_fcrdns(addr, Some(&nomatch)));
        // The pattern gate must stop us before any forward lookup.
        assert_eq!(forward_calls.load(Ordering::SeqCst), 0);

        let matches = Regex::new(r"\.example\.com$").unwrap();
        assert!(cache.verify_fcrdns(addr, Some(&matches)));
    }

    #[test]
    fn test_forward_cache_hit() {
        let (_, forward_calls, cache) = fixture();
        cache.lookup_host("crawler.example.com");
        cache.lookup_host("crawler.example.com");
        assert_eq!(forward_calls.load(Ordering::SeqCst), 1);
    }
}
