//! Optional external lookup services consumed by policy rules.
//!
//! ASN and GeoIP data come from an external RPC service; the gatekeeper
//! only defines the interface it consumes. Implementations must resolve
//! or give up within [`REMOTE_CHECK_TIMEOUT_MILLIS`]; a checker error is
//! treated as "matcher returned false" by the evaluator and logged at
//! debug level, never surfaced to the client.
//!
//! [`REMOTE_CHECK_TIMEOUT_MILLIS`]: bastion_common::constants::REMOTE_CHECK_TIMEOUT_MILLIS

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::policy::RequestMetadata;

/// Maps an address to its announcing autonomous system, if any.
pub trait AsnProvider: Send + Sync {
    fn lookup(&self, addr: IpAddr) -> anyhow::Result<Option<u32>>;
}

/// Maps an address to an ISO 3166-1 alpha-2 country code, if known.
pub trait GeoIpProvider: Send + Sync {
    fn country(&self, addr: IpAddr) -> anyhow::Result<Option<String>>;
}

/// The set of external services available at policy load time. Rules
/// that reference a missing service fail validation.
#[derive(Clone, Default)]
pub struct Providers {
    pub asn: Option<Arc<dyn AsnProvider>>,
    pub geoip: Option<Arc<dyn GeoIpProvider>>,
}

/// A compiled matcher backed by an external service.
pub trait RemoteChecker: Send + Sync {
    fn check(&self, meta: &RequestMetadata) -> anyhow::Result<bool>;
    fn hash(&self) -> String;
}

pub struct AsnChecker {
    provider: Arc<dyn AsnProvider>,
    asns: HashSet<u32>,
    hash: String,
}

impl AsnChecker {
    pub fn new(provider: Arc<dyn AsnProvider>, asns: &[u32]) -> Self {
        let mut sorted: Vec<u32> = asns.to_vec();
        sorted.sort_unstable();
        let hash = crate::policy::sha256_hex(
            sorted
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",")
                .as_bytes(),
        );

        Self {
            provider,
            asns: asns.iter().copied().collect(),
            hash,
        }
    }
}

impl RemoteChecker for AsnChecker {
    fn check(&self, meta: &RequestMetadata) -> anyhow::Result<bool> {
        match self.provider.lookup(meta.remote_addr)? {
            // Unannounced space can't match any ASN rule.
            None => Ok(false),
            Some(asn) => Ok(self.asns.contains(&asn)),
        }
    }

    fn hash(&self) -> String {
        self.hash.clone()
    }
}

pub struct CountryChecker {
    provider: Arc<dyn GeoIpProvider>,
    countries: HashSet<String>,
    hash: String,
}

impl CountryChecker {
    pub fn new(provider: Arc<dyn GeoIpProvider>, countries: &[String]) -> Self {
        let normalized: Vec<String> = countries.iter().map(|c| c.to_uppercase()).collect();
        let mut sorted = normalized.clone();
        sorted.sort();
        let hash = crate::policy::sha256_hex(sorted.join(",").as_bytes());

        Self {
            provider,
            countries: normalized.into_iter().collect(),
            hash,
        }
    }
}

impl RemoteChecker for CountryChecker {
    fn check(&self, meta: &RequestMetadata) -> anyhow::Result<bool> {
        match self.provider.country(meta.remote_addr)? {
            None => Ok(false),
            Some(country) => Ok(self.countries.contains(&country.to_uppercase())),
        }
    }

    fn hash(&self) -> String {
        self.hash.clone()
    }
}
