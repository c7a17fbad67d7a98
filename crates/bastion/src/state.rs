//! Application state and shared resources.

use anyhow::{Context, Result};
use bastion_common::constants::CHALLENGE_TTL_SECS;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::challenge::ChallengeStore;
use crate::config::AppConfig;
use crate::cookie::TokenSigner;
use crate::dns::DnsCache;
use crate::policy::PolicyHandle;
use crate::proxy::{AllowedTargets, ReverseProxy};
use crate::store::{MemoryStore, RedisStore, Store};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Currently active compiled policy (swapped on reload)
    pub policy: PolicyHandle,

    /// Backend for challenge records and spend markers
    pub store: Arc<dyn Store>,

    /// Outstanding challenge records
    pub challenges: Arc<ChallengeStore>,

    /// Session token signer
    pub signer: Arc<TokenSigner>,

    /// DNS caches backing FCrDNS checks
    pub dns: Arc<DnsCache>,

    /// Reverse proxy to the upstream origin
    pub proxy: Arc<ReverseProxy>,

    /// In-memory store handle kept for the cleanup worker; None when
    /// Redis owns expiry
    pub memory_store: Option<Arc<MemoryStore>>,

    /// Allow-list handle kept so the file watcher can reload it
    pub allowed_targets: Option<Arc<AllowedTargets>>,
}

impl AppState {
    /// Create new application state, connecting to Redis when configured.
    pub async fn new(config: AppConfig, policy: PolicyHandle) -> Result<Self> {
        let (store, memory_store): (Arc<dyn Store>, Option<Arc<MemoryStore>>) =
            match &config.redis_url {
                Some(url) => {
                    let store = RedisStore::connect(url)
                        .await
                        .context("Failed to connect to Redis")?;
                    (Arc::new(store), None)
                }
                None => {
                    let memory = Arc::new(MemoryStore::new());
                    (memory.clone() as Arc<dyn Store>, Some(memory))
                }
            };

        let challenges = Arc::new(ChallengeStore::new(
            store.clone(),
            Duration::from_secs(CHALLENGE_TTL_SECS),
        ));

        let signer = Arc::new(TokenSigner::load_or_generate(
            config.ed25519_private_key_fname.as_deref().map(Path::new),
        )?);

        let dns = Arc::new(
            DnsCache::new(
                Duration::from_secs(config.forward_dns_ttl_secs),
                Duration::from_secs(config.reverse_dns_ttl_secs),
            )
            .context("Failed to build DNS resolver")?,
        );

        let allowed = match &config.allowed_targets_fname {
            Some(fname) => Some(
                AllowedTargets::load(fname.into())
                    .context("Failed to load allowed targets")?,
            ),
            None => None,
        };

        let proxy = Arc::new(ReverseProxy::new(
            &config.target,
            allowed.clone(),
            config.proxy_protocol_out_version,
        )?);

        Ok(Self {
            config: Arc::new(config),
            policy,
            store,
            challenges,
            signer,
            dns,
            proxy,
            memory_store,
            allowed_targets: allowed,
        })
    }

    /// Test-oriented constructor: in-memory store, injected DNS, no
    /// resolver or Redis involved.
    pub fn for_tests(config: AppConfig, policy: PolicyHandle, dns: Arc<DnsCache>) -> Result<Self> {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = memory.clone();

        let challenges = Arc::new(ChallengeStore::new(
            store.clone(),
            Duration::from_secs(CHALLENGE_TTL_SECS),
        ));

        let signer = Arc::new(TokenSigner::load_or_generate(None)?);
        let proxy = Arc::new(ReverseProxy::new(&config.target, None, None)?);

        Ok(Self {
            config: Arc::new(config),
            policy,
            store,
            challenges,
            signer,
            dns,
            proxy,
            memory_store: Some(memory),
            allowed_targets: None,
        })
    }
}
