//! Challenge issuance, verification, and the algorithm registry.
//!
//! Challenge methods are looked up by name in a process-wide registry.
//! The built-in methods register when the registry is first touched;
//! alternative implementations can be registered before the server
//! starts. Each method implements [`ChallengeImpl`]: `setup` runs once at
//! startup, `issue` persists an outstanding challenge record and produces
//! what the browser needs to start solving, `validate` verifies a
//! submission and spends the record.

mod fast;
mod hashx;

pub use fast::FastPow;
pub use hashx::{Argon2Verifier, HashxPow, HashxVerifier};

use async_trait::async_trait;
use bastion_common::constants::store_keys;
use bastion_common::{BastionError, ChallengeSpec};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{JsonStore, Store};

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn ChallengeImpl>>>> = Lazy::new(|| {
    let mut methods: HashMap<String, Arc<dyn ChallengeImpl>> = HashMap::new();

    let fast = Arc::new(FastPow);
    methods.insert(fast.name().to_string(), fast);

    let hashx = Arc::new(HashxPow::new(Arc::new(Argon2Verifier::new())));
    methods.insert(hashx.name().to_string(), hashx);

    RwLock::new(methods)
});

/// Register a challenge method. Intended for startup; later calls
/// replace the previous implementation under that name.
pub fn register(impl_: Arc<dyn ChallengeImpl>) {
    REGISTRY.write().insert(impl_.name().to_string(), impl_);
}

/// Look up a challenge method by name.
pub fn get(name: &str) -> Option<Arc<dyn ChallengeImpl>> {
    REGISTRY.read().get(name).cloned()
}

/// Names of all registered methods, sorted.
pub fn methods() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

/// Run every method's setup hook. Idempotent.
pub fn setup_all() {
    for impl_ in REGISTRY.read().values() {
        impl_.setup();
    }
}

/// Server-side state for one outstanding challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// UUID identifying the challenge
    pub id: String,

    /// Unix seconds when the challenge was issued
    pub issued_at: i64,

    /// Challenge method name
    pub method: String,

    /// Hex-encoded seed bytes the client processes
    pub random_data: String,

    /// Fingerprint of the policy rule that issued this challenge
    #[serde(default)]
    pub policy_rule_hash: String,

    /// Difficulty in effect when issued
    pub difficulty: u32,

    /// Has the challenge already been solved?
    #[serde(default)]
    pub spent: bool,

    /// Request metadata such as the client address and user agent
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Challenge {
    /// Create a fresh record bound to the requesting client.
    pub fn new(spec: &ChallengeSpec, rule_hash: &str, client_ip: &str, user_agent: &str) -> Self {
        use rand::Rng;

        let mut rng = rand::rng();
        let mut seed = [0u8; 32];
        rng.fill(&mut seed[..]);

        let mut random_data = String::with_capacity(64);
        for b in seed {
            use std::fmt::Write as _;
            let _ = write!(random_data, "{b:02x}");
        }

        let mut metadata = HashMap::new();
        metadata.insert("ip".to_string(), client_ip.to_string());
        metadata.insert(
            "userAgent".to_string(),
            coarse_user_agent(user_agent).to_string(),
        );

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            issued_at: chrono::Utc::now().timestamp(),
            method: spec.algorithm.clone(),
            random_data,
            policy_rule_hash: rule_hash.to_string(),
            difficulty: spec.difficulty,
            spent: false,
            metadata,
        }
    }

    /// Whether this record was issued to the given client. The user
    /// agent comparison is coarse on purpose: browsers mutate the full
    /// string between page loads more often than the product prefix.
    pub fn belongs_to(&self, client_ip: &str, user_agent: &str) -> bool {
        self.metadata.get("ip").map(String::as_str) == Some(client_ip)
            && self.metadata.get("userAgent").map(String::as_str)
                == Some(coarse_user_agent(user_agent))
    }
}

/// The product prefix of a user agent string ("Mozilla/5.0 (...)" →
/// "Mozilla").
pub fn coarse_user_agent(user_agent: &str) -> &str {
    user_agent
        .split(['/', ' '])
        .next()
        .unwrap_or_default()
}

/// What the browser needs to start solving.
#[derive(Debug, Clone, Serialize)]
pub struct ClientArtifact {
    pub id: String,
    /// The seed the client hashes (named "challenge" on the wire)
    pub challenge: String,
    pub difficulty: u32,
}

/// Parsed submission parameters from the pass-challenge request.
#[derive(Debug, Clone, Default)]
pub struct SubmissionParams {
    pub response: Option<String>,
    pub nonce: Option<u64>,
    pub elapsed_time: Option<f64>,
}

pub struct IssueInput<'a> {
    pub challenge: &'a Challenge,
    pub store: &'a ChallengeStore,
}

pub struct ValidateInput<'a> {
    pub challenge: &'a Challenge,
    pub params: &'a SubmissionParams,
    pub store: &'a ChallengeStore,
}

#[async_trait]
pub trait ChallengeImpl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent initialization at startup.
    fn setup(&self) {}

    /// Persist the challenge record and produce the client artifact.
    async fn issue(&self, input: &IssueInput<'_>) -> Result<ClientArtifact, BastionError>;

    /// Verify a submission and spend the record.
    async fn validate(&self, input: &ValidateInput<'_>) -> Result<(), BastionError>;
}

/// Keyed store for outstanding challenges with at-most-once spending.
#[derive(Clone)]
pub struct ChallengeStore {
    records: JsonStore<Challenge>,
    backend: Arc<dyn Store>,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(backend: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            records: JsonStore::new(backend.clone(), store_keys::CHALLENGE_PREFIX),
            backend,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn put(&self, challenge: &Challenge) -> Result<(), BastionError> {
        self.records.set(&challenge.id, challenge, self.ttl).await
    }

    /// Fetch an outstanding challenge. Records the backend kept past
    /// their issue window (clock drift, sloppy TTL support) are treated
    /// as expired here.
    pub async fn get(&self, id: &str) -> Result<Challenge, BastionError> {
        let challenge = self
            .records
            .get(id)
            .await?
            .ok_or_else(|| BastionError::NotFound(format!("challenge {id}")))?;

        let age = chrono::Utc::now().timestamp() - challenge.issued_at;
        if age < 0 || age as u64 > self.ttl.as_secs() {
            self.records.delete(id).await?;
            return Err(BastionError::Expired(format!("challenge {id}")));
        }

        Ok(challenge)
    }

    /// Atomically flip the spent marker. Exactly one concurrent caller
    /// for a given id observes `true`; everyone else gets `false`.
    pub async fn mark_spent(&self, id: &str) -> Result<bool, BastionError> {
        let key = format!("{}:{}", store_keys::SPENT_PREFIX, id);
        let first = self
            .backend
            .set_if_absent(&key, b"1".to_vec(), self.ttl)
            .await?;

        if first {
            // Best-effort flag on the record itself so admin inspection
            // shows the spent state; the marker key is authoritative.
            if let Ok(Some(mut challenge)) = self.records.get(id).await {
                challenge.spent = true;
                let _ = self.records.set(id, &challenge, self.ttl).await;
            }
        }

        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn spec() -> ChallengeSpec {
        ChallengeSpec {
            algorithm: "fast".to_string(),
            difficulty: 4,
            report_as: 4,
        }
    }

    fn store() -> ChallengeStore {
        ChallengeStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1800))
    }

    #[test]
    fn test_registry_has_builtin_methods() {
        assert!(get("fast").is_some());
        assert!(get("hashx").is_some());
        assert!(get("nope").is_none());
        assert_eq!(methods(), vec!["fast".to_string(), "hashx".to_string()]);
    }

    #[test]
    fn test_challenge_record_shape() {
        let c = Challenge::new(&spec(), "abc123", "1.2.3.4", "Mozilla/5.0 (X11)");
        assert_eq!(c.random_data.len(), 64);
        assert!(c.random_data.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(c.method, "fast");
        assert_eq!(c.difficulty, 4);
        assert!(!c.spent);
        assert!(uuid::Uuid::parse_str(&c.id).is_ok());
    }

    #[test]
    fn test_belongs_to_is_coarse_on_user_agent() {
        let c = Challenge::new(&spec(), "", "1.2.3.4", "Mozilla/5.0 (X11; Linux)");
        assert!(c.belongs_to("1.2.3.4", "Mozilla/6.0 (Windows)"));
        assert!(!c.belongs_to("1.2.3.4", "curl/8.0"));
        assert!(!c.belongs_to("5.6.7.8", "Mozilla/5.0 (X11; Linux)"));
    }

    #[tokio::test]
    async fn test_store_roundtrip_and_miss() {
        let store = store();
        let c = Challenge::new(&spec(), "", "1.2.3.4", "x");

        store.put(&c).await.unwrap();
        let got = store.get(&c.id).await.unwrap();
        assert_eq!(got.random_data, c.random_data);

        let err = store.get("missing-id").await.unwrap_err();
        assert!(matches!(err, BastionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_record_is_expired() {
        let store = store();
        let mut c = Challenge::new(&spec(), "", "1.2.3.4", "x");
        c.issued_at -= 7200;
        store.put(&c).await.unwrap();

        let err = store.get(&c.id).await.unwrap_err();
        assert!(matches!(err, BastionError::Expired(_)));
    }

    #[tokio::test]
    async fn test_mark_spent_exactly_once() {
        let store = Arc::new(store());
        let c = Challenge::new(&spec(), "", "1.2.3.4", "x");
        store.put(&c).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = c.id.clone();
            tasks.spawn(async move { store.mark_spent(&id).await.unwrap() });
        }

        let mut wins = 0;
        while let Some(res) = tasks.join_next().await {
            if res.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_coarse_user_agent() {
        assert_eq!(coarse_user_agent("Mozilla/5.0 (X11)"), "Mozilla");
        assert_eq!(coarse_user_agent("curl/8.0.1"), "curl");
        assert_eq!(coarse_user_agent(""), "");
    }
}
