//! Argon2id proof-of-work challenge.
//!
//! Same protocol shape as the SHA-256 method, but the digest is Argon2id
//! with fixed cost parameters, which flattens the advantage of GPU and
//! ASIC solvers. Verification goes through the [`HashxVerifier`] trait so
//! deployments can swap in a sandboxed module; the default implementation
//! computes Argon2id natively.

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use bastion_common::BastionError;
use std::fmt::Write as _;
use std::sync::Arc;

use super::fast::leading_zero_nibbles;
use super::{ChallengeImpl, ClientArtifact, IssueInput, ValidateInput};

/// Verifies an Argon2id proof: `verify(seed, candidate, nonce,
/// difficulty)` must recompute the digest over `seed || nonce` and check
/// both the exact match and the difficulty bar.
pub trait HashxVerifier: Send + Sync {
    fn verify(
        &self,
        seed: &str,
        candidate: &str,
        nonce: u64,
        difficulty: u32,
    ) -> Result<bool, BastionError>;
}

/// Fixed cost parameters. These must match the client-side solver
/// byte-for-byte or no proof will ever verify.
const M_COST_KIB: u32 = 19_456;
const T_COST: u32 = 2;
const P_COST: u32 = 1;
const OUTPUT_LEN: usize = 32;

pub struct Argon2Verifier {
    argon: Argon2<'static>,
}

impl Default for Argon2Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Argon2Verifier {
    pub fn new() -> Self {
        let params = Params::new(M_COST_KIB, T_COST, P_COST, Some(OUTPUT_LEN))
            .expect("fixed Argon2 cost parameters are valid");
        Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }
}

impl HashxVerifier for Argon2Verifier {
    fn verify(
        &self,
        seed: &str,
        candidate: &str,
        nonce: u64,
        difficulty: u32,
    ) -> Result<bool, BastionError> {
        let password = format!("{seed}{nonce}");
        let mut out = [0u8; OUTPUT_LEN];

        self.argon
            .hash_password_into(password.as_bytes(), seed.as_bytes(), &mut out)
            .map_err(|e| BastionError::Internal(format!("argon2: {e}")))?;

        let mut digest = String::with_capacity(OUTPUT_LEN * 2);
        for b in out {
            let _ = write!(digest, "{b:02x}");
        }

        Ok(digest == candidate && leading_zero_nibbles(&digest) >= difficulty)
    }
}

pub struct HashxPow {
    verifier: Arc<dyn HashxVerifier>,
}

impl HashxPow {
    pub fn new(verifier: Arc<dyn HashxVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl ChallengeImpl for HashxPow {
    fn name(&self) -> &'static str {
        "hashx"
    }

    async fn issue(&self, input: &IssueInput<'_>) -> Result<ClientArtifact, BastionError> {
        input.store.put(input.challenge).await?;

        Ok(ClientArtifact {
            id: input.challenge.id.clone(),
            challenge: input.challenge.random_data.clone(),
            difficulty: input.challenge.difficulty,
        })
    }

    async fn validate(&self, input: &ValidateInput<'_>) -> Result<(), BastionError> {
        let response = input
            .params
            .response
            .as_deref()
            .ok_or(BastionError::MissingField("response"))?;
        let nonce = input
            .params
            .nonce
            .ok_or(BastionError::MissingField("nonce"))?;

        let ok = self.verifier.verify(
            &input.challenge.random_data,
            response,
            nonce,
            input.challenge.difficulty,
        )?;
        if !ok {
            return Err(BastionError::Failed("proof rejected".to_string()));
        }

        if !input.store.mark_spent(&input.challenge.id).await? {
            return Err(BastionError::AlreadySpent(input.challenge.id.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{Challenge, ChallengeStore, SubmissionParams};
    use crate::store::MemoryStore;
    use bastion_common::ChallengeSpec;
    use std::fmt::Write as _;
    use std::time::Duration;

    fn spec() -> ChallengeSpec {
        ChallengeSpec {
            algorithm: "hashx".to_string(),
            difficulty: 0,
            report_as: 0,
        }
    }

    fn store() -> ChallengeStore {
        ChallengeStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1800))
    }

    /// A verifier that avoids Argon2's cost in unit tests.
    struct EchoVerifier;

    impl HashxVerifier for EchoVerifier {
        fn verify(
            &self,
            seed: &str,
            candidate: &str,
            nonce: u64,
            _difficulty: u32,
        ) -> Result<bool, BastionError> {
            Ok(candidate == format!("{seed}:{nonce}"))
        }
    }

    #[tokio::test]
    async fn test_delegates_to_verifier() {
        let store = store();
        let c = Challenge::new(&spec(), "", "1.2.3.4", "x");
        store.put(&c).await.unwrap();

        let pow = HashxPow::new(Arc::new(EchoVerifier));

        let good = SubmissionParams {
            response: Some(format!("{}:7", c.random_data)),
            nonce: Some(7),
            elapsed_time: None,
        };
        pow.validate(&ValidateInput {
            challenge: &c,
            params: &good,
            store: &store,
        })
        .await
        .unwrap();

        let c2 = Challenge::new(&spec(), "", "1.2.3.4", "x");
        store.put(&c2).await.unwrap();
        let bad = SubmissionParams {
            response: Some("wrong".to_string()),
            nonce: Some(7),
            elapsed_time: None,
        };
        let err = pow
            .validate(&ValidateInput {
                challenge: &c2,
                params: &bad,
                store: &store,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BastionError::Failed(_)));
    }

    #[test]
    fn test_argon2_verifier_roundtrip() {
        let verifier = Argon2Verifier::new();
        let seed = "aa".repeat(32);

        // Compute the expected digest through the same path the client
        // would, then confirm the verifier accepts it at difficulty 0.
        let password = format!("{seed}0");
        let mut out = [0u8; OUTPUT_LEN];
        verifier
            .argon
            .hash_password_into(password.as_bytes(), seed.as_bytes(), &mut out)
            .unwrap();
        let mut digest = String::new();
        for b in out {
            let _ = write!(digest, "{b:02x}");
        }

        assert!(verifier.verify(&seed, &digest, 0, 0).unwrap());
        assert!(!verifier.verify(&seed, &digest, 1, 0).unwrap());
        assert!(!verifier.verify(&seed, "beef", 0, 0).unwrap());
    }
}
