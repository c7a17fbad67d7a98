//! SHA-256 proof-of-work challenge.
//!
//! The client computes `sha256(randomData || nonce)` for increasing
//! integer nonces until the lowercase hex digest has at least
//! `difficulty` leading zero nibbles. Verification recomputes the digest
//! and requires an exact match *and* the difficulty bar; checking only
//! the submitted digest would let a client pass with an arbitrary string
//! of zeroes.

use async_trait::async_trait;
use bastion_common::BastionError;

use super::{ChallengeImpl, ClientArtifact, IssueInput, ValidateInput};
use crate::policy::sha256_hex;

pub struct FastPow;

/// Number of leading zero nibbles in a lowercase hex digest.
pub fn leading_zero_nibbles(digest: &str) -> u32 {
    digest.chars().take_while(|c| *c == '0').count() as u32
}

#[async_trait]
impl ChallengeImpl for FastPow {
    fn name(&self) -> &'static str {
        "fast"
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

        let calculated = sha256_hex(
            format!("{}{}", input.challenge.random_data, nonce).as_bytes(),
        );

        if calculated != response {
            return Err(BastionError::Failed("digest mismatch".to_string()));
        }

        if leading_zero_nibbles(&calculated) < input.challenge.difficulty {
            return Err(BastionError::Failed(format!(
                "digest does not meet difficulty {}",
                input.challenge.difficulty
            )));
        }

        if !input.store.mark_spent(&input.challenge.id).await? {
            return Err(BastionError::AlreadySpent(input.challenge.id.clone()));
        }

        Ok(())
    }
}
