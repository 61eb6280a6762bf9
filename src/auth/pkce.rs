//! PKCE (RFC 7636) verifier/challenge generation

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::classify;
use crate::error::Result;

/// Characters allowed in a code verifier (RFC 7636 `unreserved`)
pub const VERIFIER_CHARSET: &[u8; 66] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Shortest verifier RFC 7636 allows
pub const MIN_VERIFIER_LEN: usize = 43;
/// Longest verifier RFC 7636 allows
pub const MAX_VERIFIER_LEN: usize = 128;
/// Verifier length used unless configured otherwise
pub const DEFAULT_VERIFIER_LEN: usize = 64;

/// The only challenge method this crate emits
pub const CHALLENGE_METHOD: &str = "S256";

const STATE_BYTES: usize = 32;
// Largest multiple of the charset size that fits in a byte; bytes at or
// above it are rejected so every character is equally likely.
const REJECTION_LIMIT: u8 = (256 / VERIFIER_CHARSET.len() * VERIFIER_CHARSET.len()) as u8;

/// Source of cryptographically secure random bytes
pub trait RandomSource: Send + Sync {
    /// Fill `buf` with random bytes
    ///
    /// # Errors
    /// Returns a description of the failure if no secure randomness is available.
    fn fill(&self, buf: &mut [u8]) -> std::result::Result<(), String>;
}

/// Operating-system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) -> std::result::Result<(), String> {
        OsRng.try_fill_bytes(buf).map_err(|e| e.to_string())
    }
}

fn random_bytes(random: &dyn RandomSource, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    random
        .fill(&mut buf)
        .map_err(classify::randomness_unavailable)?;
    Ok(buf)
}

/// PKCE code challenge data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// Code verifier (random string over the unreserved charset)
    pub code_verifier: String,
    /// Code challenge (SHA-256 hash of verifier, base64url encoded)
    pub code_challenge: String,
    /// Challenge method, always `S256`
    pub method: String,
}

impl PkceChallenge {
    /// Generate a verifier of `len` characters and its S256 challenge
    ///
    /// `len` is clamped to the 43..=128 range RFC 7636 allows.
    ///
    /// # Errors
    /// Returns a non-recoverable error if the random source fails.
    pub fn generate(random: &dyn RandomSource, len: usize) -> Result<Self> {
        let len = len.clamp(MIN_VERIFIER_LEN, MAX_VERIFIER_LEN);
        let mut verifier = String::with_capacity(len);

        while verifier.len() < len {
            let chunk = random_bytes(random, len)?;
            for byte in chunk {
                if byte >= REJECTION_LIMIT {
                    continue;
                }
                verifier.push(VERIFIER_CHARSET[usize::from(byte) % VERIFIER_CHARSET.len()] as char);
                if verifier.len() == len {
                    break;
                }
            }
        }

        let code_challenge = compute_challenge(&verifier);
        Ok(Self {
            code_verifier: verifier,
            code_challenge,
            method: CHALLENGE_METHOD.to_string(),
        })
    }
}

/// Compute `BASE64URL(SHA256(verifier))` without padding
#[must_use]
pub fn compute_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Check that `challenge` was derived from `verifier`
#[must_use]
pub fn verify(verifier: &str, challenge: &str) -> bool {
    constant_time_eq(compute_challenge(verifier).as_bytes(), challenge.as_bytes())
}

/// Generate an opaque `state` value (256 bits, base64url)
///
/// # Errors
/// Returns a non-recoverable error if the random source fails.
pub fn generate_state(random: &dyn RandomSource) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(random, STATE_BYTES)?))
}

/// Compare two byte strings without early exit on the first mismatch
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
