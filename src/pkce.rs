//! PKCE (RFC 7636) verifier/challenge generation and CSRF state nonces.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::SmartError;

/// Random bytes behind each verifier (43 base64url characters)
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind each state nonce
const STATE_BYTES: usize = 16;

/// PKCE verifier/challenge pair using the S256 method
#[derive(Clone)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl std::fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("code_verifier", &"<redacted>")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}

impl PkceChallenge {
    /// Generate a fresh pair from the OS secure random source.
    ///
    /// Fails instead of falling back to a weaker generator.
    pub fn generate() -> Result<Self, SmartError> {
        let code_verifier = URL_SAFE_NO_PAD.encode(secure_random::<VERIFIER_BYTES>()?);
        let code_challenge = challenge_for(&code_verifier);
        Ok(Self {
            code_verifier,
            code_challenge,
        })
    }
}

/// base64url(SHA-256(verifier)), no padding
pub fn challenge_for(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Check a verifier against a stored challenge
pub fn verify_challenge(code_verifier: &str, code_challenge: &str) -> bool {
    challenge_for(code_verifier) == code_challenge
}

/// Fresh opaque state nonce for CSRF protection
pub fn generate_state() -> Result<String, SmartError> {
    Ok(URL_SAFE_NO_PAD.encode(secure_random::<STATE_BYTES>()?))
}

fn secure_random<const N: usize>() -> Result<[u8; N], SmartError> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SmartError::Crypto(e.to_string()))?;
    Ok(bytes)
}
