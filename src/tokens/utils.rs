//! Refresh token generation and hashing.

use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::clock::RandomSource;

pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Create a new opaque refresh token.
///
/// The raw value only ever leaves through the cookie; storage keeps a hash.
pub fn generate_refresh_token(random: &dyn RandomSource) -> Result<String> {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    random
        .fill(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a refresh token so raw values never touch the database.
#[must_use]
pub fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::OsRandom;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn generated_tokens_decode_to_32_bytes() {
        let decoded_len = generate_refresh_token(&OsRandom)
            .ok()
            .and_then(|token| URL_SAFE_NO_PAD.decode(token.as_bytes()).ok())
            .map(|bytes| bytes.len());
        assert_eq!(decoded_len, Some(REFRESH_TOKEN_BYTES));
    }

    #[test]
    fn hash_is_stable() {
        let first = hash_refresh_token("token");
        assert_eq!(first, hash_refresh_token("token"));
        assert_ne!(first, hash_refresh_token("other"));
        assert_eq!(first.len(), 32);
    }
}
