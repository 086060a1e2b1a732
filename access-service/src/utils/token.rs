use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hash a bearer token for storage.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of a presented token against a stored hash.
pub fn token_matches(stored_hash: &str, token: &str) -> bool {
    hash_token(token)
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .into()
}
