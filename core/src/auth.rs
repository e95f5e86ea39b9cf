use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a presented bearer token against the configured token's digest.
/// Digests are compared byte-for-byte without early exit.
pub fn token_matches(presented: &str, expected_hash: &str) -> bool {
    let presented_hash = hash_token(presented);
    if presented_hash.len() != expected_hash.len() {
        return false;
    }
    presented_hash
        .bytes()
        .zip(expected_hash.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// First 6 characters of a token for log lines; never log the full value.
pub fn token_hint(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}...")
}
