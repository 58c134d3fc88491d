//! API key generation and digesting
//!
//! Keys follow the format `{prefix}_{random_base32}` with 192 bits of
//! entropy. The stored form is a BLAKE3 digest of the full plaintext;
//! authentication is a single lookup by digest. Keys are random, not
//! user-chosen, so no salted KDF is involved.

use rand::RngCore;

/// API key generator and digester
#[derive(Clone)]
pub struct ApiKeyGenerator {
    prefix: String,
}

impl ApiKeyGenerator {
    /// Create a generator with the given key prefix (e.g. "pk_live")
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generate a new API key
    ///
    /// Returns `(plaintext, digest)`. The plaintext is shown to the caller
    /// exactly once; only the digest is ever persisted.
    pub fn generate(&self) -> (String, String) {
        let mut random_bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut random_bytes);

        let key = format!("{}_{}", self.prefix, base32_encode(&random_bytes));
        let digest = Self::digest(&key);

        (key, digest)
    }

    /// One-way digest of a presented key (lowercase hex)
    pub fn digest(key: &str) -> String {
        blake3::hash(key.as_bytes()).to_hex().to_string()
    }

    /// The configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Encode bytes as lowercase base32 without padding
fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

    let mut result = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer = 0u64;
    let mut bits = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1f) as usize;
            result.push(ALPHABET[index] as char);
        }
    }

    if bits > 0 {
        let index = ((buffer << (5 - bits)) & 0x1f) as usize;
        result.push(ALPHABET[index] as char);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_format() {
        let generator = ApiKeyGenerator::new("pk_test");
        let (key, digest) = generator.generate();

        assert!(key.starts_with("pk_test_"));
        // 24 bytes -> ceil(192/5) = 39 base32 chars
        assert_eq!(key.len(), "pk_test_".len() + 39);
        // BLAKE3 hex digest
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_digest_is_deterministic_and_one_way() {
        let generator = ApiKeyGenerator::new("pk_test");
        let (key, digest) = generator.generate();

        assert_eq!(ApiKeyGenerator::digest(&key), digest);
        // The digest reveals nothing recognizable of the plaintext
        assert!(!digest.contains("pk_test"));
        assert_ne!(digest, key);
    }

    #[test]
    fn test_keys_are_unique() {
        let generator = ApiKeyGenerator::new("pk_test");
        let (a, _) = generator.generate();
        let (b, _) = generator.generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_base32_encoding() {
        assert_eq!(base32_encode(&[0]), "aa");
        assert_eq!(base32_encode(&[0xff]), "74");
        assert_eq!(base32_encode(b"hello"), "nbswy3dp");
    }
}
