//! Server identity: reduce a remote server URL to a stable storage key.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest. Sixteen hex bytes
/// (64 bits) is ample to avoid collisions across the handful of servers a
/// single user configures, while keeping directory names short.
const HASH_HEX_LEN: usize = 16;

/// Stable hex digest of a server URL, used as the directory name under the
/// config root and as the coordination namespace for the Auth Coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerHash(String);

impl ServerHash {
    pub fn new(server_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(server_url.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(digest)[..HASH_HEX_LEN].to_string())
    }

    /// Wrap an already-computed hex digest, e.g. a directory name read back
    /// from the config root, without hashing it again.
    pub fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_url_yields_same_hash() {
        let a = ServerHash::new("https://example.com/sse");
        let b = ServerHash::new("https://example.com/sse");
        assert_eq!(a, b);
    }

    #[test]
    fn different_urls_yield_different_hashes() {
        let a = ServerHash::new("https://example.com/sse");
        let b = ServerHash::new("https://example.org/sse");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_fixed_length_lowercase_hex() {
        let h = ServerHash::new("https://example.com/sse");
        assert_eq!(h.as_str().len(), HASH_HEX_LEN);
        assert!(h.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
