//! BLAKE3 content hashing for requests, artifacts, and captured tool output.

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash raw bytes. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Hex digest without the algorithm prefix, for use in file names.
pub fn digest_hex(hash: &str) -> &str {
    hash.strip_prefix("blake3:").unwrap_or(hash)
}

/// Combine several hashes (or strings) into one, order-sensitive.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_string_deterministic() {
        let a = hash_string("resource \"aws_s3_bucket\" \"main\" {}");
        let b = hash_string("resource \"aws_s3_bucket\" \"main\" {}");
        assert_eq!(a, b);
        assert!(a.starts_with("blake3:"));
        assert_eq!(a.len(), 7 + 64);
        assert_ne!(a, hash_string("resource \"aws_s3_bucket\" \"logs\" {}"));
    }

    #[test]
    fn test_hasher_composite_order_sensitive() {
        let ab = composite_hash(&["a", "b"]);
        let ba = composite_hash(&["b", "a"]);
        assert_ne!(ab, ba);
        // separator prevents "ab"+"" colliding with "a"+"b"
        assert_ne!(composite_hash(&["ab", ""]), ab);
    }

    #[test]
    fn test_hasher_digest_hex() {
        let h = hash_string("x");
        assert_eq!(digest_hex(&h).len(), 64);
        assert_eq!(digest_hex("plain"), "plain");
    }
}
