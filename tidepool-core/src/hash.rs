//! Stable hashing for keys and ring positions.
//!
//! `std::hash::Hash` output is not guaranteed to match across builds or
//! processes, so anything two nodes must agree on (key ownership, ring
//! positions) is hashed from bytes with SHA-256 instead.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::codec::{CodecError, MessageCodec};

/// Hash arbitrary bytes to a `u64` that is identical on every node.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Hash a serializable key through the node codec.
///
/// # Errors
///
/// Returns the codec error if the key cannot be encoded.
pub fn stable_key_hash<C: MessageCodec, K: Serialize>(codec: &C, key: &K) -> Result<u64, CodecError> {
    Ok(stable_hash(&codec.encode(key)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonCodec;

    #[test]
    fn test_stable_hash_is_deterministic() {
        assert_eq!(stable_hash(b"127.0.0.1:4500"), stable_hash(b"127.0.0.1:4500"));
        assert_ne!(stable_hash(b"127.0.0.1:4500"), stable_hash(b"127.0.0.1:4501"));
    }

    #[test]
    fn test_key_hash_matches_encoded_bytes() {
        let codec = JsonCodec;
        let via_key = stable_key_hash(&codec, &"alice").expect("hash");
        assert_eq!(via_key, stable_hash(br#""alice""#));
    }
}
