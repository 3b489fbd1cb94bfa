use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};

use crate::{EdgepackError, EdgepackResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the SHA-256 digest of the given bytes.
pub fn sha256_digest(bytes: &[u8]) -> Digest {
    digest_from_sha256(Sha256::digest(bytes).as_slice())
}

/// Builds a [`Digest`] from a raw SHA-256 hash.
pub fn digest_from_sha256(hash: &[u8]) -> Digest {
    format!("sha256:{}", hex::encode(hash))
        .parse()
        .expect("a hex-encoded sha256 digest string is well-formed")
}

/// Parses a digest string of the form `<algorithm>:<hex>`.
pub fn parse_digest(s: &str) -> EdgepackResult<Digest> {
    s.parse::<Digest>()
        .map_err(|e| EdgepackError::InvalidInput(format!("invalid digest {}: {}", s, e)))
}

/// Returns the first twelve characters of a digest's hex portion, the way registries
/// abbreviate digests in status output.
pub fn short_digest(digest: &Digest) -> String {
    let encoded = digest.digest();
    encoded[..12.min(encoded.len())].to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_sha256_of_known_bytes() {
        let digest = sha256_digest(b"kernel");
        assert_eq!(digest.algorithm().to_string(), "sha256");
        assert_eq!(digest.digest().len(), 64);
        // Recomputing must be stable.
        assert_eq!(digest, sha256_digest(b"kernel"));
        assert_ne!(digest, sha256_digest(b"initrd"));
    }

    #[test]
    fn test_digest_parse_rejects_garbage() {
        assert!(parse_digest("not-a-digest").is_err());
        let hex = "a".repeat(64);
        assert!(parse_digest(&format!("sha256:{}", hex)).is_ok());
    }

    #[test]
    fn test_digest_short_form() {
        let digest = sha256_digest(b"abc");
        assert_eq!(short_digest(&digest).len(), 12);
        assert!(digest.digest().starts_with(&short_digest(&digest)));
    }
}
