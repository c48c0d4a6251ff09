//! Content digest helpers.

use sha2::{Digest as _, Sha256};

use crate::error::{AndockError, Result};

/// Compute the `sha256:{hex}` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Validate a `sha256:{64 hex}` digest and return its hex part.
pub fn parse_sha256(digest: &str) -> Result<&str> {
    let hex_part = digest.strip_prefix("sha256:").ok_or_else(|| {
        AndockError::InvalidRequest(format!("Unsupported digest algorithm: {}", digest))
    })?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AndockError::InvalidRequest(format!(
            "Malformed digest: {}",
            digest
        )));
    }
    Ok(hex_part)
}

/// Filesystem-safe name for a digest (`sha256:abc` → `sha256_abc`).
pub fn digest_dirname(digest: &str) -> String {
    digest.replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest_of_empty() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_sha256_rejects_bad_input() {
        assert!(parse_sha256("md5:abc").is_err());
        assert!(parse_sha256("sha256:xyz").is_err());
        let d = sha256_digest(b"hello");
        assert_eq!(parse_sha256(&d).unwrap().len(), 64);
    }

    #[test]
    fn test_digest_dirname() {
        assert_eq!(digest_dirname("sha256:abc"), "sha256_abc");
    }
}
