use md5::Context as Md5Context;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("unrecognized digest: {0}")]
    UnknownAlgorithm(String),
    #[error("unsupported digest algorithm name: {0}")]
    UnknownName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Infers the algorithm from the shape of a hex digest.
    pub fn guess(digest: &str) -> Result<Self, FingerprintError> {
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintError::UnknownAlgorithm(digest.to_string()));
        }
        match digest.len() {
            32 => Ok(DigestAlgorithm::Md5),
            64 => Ok(DigestAlgorithm::Sha256),
            _ => Err(FingerprintError::UnknownAlgorithm(digest.to_string())),
        }
    }

    pub fn parse(name: &str) -> Result<Self, FingerprintError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(FingerprintError::UnknownName(other.to_string())),
        }
    }

    pub fn digest(&self, content: &[u8]) -> String {
        let mut hasher = Hasher::new(*self);
        hasher.update(content);
        hasher.finish()
    }
}

/// Incremental digest used when content arrives in chunks.
pub enum Hasher {
    Md5(Md5Context),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Hasher::Md5(Md5Context::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(chunk),
            Hasher::Sha256(ctx) => ctx.update(chunk),
        }
    }

    pub fn finish(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha256(ctx) => format!("{:x}", ctx.finalize()),
        }
    }
}

/// Normalizes a remote digest for comparison against local fingerprints
/// computed with `local`. Digests in another algorithm cannot be compared and
/// are dropped.
pub fn normalize_remote(
    digest: Option<&str>,
    local: DigestAlgorithm,
) -> Result<Option<String>, FingerprintError> {
    let Some(digest) = digest.map(str::trim).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    let algorithm = DigestAlgorithm::guess(digest)?;
    if algorithm != local {
        return Ok(None);
    }
    Ok(Some(digest.to_ascii_lowercase()))
}

pub fn same_content(left: Option<&str>, right: Option<&str>) -> bool {
    match (left, right) {
        (Some(l), Some(r)) => l.eq_ignore_ascii_case(r),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_algorithm_from_digest_length() {
        assert_eq!(
            DigestAlgorithm::guess("5d41402abc4b2a76b9719d911017c592"),
            Ok(DigestAlgorithm::Md5)
        );
        assert_eq!(
            DigestAlgorithm::guess(
                "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            ),
            Ok(DigestAlgorithm::Sha256)
        );
        assert!(DigestAlgorithm::guess("abc").is_err());
        assert!(DigestAlgorithm::guess("zz41402abc4b2a76b9719d911017c592").is_err());
    }

    #[test]
    fn digests_known_values() {
        assert_eq!(
            DigestAlgorithm::Md5.digest(b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            DigestAlgorithm::Sha256.digest(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn remote_digest_in_other_algorithm_is_dropped() {
        let sha = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert_eq!(normalize_remote(Some(sha), DigestAlgorithm::Md5), Ok(None));
        assert_eq!(
            normalize_remote(Some("5D41402ABC4B2A76B9719D911017C592"), DigestAlgorithm::Md5),
            Ok(Some("5d41402abc4b2a76b9719d911017c592".to_string()))
        );
        assert!(normalize_remote(Some("nope"), DigestAlgorithm::Md5).is_err());
        assert_eq!(normalize_remote(None, DigestAlgorithm::Md5), Ok(None));
    }
}
