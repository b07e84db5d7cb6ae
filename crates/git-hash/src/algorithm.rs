use crate::{HashError, ObjectId};

/// Descriptor for a repository's object-id hash function.
///
/// The transfer machinery never hashes content; it only needs to know how
/// wide identifiers are, what the algorithm is called on the wire
/// (`object-format=<name>`), and how to parse hex forms of the right
/// width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-1 (default, 20 bytes / 160 bits).
    #[default]
    Sha1,
    /// SHA-256 (32 bytes / 256 bits).
    Sha256,
}

impl HashAlgorithm {
    /// Length of the raw digest in bytes.
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Length of the hex representation.
    pub const fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    /// The all-zeros identifier for this algorithm ("absent/deleted").
    pub const fn null_oid(&self) -> ObjectId {
        match self {
            Self::Sha1 => ObjectId::NULL_SHA1,
            Self::Sha256 => ObjectId::NULL_SHA256,
        }
    }

    /// Parse a hex identifier, requiring exactly this algorithm's width.
    pub fn parse_hex(&self, hex: &str) -> Result<ObjectId, HashError> {
        if hex.len() != self.hex_len() {
            return Err(HashError::InvalidHexLength {
                expected: self.hex_len(),
                actual: hex.len(),
            });
        }
        ObjectId::from_hex(hex)
    }

    /// Look up an algorithm by its `object-format` capability value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" | "sha-1" => Some(Self::Sha1),
            "sha256" | "sha-256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Look up an algorithm by raw digest length.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(Self::Sha1),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Look up an algorithm by hex length.
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// The name used in the `object-format` capability.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_and_hex_lengths() {
        assert_eq!(HashAlgorithm::Sha1.digest_len(), 20);
        assert_eq!(HashAlgorithm::Sha1.hex_len(), 40);
        assert_eq!(HashAlgorithm::Sha256.digest_len(), 32);
        assert_eq!(HashAlgorithm::Sha256.hex_len(), 64);
    }

    #[test]
    fn default_is_sha1() {
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Sha1);
    }

    #[test]
    fn null_oids() {
        for algo in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
            let null = algo.null_oid();
            assert!(null.is_null());
            assert_eq!(null.as_bytes().len(), algo.digest_len());
        }
    }

    #[test]
    fn from_name() {
        assert_eq!(HashAlgorithm::from_name("sha1"), Some(HashAlgorithm::Sha1));
        assert_eq!(
            HashAlgorithm::from_name("sha256"),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(HashAlgorithm::from_name("md5"), None);
    }

    #[test]
    fn parse_hex_enforces_width() {
        let sha1_hex = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        let oid = HashAlgorithm::Sha1.parse_hex(sha1_hex).unwrap();
        assert_eq!(oid.algorithm(), HashAlgorithm::Sha1);

        // A 40-char hex is not a valid SHA-256 id, even though it is a
        // valid SHA-1 id.
        let err = HashAlgorithm::Sha256.parse_hex(sha1_hex).unwrap_err();
        assert!(matches!(
            err,
            HashError::InvalidHexLength {
                expected: 64,
                actual: 40
            }
        ));
    }

    #[test]
    fn from_lengths() {
        assert_eq!(
            HashAlgorithm::from_digest_len(20),
            Some(HashAlgorithm::Sha1)
        );
        assert_eq!(HashAlgorithm::from_hex_len(64), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_digest_len(16), None);
    }
}
