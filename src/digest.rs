//! SHA-256 digest references
//!
//! Every object in the registry tree is named by a SHA-256 digest, either as
//! a scoped blob path (`sha256/ab/abcd…`) or as a 71-byte link reference
//! (`sha256:abcd…`). This module parses, validates and renders those forms.

use crate::error::{Result, ScourError};
use md5::Md5;
use sha2::{Digest as _, Sha256};
use std::fmt;

const ALGORITHM: &str = "sha256";
const REFERENCE_PREFIX: &str = "sha256:";
const HASH_SIZE: usize = 32;

/// Size in bytes of a canonical link file (`sha256:` + 64 hex chars).
pub const REFERENCE_SIZE: u64 = (REFERENCE_PREFIX.len() + HASH_SIZE * 2) as u64;

/// A SHA-256 digest value.
///
/// Equality is byte-identity of the hash. The all-zero digest is reserved as
/// "not observed" and reported as invalid by [`Digest::is_valid`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: [u8; HASH_SIZE],
}

impl Digest {
    /// Parse a two-segment path: `[sha256, <64 hex>]`.
    pub fn from_path(components: &[&str]) -> Result<Self> {
        if components.len() != 2 {
            return Err(ScourError::InvalidDigest(format!(
                "digest path should contain exactly two components: {components:?}"
            )));
        }

        if components[0] != ALGORITHM {
            return Err(ScourError::InvalidDigest(format!(
                "only {ALGORITHM} is supported: {}",
                components[0]
            )));
        }

        Self::decode(components[1])
    }

    /// Parse a three-segment scoped path: `[sha256, <2 hex>, <64 hex>]`.
    ///
    /// The middle segment must equal the first two characters of the hash.
    pub fn from_scoped_path(components: &[&str]) -> Result<Self> {
        if components.len() != 3 {
            return Err(ScourError::InvalidDigest(format!(
                "scoped digest path should contain exactly three components: {components:?}"
            )));
        }

        if components[0] != ALGORITHM {
            return Err(ScourError::InvalidDigest(format!(
                "only {ALGORITHM} is supported: {}",
                components[0]
            )));
        }

        if components[2].len() < 2 || components[1].as_bytes() != &components[2].as_bytes()[0..2] {
            return Err(ScourError::InvalidDigest(format!(
                "digest needs to be prefixed with its first two characters: {components:?}"
            )));
        }

        Self::decode(components[2])
    }

    /// Parse link file contents: the byte string `sha256:<64 hex>`.
    pub fn from_reference(data: &[u8]) -> Result<Self> {
        let Some(hex_part) = data.strip_prefix(REFERENCE_PREFIX.as_bytes()) else {
            return Err(ScourError::InvalidDigest(format!(
                "digest reference should start with {REFERENCE_PREFIX}: {}",
                String::from_utf8_lossy(data)
            )));
        };

        let hex_part = std::str::from_utf8(hex_part).map_err(|_| {
            ScourError::InvalidDigest(format!(
                "digest reference is not valid UTF-8: {}",
                String::from_utf8_lossy(data)
            ))
        })?;

        Self::decode(hex_part)
    }

    /// Compute the digest of raw content.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            hash: hasher.finalize().into(),
        }
    }

    fn decode(hex_str: &str) -> Result<Self> {
        let mut hash = [0u8; HASH_SIZE];
        hex::decode_to_slice(hex_str, &mut hash).map_err(|_| {
            ScourError::InvalidDigest(format!("component should be valid {ALGORITHM}: {hex_str}"))
        })?;
        Ok(Self { hash })
    }

    /// Canonical 64-char hex form.
    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash)
    }

    /// `sha256/<hex>`
    pub fn path(&self) -> String {
        format!("{ALGORITHM}/{}", self.hex_hash())
    }

    /// `sha256/<hex[0..2]>/<hex>`
    pub fn scoped_path(&self) -> String {
        let hex = self.hex_hash();
        format!("{ALGORITHM}/{}/{hex}", &hex[0..2])
    }

    /// Canonical link file contents: `sha256:<hex>`.
    pub fn reference(&self) -> String {
        format!("{REFERENCE_PREFIX}{}", self.hex_hash())
    }

    /// The ETag an object store reports for a canonical link file holding
    /// this reference: quoted lowercase-hex MD5 of the reference bytes.
    ///
    /// Comparing this against advertised ETag metadata proves a link file's
    /// contents without reading it.
    pub fn etag(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.reference().as_bytes());
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// False for the reserved all-zero digest.
    pub fn is_valid(&self) -> bool {
        self.hash != [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex_hash())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.hex_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "abababababababababababababababababababababababababababababababab";

    #[test]
    fn test_from_path() {
        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        assert_eq!(digest.hex_hash(), HEX);
        assert!(digest.is_valid());

        assert!(Digest::from_path(&["sha512", HEX]).is_err());
        assert!(Digest::from_path(&[HEX]).is_err());
        assert!(Digest::from_path(&["sha256", "abcd"]).is_err());
        assert!(Digest::from_path(&["sha256", &HEX[..63]]).is_err());
    }

    #[test]
    fn test_from_scoped_path() {
        let digest = Digest::from_scoped_path(&["sha256", "ab", HEX]).unwrap();
        assert_eq!(digest.hex_hash(), HEX);

        // prefix must match the first two hex chars
        assert!(Digest::from_scoped_path(&["sha256", "cd", HEX]).is_err());
        assert!(Digest::from_scoped_path(&["sha256", HEX]).is_err());
    }

    #[test]
    fn test_scoped_path_round_trip() {
        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        let scoped = digest.scoped_path();
        let components: Vec<&str> = scoped.split('/').collect();
        let parsed = Digest::from_scoped_path(&components).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_from_reference() {
        let reference = format!("sha256:{HEX}");
        let digest = Digest::from_reference(reference.as_bytes()).unwrap();
        assert_eq!(digest.hex_hash(), HEX);
        assert_eq!(digest.reference(), reference);
        assert_eq!(reference.len() as u64, REFERENCE_SIZE);

        assert!(Digest::from_reference(b"md5:abcd").is_err());
        assert!(Digest::from_reference(HEX.as_bytes()).is_err());
    }

    #[test]
    fn test_etag() {
        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        assert_eq!(digest.etag(), "\"36f6769913c757cd5f39ec96e06ef47d\"");

        let other_hex = "0123456789abcdef".repeat(4);
        let other = Digest::from_path(&["sha256", other_hex.as_str()]).unwrap();
        assert_eq!(other.etag(), "\"6918b4167062a42562f5ae609a74f27b\"");
    }

    #[test]
    fn test_zero_digest_invalid() {
        assert!(!Digest::default().is_valid());
        let zero = Digest::from_path(&["sha256", &"0".repeat(64)]).unwrap();
        assert!(!zero.is_valid());
    }

    #[test]
    fn test_of_bytes() {
        let digest = Digest::of_bytes(b"hello world");
        assert_eq!(
            digest.hex_hash(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
